//! Remote tabular destination.
//!
//! # Available Sinks
//!
//! - [`SheetsSink`] - a Google Sheets range through the Sheets v4 REST API
//! - [`crate::memory::MemorySink`] - in-memory range for tests

mod credentials;
mod sheets;

pub use credentials::Credentials;
pub use sheets::SheetsSink;

use async_trait::async_trait;
use sheetsync_core::DestinationRow;

use crate::Result;

/// Reads and appends rows of a single destination range.
#[async_trait]
pub trait SinkRepository: Send + Sync {
    /// Every row currently stored in the range, top to bottom.
    ///
    /// An empty or absent range is `Ok(vec![])`, not an error.
    async fn fetch_existing(&self) -> Result<Vec<DestinationRow>>;

    /// Append rows after the existing content, in order, without shifting or
    /// overwriting anything.
    ///
    /// Returns how many rows the destination confirms were added. This equals
    /// `rows.len()` unless the destination reports partial acceptance.
    async fn append_rows(&self, rows: &[DestinationRow]) -> Result<usize>;
}
