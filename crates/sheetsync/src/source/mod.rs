//! Relational source of rows to deliver.
//!
//! All sources implement [`SourceRepository`], so the engine never touches a
//! database driver directly.
//!
//! # Available Sources
//!
//! - [`MySqlSource`] - MySQL/MariaDB table with a boolean "sent" column
//! - [`crate::memory::MemorySource`] - in-memory table for tests

mod mysql;

pub use mysql::MySqlSource;

use async_trait::async_trait;
use sheetsync_core::{RowId, SourceRow};

use crate::Result;

/// Reads unsent rows and flags rows as sent.
#[async_trait]
pub trait SourceRepository: Send + Sync {
    /// All rows currently flagged unsent, in a stable order.
    ///
    /// An empty table (or no unsent rows) is `Ok(vec![])`, not an error.
    async fn fetch_unsent(&self) -> Result<Vec<SourceRow>>;

    /// Flag exactly the given rows as sent in a single atomic commit.
    ///
    /// On error no row of the batch is flagged. An empty batch is a no-op.
    async fn mark_sent(&self, ids: &[RowId]) -> Result<()>;
}
