//! Core types and shared utilities for the sheetsync pipeline.
//!
//! This crate provides:
//! - The typed row model moved from the source table to the spreadsheet
//!   ([`SourceRow`], [`DestinationRow`], [`DedupKey`])
//! - The [`SyncOutcome`] reported by every sync pass
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
pub mod metrics;
mod outcome;
mod row;

pub use error::{Error, Result};
pub use outcome::SyncOutcome;
pub use row::{Cell, DedupKey, DestinationRow, RowId, SourceRow, Trailer};
