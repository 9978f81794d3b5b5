//! Sheetsync: exactly-once delivery of unsent table rows into a spreadsheet.
//!
//! # Modules
//!
//! - [`source`] - Relational source adapters (MySQL)
//! - [`sink`] - Spreadsheet sink adapters (Google Sheets)
//! - [`journal`] - Write-ahead delivery journal (RocksDB)
//! - [`engine`] - The sync pass
//! - [`memory`] - In-memory source, sink and journal
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  MySqlSource    │  unsent rows (sent flag = 0)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐      ┌─────────────────┐
//! │   SyncEngine    │◄────►│  RocksJournal   │  pending / delivered ids
//! └────────┬────────┘      └─────────────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │   SheetsSink    │  read range, dedupe, append
//! └─────────────────┘
//! ```
//!
//! The source table is the record of what still needs delivering; the
//! spreadsheet is only ever appended to. A row is flagged sent only after the
//! spreadsheet confirmed it.

pub mod config;
pub mod engine;
pub mod error;
pub mod journal;
pub mod memory;
pub mod sink;
pub mod source;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use config::{SinkConfig, SourceConfig, SyncConfig, spreadsheet_id_from_ref};
pub use engine::SyncEngine;
pub use journal::{DeliveryJournal, DeliveryStatus, JournalStats, RocksJournal};
pub use sink::{Credentials, SheetsSink, SinkRepository};
pub use source::{MySqlSource, SourceRepository};

pub use sheetsync_core::{Cell, DestinationRow, RowId, SourceRow, SyncOutcome, Trailer};
