//! Delivery journal using RocksDB.
//!
//! This module provides the [`RocksJournal`] which tracks which source rows
//! have been handed to the destination. Ids are recorded as `Pending` before
//! the append and flipped to `Delivered` once the source has flagged them
//! sent, so a crash between the two steps is recognizable on the next pass.
//!
//! # Key Design
//!
//! - Keys: 1 status prefix byte + [`RowId::to_key_bytes`]
//!   (`p` pending, `d` delivered), so pending ids are one short prefix scan
//!   however many delivered rows accumulate
//! - Values: empty
//! - Every write is a synced batch that moves an id between prefixes

use crate::error::Result;
use rocksdb::{
    DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, WriteBatch, WriteOptions,
};
use sheetsync_core::RowId;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Delivery state of a journaled id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Row is about to be (or was) appended, but not yet flagged sent.
    Pending,
    /// Row was appended and flagged sent in the source.
    Delivered,
}

impl DeliveryStatus {
    fn prefix(self) -> u8 {
        match self {
            Self::Pending => PREFIX_PENDING,
            Self::Delivered => PREFIX_DELIVERED,
        }
    }

    fn other(self) -> Self {
        match self {
            Self::Pending => Self::Delivered,
            Self::Delivered => Self::Pending,
        }
    }
}

const PREFIX_PENDING: u8 = b'p';
const PREFIX_DELIVERED: u8 = b'd';

fn journal_key(status: DeliveryStatus, id: &RowId) -> Vec<u8> {
    let mut key = vec![status.prefix()];
    key.extend_from_slice(&id.to_key_bytes());
    key
}

/// Write-ahead record of rows handed to the destination.
///
/// Implementations must make `record_pending` durable before returning.
pub trait DeliveryJournal: Send + Sync {
    /// Record ids as `Pending`. Called before the append.
    fn record_pending(&self, ids: &[RowId]) -> Result<()>;

    /// Record ids as `Delivered`. Called after the source flagged them sent.
    fn mark_delivered(&self, ids: &[RowId]) -> Result<()>;

    /// Status of an id, `None` if never recorded.
    fn status(&self, id: &RowId) -> Result<Option<DeliveryStatus>>;

    /// All ids still `Pending`.
    fn pending(&self) -> Result<Vec<RowId>>;

    /// Drop ids from the journal entirely.
    fn forget(&self, ids: &[RowId]) -> Result<()>;
}

/// RocksDB-backed [`DeliveryJournal`].
///
/// Thread-safe: can be shared across tasks via `Arc<RocksJournal>`.
pub struct RocksJournal {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl RocksJournal {
    /// Open or create a journal at the given path.
    ///
    /// ```no_run
    /// use sheetsync::RocksJournal;
    ///
    /// let journal = RocksJournal::open("./data/journal")?;
    /// # Ok::<(), sheetsync::Error>(())
    /// ```
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening delivery journal at {}", path.display());
        Self::open_with(path, journal_options(true))
    }

    /// Open a journal that must already exist.
    pub fn open_existing<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path.as_ref(), journal_options(false))
    }

    fn open_with(path: &Path, opts: Options) -> Result<Self> {
        let db = DBWithThreadMode::<MultiThreaded>::open(&opts, path)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Run RocksDB's repair on a journal that no longer opens.
    pub fn repair<P: AsRef<Path>>(path: P) -> Result<()> {
        rocksdb::DB::repair(&journal_options(false), path.as_ref())?;
        Ok(())
    }

    fn write_status(&self, ids: &[RowId], status: DeliveryStatus) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut batch = WriteBatch::default();
        for id in ids {
            batch.delete(journal_key(status.other(), id));
            batch.put(journal_key(status, id), b"");
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(batch, &write_opts)?;
        debug!("Recorded {} ids as {:?}", ids.len(), status);
        Ok(())
    }

    /// Ids stored under one status prefix, skipping (and logging)
    /// undecodable ones.
    fn scan(&self, status: DeliveryStatus) -> Result<(Vec<RowId>, u64)> {
        let prefix = [status.prefix()];
        let mut ids = Vec::new();
        let mut invalid = 0u64;
        for item in self
            .db
            .iterator(IteratorMode::From(&prefix, Direction::Forward))
        {
            let (key, _) = item?;
            let Some(id_bytes) = key.strip_prefix(&prefix) else {
                break;
            };
            match RowId::from_key_bytes(id_bytes) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    warn!("Skipping undecodable journal key: {}", e);
                    invalid += 1;
                }
            }
        }
        Ok((ids, invalid))
    }

    /// Count entries by status. Scans the whole journal.
    pub fn stats(&self) -> Result<JournalStats> {
        let (pending, invalid_pending) = self.scan(DeliveryStatus::Pending)?;
        let (delivered, invalid_delivered) = self.scan(DeliveryStatus::Delivered)?;
        Ok(JournalStats {
            pending: pending.len() as u64,
            delivered: delivered.len() as u64,
            invalid: invalid_pending + invalid_delivered,
        })
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl DeliveryJournal for RocksJournal {
    fn record_pending(&self, ids: &[RowId]) -> Result<()> {
        self.write_status(ids, DeliveryStatus::Pending)
    }

    fn mark_delivered(&self, ids: &[RowId]) -> Result<()> {
        self.write_status(ids, DeliveryStatus::Delivered)
    }

    fn status(&self, id: &RowId) -> Result<Option<DeliveryStatus>> {
        for status in [DeliveryStatus::Pending, DeliveryStatus::Delivered] {
            if self.db.get_pinned(journal_key(status, id))?.is_some() {
                return Ok(Some(status));
            }
        }
        Ok(None)
    }

    fn pending(&self) -> Result<Vec<RowId>> {
        Ok(self.scan(DeliveryStatus::Pending)?.0)
    }

    fn forget(&self, ids: &[RowId]) -> Result<()> {
        let mut batch = WriteBatch::default();
        for id in ids {
            batch.delete(journal_key(DeliveryStatus::Pending, id));
            batch.delete(journal_key(DeliveryStatus::Delivered, id));
        }
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

fn journal_options(create_if_missing: bool) -> Options {
    let mut opts = Options::default();
    opts.create_if_missing(create_if_missing);

    // Small, point-lookup heavy workload
    opts.set_write_buffer_size(8 * 1024 * 1024);
    let mut block_opts = rocksdb::BlockBasedOptions::default();
    block_opts.set_bloom_filter(10.0, false);
    opts.set_block_based_table_factory(&block_opts);

    opts.increase_parallelism(num_cpus::get().min(4) as i32);
    opts
}

/// Entry counts in the journal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalStats {
    pub pending: u64,
    pub delivered: u64,
    /// Entries whose id bytes do not decode.
    pub invalid: u64,
}
