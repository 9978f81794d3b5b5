//! In-memory source, sink and journal.
//!
//! Used by the engine tests and handy for dry runs. Each fake keeps call
//! counters and can be told to fail specific operations, so every failure
//! path of a pass can be driven without a database or network.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use sheetsync_core::{DestinationRow, RowId, SourceRow};

use crate::journal::{DeliveryJournal, DeliveryStatus};
use crate::sink::SinkRepository;
use crate::source::SourceRepository;
use crate::{Error, Result};

fn injected(operation: &'static str) -> Error {
    Error::Connection {
        operation,
        message: "injected failure".to_string(),
    }
}

#[derive(Default)]
struct SourceState {
    rows: Vec<(SourceRow, bool)>,
    fail_fetch: bool,
    fail_mark: bool,
    fetch_calls: usize,
    mark_calls: usize,
}

/// Table of rows with a sent flag.
#[derive(Default)]
pub struct MemorySource {
    state: Mutex<SourceState>,
}

impl MemorySource {
    /// A table where every given row is unsent.
    pub fn new(rows: Vec<SourceRow>) -> Self {
        Self {
            state: Mutex::new(SourceState {
                rows: rows.into_iter().map(|r| (r, false)).collect(),
                ..Default::default()
            }),
        }
    }

    /// Insert another unsent row, as a concurrent writer would.
    pub fn insert(&self, row: SourceRow) {
        self.state.lock().rows.push((row, false));
    }

    pub fn is_sent(&self, id: &RowId) -> bool {
        self.state
            .lock()
            .rows
            .iter()
            .any(|(row, sent)| *sent && &row.id == id)
    }

    pub fn sent_ids(&self) -> Vec<RowId> {
        self.state
            .lock()
            .rows
            .iter()
            .filter(|(_, sent)| *sent)
            .map(|(row, _)| row.id.clone())
            .collect()
    }

    pub fn fail_fetch(&self, fail: bool) {
        self.state.lock().fail_fetch = fail;
    }

    pub fn fail_mark(&self, fail: bool) {
        self.state.lock().fail_mark = fail;
    }

    pub fn fetch_calls(&self) -> usize {
        self.state.lock().fetch_calls
    }

    pub fn mark_calls(&self) -> usize {
        self.state.lock().mark_calls
    }
}

#[async_trait]
impl SourceRepository for MemorySource {
    async fn fetch_unsent(&self) -> Result<Vec<SourceRow>> {
        let mut state = self.state.lock();
        state.fetch_calls += 1;
        if state.fail_fetch {
            return Err(injected("fetch_unsent"));
        }
        Ok(state
            .rows
            .iter()
            .filter(|(_, sent)| !*sent)
            .map(|(row, _)| row.clone())
            .collect())
    }

    async fn mark_sent(&self, ids: &[RowId]) -> Result<()> {
        let mut state = self.state.lock();
        state.mark_calls += 1;
        if state.fail_mark {
            return Err(Error::Write {
                operation: "mark_sent",
                message: "injected failure".to_string(),
            });
        }
        for (row, sent) in state.rows.iter_mut() {
            if ids.contains(&row.id) {
                *sent = true;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct SinkState {
    rows: Vec<DestinationRow>,
    accept_limit: Option<usize>,
    report_zero: bool,
    over_report: usize,
    fail_fetch: bool,
    fail_fetch_after: Option<usize>,
    fail_append: bool,
    fetch_calls: usize,
    append_calls: usize,
}

/// Spreadsheet range.
///
/// Rows pass through their JSON encoding on the way in, so values come back
/// the way a spreadsheet would return them (whole floats as integers and so
/// on).
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<SinkState>,
}

impl MemorySink {
    pub fn new(rows: Vec<DestinationRow>) -> Self {
        let sink = Self::default();
        sink.state.lock().rows = rows;
        sink
    }

    pub fn rows(&self) -> Vec<DestinationRow> {
        self.state.lock().rows.clone()
    }

    /// Store at most `limit` rows per append and confirm only those.
    pub fn accept_at_most(&self, limit: usize) {
        self.state.lock().accept_limit = Some(limit);
    }

    /// Store appended rows but confirm zero of them.
    pub fn report_zero(&self, zero: bool) {
        self.state.lock().report_zero = zero;
    }

    /// Confirm `extra` more rows than were stored.
    pub fn over_report(&self, extra: usize) {
        self.state.lock().over_report = extra;
    }

    pub fn fail_fetch(&self, fail: bool) {
        self.state.lock().fail_fetch = fail;
    }

    /// Let `calls` more reads succeed, then fail every read after them.
    pub fn fail_fetch_after(&self, calls: usize) {
        self.state.lock().fail_fetch_after = Some(calls);
    }

    pub fn fail_append(&self, fail: bool) {
        self.state.lock().fail_append = fail;
    }

    pub fn fetch_calls(&self) -> usize {
        self.state.lock().fetch_calls
    }

    pub fn append_calls(&self) -> usize {
        self.state.lock().append_calls
    }
}

#[async_trait]
impl SinkRepository for MemorySink {
    async fn fetch_existing(&self) -> Result<Vec<DestinationRow>> {
        let mut state = self.state.lock();
        state.fetch_calls += 1;
        if let Some(remaining) = state.fail_fetch_after.as_mut() {
            if *remaining == 0 {
                return Err(injected("fetch_existing"));
            }
            *remaining -= 1;
        }
        if state.fail_fetch {
            return Err(injected("fetch_existing"));
        }
        Ok(state.rows.clone())
    }

    async fn append_rows(&self, rows: &[DestinationRow]) -> Result<usize> {
        let mut state = self.state.lock();
        state.append_calls += 1;
        if state.fail_append {
            return Err(Error::QuotaExceeded {
                operation: "append_rows",
                retry_after: None,
            });
        }
        let accepted = state.accept_limit.unwrap_or(rows.len()).min(rows.len());
        for row in &rows[..accepted] {
            state.rows.push(DestinationRow::from_json(&row.to_json()));
        }
        if state.report_zero {
            return Ok(0);
        }
        Ok(accepted + state.over_report)
    }
}

/// Journal kept in a map. Not durable.
#[derive(Default)]
pub struct MemoryJournal {
    entries: Mutex<HashMap<RowId, DeliveryStatus>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeliveryJournal for MemoryJournal {
    fn record_pending(&self, ids: &[RowId]) -> Result<()> {
        let mut entries = self.entries.lock();
        for id in ids {
            entries.insert(id.clone(), DeliveryStatus::Pending);
        }
        Ok(())
    }

    fn mark_delivered(&self, ids: &[RowId]) -> Result<()> {
        let mut entries = self.entries.lock();
        for id in ids {
            entries.insert(id.clone(), DeliveryStatus::Delivered);
        }
        Ok(())
    }

    fn status(&self, id: &RowId) -> Result<Option<DeliveryStatus>> {
        Ok(self.entries.lock().get(id).copied())
    }

    fn pending(&self) -> Result<Vec<RowId>> {
        let mut ids: Vec<RowId> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, status)| **status == DeliveryStatus::Pending)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn forget(&self, ids: &[RowId]) -> Result<()> {
        let mut entries = self.entries.lock();
        for id in ids {
            entries.remove(id);
        }
        Ok(())
    }
}
