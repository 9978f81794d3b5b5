//! The sync pass: fetch, dedupe, append, mark.
//!
//! A pass reads every unsent source row, drops the ones whose dedup key is
//! already in the destination, appends the rest in one call and flags exactly
//! the appended rows as sent.
//!
//! Ids are journaled as `Pending` before the append. If the process dies after
//! the append but before the source is flagged, the next pass finds those rows
//! in the destination with a `Pending` journal entry and marks them without
//! appending again. Rows found in the destination without a `Pending` entry
//! are merely "already present": they are neither appended nor marked.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use sheetsync_core::metrics::{increment, record_outcome, set_gauge};
use sheetsync_core::{DedupKey, DestinationRow, RowId, SyncOutcome, Trailer};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::journal::{DeliveryJournal, DeliveryStatus, RocksJournal};
use crate::sink::{SheetsSink, SinkRepository};
use crate::source::{MySqlSource, SourceRepository};
use crate::{Error, Result};

/// A destination row queued for append and every source id it stands for.
///
/// Candidates with identical keys collapse into one row.
struct Queued {
    ids: Vec<RowId>,
    row: DestinationRow,
}

/// Runs sync passes against one source, one sink and one journal.
///
/// Passes must not overlap: run them sequentially from a single task.
pub struct SyncEngine<S, K, J> {
    source: Arc<S>,
    sink: Arc<K>,
    journal: Arc<J>,
    trailer: Trailer,
}

impl SyncEngine<MySqlSource, SheetsSink, RocksJournal> {
    /// Connect the production collaborators described by `config`.
    ///
    /// The source is connected first, so an unreachable database is reported
    /// before credentials or the journal are touched.
    pub async fn connect(config: &SyncConfig) -> Result<Self> {
        config.validate()?;

        let source = MySqlSource::connect(&config.source).await?;
        let sink = SheetsSink::from_config(config.sink.clone())?;
        let journal = RocksJournal::open(&config.journal_path)?;

        Ok(Self::new(
            Arc::new(source),
            Arc::new(sink),
            Arc::new(journal),
            config.trailer.clone(),
        ))
    }
}

impl<S, K, J> SyncEngine<S, K, J>
where
    S: SourceRepository,
    K: SinkRepository,
    J: DeliveryJournal,
{
    pub fn new(source: Arc<S>, sink: Arc<K>, journal: Arc<J>, trailer: Trailer) -> Self {
        Self {
            source,
            sink,
            journal,
            trailer,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn journal(&self) -> &J {
        &self.journal
    }

    /// Run one pass and record its metrics.
    pub async fn run_pass(&self) -> Result<SyncOutcome> {
        let start = Instant::now();
        let result = self.pass().await;
        metrics::histogram!("sync_pass_duration_seconds").record(start.elapsed().as_secs_f64());

        match &result {
            Ok(outcome) => {
                record_outcome(outcome);
                info!(outcome = outcome.kind(), "{}", outcome);
            }
            Err(e) => {
                increment("sync_pass_errors_total", 1);
                warn!(connection = e.is_connection(), "Sync pass failed: {}", e);
            }
        }

        match self.journal.pending() {
            Ok(pending) => set_gauge("sync_journal_pending", pending.len() as f64),
            Err(e) => warn!("Could not count pending journal entries: {}", e),
        }

        result
    }

    async fn pass(&self) -> Result<SyncOutcome> {
        let candidates = self.source.fetch_unsent().await?;
        if candidates.is_empty() {
            debug!("No unsent rows");
            return Ok(SyncOutcome::NothingToDo);
        }
        increment("sync_candidates_total", candidates.len() as u64);
        info!("Fetched {} unsent rows", candidates.len());

        // Never append without having read the destination first.
        let existing = self.sink.fetch_existing().await?;
        let present: HashSet<DedupKey> = existing.iter().map(DestinationRow::dedup_key).collect();
        info!(
            "Destination holds {} rows ({} distinct keys)",
            existing.len(),
            present.len()
        );

        let trailer = self.trailer.resolve(Utc::now());
        let mut queued: Vec<Queued> = Vec::new();
        let mut queued_index: HashMap<DedupKey, usize> = HashMap::new();
        let mut recovered: Vec<RowId> = Vec::new();
        let mut already_present = 0usize;

        for candidate in &candidates {
            let row = candidate.to_destination(&trailer);
            let key = row.dedup_key();

            if present.contains(&key) {
                if self.journal.status(&candidate.id)? == Some(DeliveryStatus::Pending) {
                    recovered.push(candidate.id.clone());
                } else {
                    already_present += 1;
                }
            } else if let Some(&slot) = queued_index.get(&key) {
                debug!(id = %candidate.id, "Duplicate key within batch, sharing one row");
                queued[slot].ids.push(candidate.id.clone());
            } else {
                queued_index.insert(key, queued.len());
                queued.push(Queued {
                    ids: vec![candidate.id.clone()],
                    row,
                });
            }
        }
        increment("sync_rows_already_present_total", already_present as u64);

        if !recovered.is_empty() {
            warn!(
                "Recovering {} rows appended by an interrupted pass",
                recovered.len()
            );
            self.source.mark_sent(&recovered).await?;
            self.journal.mark_delivered(&recovered)?;
            increment("sync_rows_recovered_total", recovered.len() as u64);
        }

        if queued.is_empty() {
            return Ok(if recovered.is_empty() {
                SyncOutcome::NothingNew {
                    candidates: candidates.len(),
                    already_present,
                }
            } else {
                SyncOutcome::Recovered {
                    marked: recovered.len(),
                }
            });
        }

        let queued_ids: Vec<RowId> = queued.iter().flat_map(|q| q.ids.iter().cloned()).collect();
        let rows: Vec<DestinationRow> = queued.iter().map(|q| q.row.clone()).collect();
        let requested = rows.len();

        self.journal.record_pending(&queued_ids)?;
        info!("Appending {} rows", requested);
        let confirmed = self.sink.append_rows(&rows).await?;

        if confirmed == 0 {
            warn!(
                requested,
                "Destination confirmed no rows; nothing will be marked"
            );
            return Ok(SyncOutcome::NothingWritten {
                attempted: requested,
            });
        }

        let marked = if confirmed == requested {
            queued_ids
        } else {
            warn!(
                requested,
                confirmed, "Destination confirmed a different row count, verifying"
            );
            self.verified_ids(&queued).await?
        };

        self.source.mark_sent(&marked).await?;
        self.journal.mark_delivered(&marked)?;
        info!("Marked {} rows as sent", marked.len());

        if confirmed == requested {
            return Ok(SyncOutcome::Written {
                appended: confirmed,
                marked: marked.len(),
                recovered: recovered.len(),
            });
        }

        let marked_set: HashSet<&RowId> = marked.iter().collect();
        let unconfirmed: Vec<RowId> = queued
            .iter()
            .flat_map(|q| q.ids.iter())
            .filter(|id| !marked_set.contains(id))
            .cloned()
            .collect();

        // Every queued row is in the destination despite the odd count.
        if unconfirmed.is_empty() {
            warn!(
                requested,
                confirmed, "Row count mismatch, but every appended row was verified present"
            );
            return Ok(SyncOutcome::Written {
                appended: requested,
                marked: marked.len(),
                recovered: recovered.len(),
            });
        }

        Ok(SyncOutcome::PartialWrite {
            requested,
            confirmed,
            marked: marked.len(),
            unconfirmed,
        })
    }

    /// Ids of queued rows whose key is in the destination after the append.
    ///
    /// A failed read propagates, so nothing is marked on guesswork.
    async fn verified_ids(&self, queued: &[Queued]) -> Result<Vec<RowId>> {
        let after = self.sink.fetch_existing().await.map_err(|e| {
            warn!("Verification read failed, marking nothing: {}", e);
            e
        })?;
        let present: HashSet<DedupKey> = after.iter().map(DestinationRow::dedup_key).collect();

        Ok(queued
            .iter()
            .filter(|q| present.contains(&q.row.dedup_key()))
            .flat_map(|q| q.ids.iter().cloned())
            .collect())
    }
}

/// Convenience for the binary: whether an error is worth retrying next pass.
pub fn is_transient(error: &Error) -> bool {
    matches!(
        error,
        Error::Connection { .. } | Error::QuotaExceeded { .. } | Error::Sink { status: 500.., .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryJournal, MemorySink, MemorySource};
    use sheetsync_core::{Cell, SourceRow};

    type Engine = SyncEngine<MemorySource, MemorySink, MemoryJournal>;

    fn src(id: i64, fields: &[&str]) -> SourceRow {
        SourceRow::new(RowId::Int(id), fields.iter().map(|f| Cell::from(*f)).collect())
    }

    fn dst(cells: Vec<Cell>) -> DestinationRow {
        DestinationRow::new(cells)
    }

    fn engine(source: Vec<SourceRow>, sink: Vec<DestinationRow>) -> Engine {
        SyncEngine::new(
            Arc::new(MemorySource::new(source)),
            Arc::new(MemorySink::new(sink)),
            Arc::new(MemoryJournal::new()),
            Trailer::Fixed("synced".to_string()),
        )
    }

    #[tokio::test]
    async fn test_nothing_to_do_skips_destination() {
        let engine = engine(vec![], vec![]);
        let outcome = engine.run_pass().await.unwrap();

        assert_eq!(outcome, SyncOutcome::NothingToDo);
        assert_eq!(engine.sink().fetch_calls(), 0);
        assert_eq!(engine.sink().append_calls(), 0);
        assert_eq!(engine.source().mark_calls(), 0);
    }

    #[tokio::test]
    async fn test_writes_new_rows_and_marks_them() {
        let engine = engine(vec![src(1, &["Ana", "30"]), src(2, &["Bia", "25"])], vec![]);
        let outcome = engine.run_pass().await.unwrap();

        assert_eq!(
            outcome,
            SyncOutcome::Written {
                appended: 2,
                marked: 2,
                recovered: 0
            }
        );
        let rows = engine.sink().rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0],
            dst(vec![
                Cell::Int(1),
                Cell::from("Ana"),
                Cell::from("30"),
                Cell::from("synced")
            ])
        );
        assert_eq!(engine.source().sent_ids(), vec![RowId::Int(1), RowId::Int(2)]);
        assert_eq!(
            engine.journal().status(&RowId::Int(1)).unwrap(),
            Some(DeliveryStatus::Delivered)
        );
    }

    #[tokio::test]
    async fn test_dedup_against_existing_rows() {
        // (1,"a") is already in the sheet with a trailer; (2,"b") is not.
        let engine = engine(
            vec![src(1, &["a"]), src(2, &["b"])],
            vec![
                dst(vec![Cell::Int(1), Cell::from("a"), Cell::from("x")]),
                dst(vec![Cell::Int(3), Cell::from("c"), Cell::from("y")]),
            ],
        );
        let outcome = engine.run_pass().await.unwrap();

        assert_eq!(outcome.rows_appended(), 1);
        let rows = engine.sink().rows();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2].cells()[0], Cell::Int(2));
        assert!(engine.source().is_sent(&RowId::Int(2)));
        assert!(!engine.source().is_sent(&RowId::Int(1)));
    }

    #[tokio::test]
    async fn test_only_missing_candidate_is_inserted() {
        let engine = engine(
            vec![src(1, &["a"]), src(3, &["c"])],
            vec![
                dst(vec![Cell::Int(1), Cell::from("a"), Cell::from("x")]),
                dst(vec![Cell::Int(2), Cell::from("b"), Cell::from("y")]),
            ],
        );
        let outcome = engine.run_pass().await.unwrap();

        assert_eq!(
            outcome,
            SyncOutcome::Written {
                appended: 1,
                marked: 1,
                recovered: 0
            }
        );
        let rows = engine.sink().rows();
        assert_eq!(rows.len(), 3);
        assert_eq!(&rows[2].cells()[..2], &[Cell::Int(3), Cell::from("c")]);
        assert_eq!(engine.source().sent_ids(), vec![RowId::Int(3)]);
    }

    #[tokio::test]
    async fn test_trailer_does_not_affect_dedup() {
        let engine = engine(
            vec![src(1, &["a"])],
            vec![dst(vec![Cell::Int(1), Cell::from("a"), Cell::from("anything else")])],
        );
        let outcome = engine.run_pass().await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::NothingNew {
                candidates: 1,
                already_present: 1
            }
        );
    }

    #[tokio::test]
    async fn test_dedup_ignores_destination_type_changes() {
        // The sheet hands back "30" as text and 7.0 as a float.
        let engine = engine(
            vec![SourceRow::new(RowId::Int(7), vec![Cell::Int(30)])],
            vec![dst(vec![Cell::Float(7.0), Cell::from("30"), Cell::from("t")])],
        );
        let outcome = engine.run_pass().await.unwrap();
        assert_eq!(outcome.kind(), "nothing_new");
        assert_eq!(engine.sink().append_calls(), 0);
    }

    #[tokio::test]
    async fn test_nothing_new_marks_nothing() {
        let engine = engine(
            vec![src(1, &["a"])],
            vec![dst(vec![Cell::Int(1), Cell::from("a"), Cell::from("x")])],
        );
        let outcome = engine.run_pass().await.unwrap();

        assert_eq!(outcome.kind(), "nothing_new");
        assert_eq!(engine.sink().append_calls(), 0);
        assert_eq!(engine.source().mark_calls(), 0);
        assert!(!engine.source().is_sent(&RowId::Int(1)));
    }

    #[tokio::test]
    async fn test_second_pass_is_idempotent() {
        let engine = engine(vec![src(1, &["a"]), src(2, &["b"])], vec![]);
        engine.run_pass().await.unwrap();
        let after_first = engine.sink().rows();

        let outcome = engine.run_pass().await.unwrap();
        assert_eq!(outcome, SyncOutcome::NothingToDo);
        assert_eq!(engine.sink().rows(), after_first);
    }

    #[tokio::test]
    async fn test_rows_inserted_between_passes_are_picked_up() {
        let engine = engine(vec![src(1, &["a"])], vec![]);
        engine.run_pass().await.unwrap();

        engine.source().insert(src(2, &["b"]));
        let outcome = engine.run_pass().await.unwrap();
        assert_eq!(outcome.rows_appended(), 1);
        assert_eq!(engine.sink().rows().len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_unsent_failure_propagates() {
        let engine = engine(vec![src(1, &["a"])], vec![]);
        engine.source().fail_fetch(true);

        let err = engine.run_pass().await.unwrap_err();
        assert!(err.is_connection());
        assert_eq!(engine.sink().fetch_calls(), 0);
    }

    #[tokio::test]
    async fn test_fetch_existing_failure_never_appends() {
        let engine = engine(vec![src(1, &["a"])], vec![]);
        engine.sink().fail_fetch(true);

        assert!(engine.run_pass().await.is_err());
        assert_eq!(engine.sink().append_calls(), 0);
        assert_eq!(engine.source().mark_calls(), 0);
    }

    #[tokio::test]
    async fn test_append_failure_marks_nothing() {
        let engine = engine(vec![src(1, &["a"])], vec![]);
        engine.sink().fail_append(true);

        let err = engine.run_pass().await.unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { .. }));
        assert_eq!(engine.source().mark_calls(), 0);
        assert!(engine.source().sent_ids().is_empty());
    }

    #[tokio::test]
    async fn test_mark_failure_recovers_on_next_pass() {
        let engine = engine(vec![src(1, &["a"]), src(2, &["b"])], vec![]);
        engine.source().fail_mark(true);

        let err = engine.run_pass().await.unwrap_err();
        assert!(matches!(err, Error::Write { .. }));
        assert_eq!(engine.sink().rows().len(), 2);
        assert_eq!(
            engine.journal().pending().unwrap(),
            vec![RowId::Int(1), RowId::Int(2)]
        );

        engine.source().fail_mark(false);
        let outcome = engine.run_pass().await.unwrap();
        assert_eq!(outcome, SyncOutcome::Recovered { marked: 2 });
        // Recovered rows are never appended twice.
        assert_eq!(engine.sink().rows().len(), 2);
        assert_eq!(engine.sink().append_calls(), 1);
        assert_eq!(engine.source().sent_ids().len(), 2);
        assert!(engine.journal().pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recovery_alongside_new_rows() {
        let engine = engine(vec![src(1, &["a"])], vec![]);
        engine.source().fail_mark(true);
        assert!(engine.run_pass().await.is_err());

        engine.source().fail_mark(false);
        engine.source().insert(src(2, &["b"]));
        let outcome = engine.run_pass().await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Written {
                appended: 1,
                marked: 1,
                recovered: 1
            }
        );
        assert_eq!(engine.sink().rows().len(), 2);
        assert_eq!(engine.source().sent_ids().len(), 2);
    }

    #[tokio::test]
    async fn test_partial_acceptance_marks_only_verified_rows() {
        let engine = engine(
            vec![src(1, &["a"]), src(2, &["b"]), src(3, &["c"])],
            vec![],
        );
        engine.sink().accept_at_most(2);

        let outcome = engine.run_pass().await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::PartialWrite {
                requested: 3,
                confirmed: 2,
                marked: 2,
                unconfirmed: vec![RowId::Int(3)]
            }
        );
        assert!(!outcome.is_clean());
        assert_eq!(engine.sink().fetch_calls(), 2);
        assert_eq!(engine.source().sent_ids(), vec![RowId::Int(1), RowId::Int(2)]);
        assert_eq!(engine.journal().pending().unwrap(), vec![RowId::Int(3)]);
    }

    #[tokio::test]
    async fn test_unconfirmed_row_is_delivered_next_pass() {
        let engine = engine(vec![src(1, &["a"]), src(2, &["b"])], vec![]);
        engine.sink().accept_at_most(1);
        engine.run_pass().await.unwrap();

        engine.sink().accept_at_most(10);
        let outcome = engine.run_pass().await.unwrap();
        assert_eq!(outcome.rows_appended(), 1);
        assert_eq!(engine.sink().rows().len(), 2);
        assert_eq!(engine.source().sent_ids().len(), 2);
    }

    #[tokio::test]
    async fn test_over_confirmation_with_all_rows_present_is_written() {
        let engine = engine(vec![src(1, &["a"]), src(2, &["b"])], vec![]);
        engine.sink().over_report(1);

        let outcome = engine.run_pass().await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Written {
                appended: 2,
                marked: 2,
                recovered: 0
            }
        );
        assert!(outcome.is_clean());
        // The count mismatch still triggers the verification read.
        assert_eq!(engine.sink().fetch_calls(), 2);
        assert_eq!(engine.source().sent_ids().len(), 2);
    }

    #[tokio::test]
    async fn test_verification_read_failure_marks_nothing() {
        let engine = engine(vec![src(1, &["a"]), src(2, &["b"])], vec![]);
        engine.sink().accept_at_most(1);
        engine.sink().fail_fetch_after(1);

        assert!(engine.run_pass().await.is_err());
        assert_eq!(engine.sink().append_calls(), 1);
        assert_eq!(engine.source().mark_calls(), 0);
        assert_eq!(engine.journal().pending().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_zero_confirmed_is_nothing_written() {
        let engine = engine(vec![src(1, &["a"])], vec![]);
        engine.sink().accept_at_most(0);

        let outcome = engine.run_pass().await.unwrap();
        assert_eq!(outcome, SyncOutcome::NothingWritten { attempted: 1 });
        assert_eq!(engine.source().mark_calls(), 0);
    }

    #[tokio::test]
    async fn test_silently_stored_rows_are_recovered() {
        // Rows land in the sheet even though the answer confirmed none.
        let engine = engine(vec![src(1, &["a"])], vec![]);
        engine.sink().report_zero(true);
        let outcome = engine.run_pass().await.unwrap();
        assert_eq!(outcome.kind(), "nothing_written");

        engine.sink().report_zero(false);
        let outcome = engine.run_pass().await.unwrap();
        assert_eq!(outcome, SyncOutcome::Recovered { marked: 1 });
        assert_eq!(engine.sink().rows().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_keys_within_batch_append_once() {
        let engine = engine(
            vec![
                SourceRow::new(RowId::Text("a".to_string()), vec![Cell::from("x")]),
                SourceRow::new(RowId::Text("a".to_string()), vec![Cell::from("x")]),
            ],
            vec![],
        );
        let outcome = engine.run_pass().await.unwrap();

        assert_eq!(outcome.rows_appended(), 1);
        assert_eq!(engine.sink().rows().len(), 1);
        assert_eq!(engine.source().sent_ids().len(), 2);
    }

    #[tokio::test]
    async fn test_restart_after_append_recovers_without_reappending() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = Arc::new(MemorySource::new(vec![src(1, &["a"]), src(2, &["b"])]));
        let sink = Arc::new(MemorySink::new(vec![]));

        {
            let journal = Arc::new(RocksJournal::open(tmp.path()).unwrap());
            let engine = SyncEngine::new(
                Arc::clone(&source),
                Arc::clone(&sink),
                journal,
                Trailer::Fixed("synced".to_string()),
            );
            // The process dies once the append went through.
            source.fail_mark(true);
            assert!(engine.run_pass().await.is_err());
        }
        assert_eq!(sink.rows().len(), 2);
        assert!(source.sent_ids().is_empty());

        source.fail_mark(false);
        let journal = Arc::new(RocksJournal::open(tmp.path()).unwrap());
        let engine = SyncEngine::new(
            Arc::clone(&source),
            Arc::clone(&sink),
            journal,
            Trailer::Fixed("synced".to_string()),
        );
        let outcome = engine.run_pass().await.unwrap();

        assert_eq!(outcome, SyncOutcome::Recovered { marked: 2 });
        assert_eq!(sink.append_calls(), 1);
        assert_eq!(sink.rows().len(), 2);
        assert_eq!(source.sent_ids(), vec![RowId::Int(1), RowId::Int(2)]);
        assert!(engine.journal().pending().unwrap().is_empty());
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&Error::QuotaExceeded {
            operation: "append_rows",
            retry_after: None
        }));
        assert!(is_transient(&Error::Sink {
            operation: "append_rows",
            status: 503,
            message: String::new()
        }));
        assert!(!is_transient(&Error::Sink {
            operation: "append_rows",
            status: 403,
            message: String::new()
        }));
        assert!(!is_transient(&Error::Config("x".to_string())));
    }
}
