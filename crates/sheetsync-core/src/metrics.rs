//! Prometheus metrics helpers for sheetsync.
//!
//! # Usage
//!
//! ```rust,ignore
//! use sheetsync_core::metrics::{init_metrics, start_metrics_server};
//!
//! let handle = init_metrics();
//! start_metrics_server(9091, handle).await?;
//!
//! metrics::counter!("sync_rows_appended_total").increment(3);
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: `sync_` for everything the sync engine records
//! - Suffix: unit or type (`_total`, `_seconds`, `_timestamp`)
//! - Labels: only `outcome`, which has a fixed set of values

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

use crate::SyncOutcome;

/// Initialize the Prometheus metrics recorder.
///
/// Returns `None` if a recorder is already installed (e.g. in tests).
pub fn init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_sync_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server.
///
/// Binds `0.0.0.0:port` before returning, then serves `/metrics` from a
/// background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "metrics server stopped");
        }
    });

    Ok(())
}

/// Register descriptions for every metric the sync engine records.
fn register_sync_metrics() {
    describe_counter!(
        "sync_passes_total",
        "Completed sync passes (label: outcome)"
    );
    describe_counter!(
        "sync_pass_errors_total",
        "Sync passes that failed with an error"
    );
    describe_counter!(
        "sync_candidates_total",
        "Unsent source rows read at the start of a pass"
    );
    describe_counter!(
        "sync_rows_already_present_total",
        "Candidate rows skipped because the destination already holds them"
    );
    describe_counter!(
        "sync_rows_appended_total",
        "Rows the destination confirmed as appended"
    );
    describe_counter!(
        "sync_rows_marked_total",
        "Source rows flagged as sent"
    );
    describe_counter!(
        "sync_rows_recovered_total",
        "Rows appended by an interrupted pass and marked on a later one"
    );
    describe_counter!(
        "sync_partial_writes_total",
        "Appends where the confirmed row count differed from the request"
    );
    describe_histogram!(
        "sync_pass_duration_seconds",
        "Wall time of a sync pass"
    );
    describe_gauge!(
        "sync_last_pass_timestamp",
        "Unix time of the last completed pass"
    );
    describe_gauge!(
        "sync_journal_pending",
        "Rows recorded as appended but not yet marked sent"
    );
}

/// Record the counters derived from a finished pass.
pub fn record_outcome(outcome: &SyncOutcome) {
    metrics::counter!("sync_passes_total", "outcome" => outcome.kind()).increment(1);
    increment("sync_rows_appended_total", outcome.rows_appended() as u64);
    increment("sync_rows_marked_total", outcome.rows_marked() as u64);
    if let SyncOutcome::PartialWrite { .. } = outcome {
        increment("sync_partial_writes_total", 1);
    }
    set_gauge(
        "sync_last_pass_timestamp",
        chrono::Utc::now().timestamp() as f64,
    );
}

/// Increment a counter.
///
/// Convenience wrapper around `metrics::counter!`.
#[inline]
pub fn increment(name: &'static str, count: u64) {
    metrics::counter!(name).increment(count);
}

/// Set a gauge value.
///
/// Convenience wrapper around `metrics::gauge!`.
#[inline]
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RowId;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn ensure_metrics_init() {
        INIT.call_once(|| {
            let _ = init_metrics();
        });
    }

    #[test]
    fn test_init_metrics_only_once() {
        let first = init_metrics();
        let second = init_metrics();
        assert!(first.is_none() || second.is_none());
    }

    #[test]
    fn test_helpers_do_not_panic() {
        ensure_metrics_init();
        increment("test_counter", 0);
        increment("test_counter", 5);
        set_gauge("test_gauge", -1.0);
        set_gauge("test_gauge", f64::MAX);
    }

    #[test]
    fn test_record_outcome_for_every_kind() {
        ensure_metrics_init();
        record_outcome(&SyncOutcome::NothingToDo);
        record_outcome(&SyncOutcome::NothingWritten { attempted: 2 });
        record_outcome(&SyncOutcome::PartialWrite {
            requested: 3,
            confirmed: 2,
            marked: 2,
            unconfirmed: vec![RowId::Int(1)],
        });
    }

    #[test]
    fn test_register_sync_metrics_is_idempotent() {
        ensure_metrics_init();
        register_sync_metrics();
        register_sync_metrics();
    }
}
