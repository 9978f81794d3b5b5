//! Error types for the sync pipeline.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during a sync pass.
///
/// Every variant that comes from a collaborator names the operation that
/// failed, so "nothing to do" can never be confused with "something broke".
#[derive(Error, Debug)]
pub enum Error {
    /// A store or service could not be reached.
    #[error("{operation}: connection failed: {message}")]
    Connection {
        operation: &'static str,
        message: String,
    },

    /// The source store rejected a write; nothing in the batch was applied.
    #[error("{operation}: write rejected: {message}")]
    Write {
        operation: &'static str,
        message: String,
    },

    /// The destination API refused the request for quota reasons (HTTP 429).
    #[error("{operation}: quota exceeded{}", retry_hint(.retry_after))]
    QuotaExceeded {
        operation: &'static str,
        retry_after: Option<Duration>,
    },

    /// The destination API answered with a non-success status.
    #[error("{operation}: destination returned HTTP {status}: {message}")]
    Sink {
        operation: &'static str,
        status: u16,
        message: String,
    },

    /// SQL error outside connection handling.
    #[error("{operation}: SQL error: {source}")]
    Sql {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    /// RocksDB error from the delivery journal.
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// Credentials file missing, unreadable or rejected.
    #[error("Credentials error: {0}")]
    Credentials(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Row model error.
    #[error("Row error: {0}")]
    Row(#[from] sheetsync_core::Error),
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}s)", d.as_secs()),
        None => String::new(),
    }
}

impl Error {
    /// Classify an SQL error: connectivity problems become
    /// [`Error::Connection`], everything else stays an SQL error.
    pub fn from_sql(operation: &'static str, source: sqlx::Error) -> Self {
        match source {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Connection {
                operation,
                message: source.to_string(),
            },
            other => Self::Sql {
                operation,
                source: other,
            },
        }
    }

    /// Classify an HTTP transport error.
    pub fn from_http(operation: &'static str, source: reqwest::Error) -> Self {
        if source.is_connect() || source.is_timeout() || source.is_request() {
            Self::Connection {
                operation,
                message: source.to_string(),
            }
        } else if let Some(status) = source.status() {
            Self::Sink {
                operation,
                status: status.as_u16(),
                message: source.to_string(),
            }
        } else {
            Self::Sink {
                operation,
                status: 0,
                message: source.to_string(),
            }
        }
    }

    /// Whether the failure was a store or service being unreachable.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}
