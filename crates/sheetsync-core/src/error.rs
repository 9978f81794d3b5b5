//! Error types for the sheetsync row model.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or decoding rows.
#[derive(Error, Debug)]
pub enum Error {
    /// The identifier cell cannot serve as a row identifier (NULL, float, bool).
    #[error("invalid row identifier: {0}")]
    InvalidRowId(String),

    /// A source row was produced without any columns.
    #[error("source row has no identifier column")]
    MissingIdentifier,

    /// The configured trailer would be dropped by the destination on read.
    #[error("invalid trailer: {0}")]
    InvalidTrailer(String),

    /// A journal key could not be decoded back into a row identifier.
    #[error("invalid journal key: {0}")]
    InvalidKey(String),
}
