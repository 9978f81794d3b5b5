//! Startup configuration.
//!
//! All connection and location parameters are collected into a [`SyncConfig`]
//! value once at startup and never mutated afterwards. The binary fills it
//! from CLI flags and `SHEETSYNC_*` environment variables.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use sheetsync_core::Trailer;
use url::Url;

use crate::{Error, Result};

/// Default Sheets API endpoint.
pub const DEFAULT_SHEETS_API: &str = "https://sheets.googleapis.com";

/// Relational source store: connection parameters and the table mapping.
#[derive(Clone)]
pub struct SourceConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,

    /// Table holding the rows to deliver.
    pub table: String,

    /// Unique, stable identifier column. Written as the first destination column.
    pub id_column: String,

    /// Descriptive columns, in destination order.
    pub columns: Vec<String>,

    /// Boolean "sent" flag column (0 = unsent, 1 = sent).
    pub sent_column: String,

    /// Time allowed to establish the connection.
    pub connect_timeout: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: String::new(),
            password: String::new(),
            database: String::new(),
            table: "vagas".to_string(),
            id_column: "id".to_string(),
            columns: vec![
                "nome".to_string(),
                "idade".to_string(),
                "cidade".to_string(),
            ],
            sent_column: "escrito".to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("table", &self.table)
            .field("id_column", &self.id_column)
            .field("columns", &self.columns)
            .field("sent_column", &self.sent_column)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl SourceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("source host must not be empty".to_string()));
        }
        if self.database.trim().is_empty() {
            return Err(Error::Config(
                "source database name must not be empty".to_string(),
            ));
        }
        validate_identifier("table", &self.table)?;
        validate_identifier("id column", &self.id_column)?;
        validate_identifier("sent column", &self.sent_column)?;
        if self.columns.is_empty() {
            return Err(Error::Config(
                "at least one descriptive column is required".to_string(),
            ));
        }
        for column in &self.columns {
            validate_identifier("column", column)?;
        }
        Ok(())
    }
}

/// Destination spreadsheet location and access.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Spreadsheet id, derived from the spreadsheet URL.
    pub spreadsheet_id: String,

    /// Sheet (tab) name.
    pub sheet_name: String,

    /// Column span inside the sheet, e.g. `A:Z`.
    pub columns_range: String,

    /// Delegated-access credentials file.
    pub credentials_path: PathBuf,

    /// Sheets API base URL.
    pub api_base: String,

    /// Per-request timeout enforced by the HTTP client.
    pub request_timeout: Duration,
}

impl SinkConfig {
    /// Build a sink config from a spreadsheet URL (or bare id).
    pub fn new(spreadsheet_ref: &str, sheet_name: &str) -> Result<Self> {
        Ok(Self {
            spreadsheet_id: spreadsheet_id_from_ref(spreadsheet_ref)?,
            sheet_name: sheet_name.to_string(),
            columns_range: "A:Z".to_string(),
            credentials_path: PathBuf::from("credentials.json"),
            api_base: DEFAULT_SHEETS_API.to_string(),
            request_timeout: Duration::from_secs(30),
        })
    }

    /// A1-notation range covering the destination, e.g. `'Job list'!A:Z`.
    pub fn range(&self) -> String {
        let plain = self
            .sheet_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if plain {
            format!("{}!{}", self.sheet_name, self.columns_range)
        } else {
            format!(
                "'{}'!{}",
                self.sheet_name.replace('\'', "''"),
                self.columns_range
            )
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sheet_name.trim().is_empty() {
            return Err(Error::Config("sheet name must not be empty".to_string()));
        }
        if self.columns_range.trim().is_empty() || self.columns_range.contains('!') {
            return Err(Error::Config(format!(
                "invalid column range '{}'",
                self.columns_range
            )));
        }
        Url::parse(&self.api_base)
            .map_err(|e| Error::Config(format!("invalid API base '{}': {e}", self.api_base)))?;
        Ok(())
    }
}

/// Everything a sync pass needs, supplied once at startup.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub source: SourceConfig,
    pub sink: SinkConfig,

    /// Local delivery journal directory.
    pub journal_path: PathBuf,

    /// Trailer written after the source fields of every row.
    pub trailer: Trailer,
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        self.source.validate()?;
        self.sink.validate()?;
        self.trailer.validate()?;
        Ok(())
    }
}

/// Derive the spreadsheet id from a spreadsheet URL.
///
/// Accepts `https://docs.google.com/spreadsheets/d/<id>/edit...` or a bare id.
pub fn spreadsheet_id_from_ref(reference: &str) -> Result<String> {
    let reference = reference.trim();
    if is_bare_id(reference) {
        return Ok(reference.to_string());
    }

    let url = Url::parse(reference)
        .map_err(|e| Error::Config(format!("invalid spreadsheet URL '{reference}': {e}")))?;
    let id = url
        .path_segments()
        .and_then(|mut segments| {
            segments.find(|s| *s == "d")?;
            segments.next()
        })
        .filter(|id| is_bare_id(id))
        .ok_or_else(|| {
            Error::Config(format!(
                "no spreadsheet id found in '{reference}' (expected .../d/<id>/...)"
            ))
        })?;

    Ok(id.to_string())
}

fn is_bare_id(s: &str) -> bool {
    !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// SQL identifiers are interpolated into queries, so only plain names pass.
fn validate_identifier(what: &str, name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid {what} name '{name}'")))
    }
}
