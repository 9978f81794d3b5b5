//! Google Sheets sink.
//!
//! Reads and appends a single A1 range through the Sheets v4 REST API:
//!
//! ```text
//! GET  /v4/spreadsheets/{id}/values/{range}?valueRenderOption=UNFORMATTED_VALUE
//! POST /v4/spreadsheets/{id}/values/{range}:append
//!        ?valueInputOption=RAW&insertDataOption=INSERT_ROWS
//! ```
//!
//! `INSERT_ROWS` inserts fresh rows after the existing table, so nothing already
//! in the sheet is shifted or overwritten. `RAW` stores values literally; text
//! that looks like a formula stays text.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use sheetsync_core::DestinationRow;
use tracing::{debug, info};
use url::Url;

use super::SinkRepository;
use super::credentials::{AccessToken, Credentials};
use crate::config::SinkConfig;
use crate::{Error, Result};

/// Google Sheets [`SinkRepository`].
pub struct SheetsSink {
    client: reqwest::Client,
    config: SinkConfig,
    credentials: Credentials,
    token: Mutex<Option<AccessToken>>,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendResponse {
    updates: Option<UpdateValuesResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateValuesResponse {
    updated_rows: Option<usize>,
    updated_range: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl SheetsSink {
    /// Create a sink, loading credentials from `config.credentials_path`.
    pub fn from_config(config: SinkConfig) -> Result<Self> {
        let credentials = Credentials::load(&config.credentials_path)?;
        Self::new(config, credentials)
    }

    pub fn new(config: SinkConfig, credentials: Credentials) -> Result<Self> {
        config.validate()?;

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("sheetsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {e}")))?;

        info!(
            spreadsheet = %config.spreadsheet_id,
            range = %config.range(),
            "Sheets sink initialized"
        );

        Ok(Self {
            client,
            config,
            credentials,
            token: Mutex::new(None),
        })
    }

    /// `{api}/v4/spreadsheets/{id}/values/{range}{suffix}`
    fn values_url(&self, suffix: &str) -> Result<Url> {
        let mut url = Url::parse(&self.config.api_base)
            .map_err(|e| Error::Config(format!("invalid API base: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| Error::Config("API base cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend([
                "v4",
                "spreadsheets",
                self.config.spreadsheet_id.as_str(),
                "values",
            ])
            .push(&format!("{}{suffix}", self.config.range()));
        Ok(url)
    }

    /// Current bearer token, refreshed when close to expiry.
    async fn bearer(&self) -> Result<String> {
        if let Some(token) = self.token.lock().as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.token.clone());
        }
        let fresh = self.credentials.access_token(&self.client).await?;
        let token = fresh.token.clone();
        *self.token.lock() = Some(fresh);
        Ok(token)
    }

    /// Turn a non-success answer into an error naming the operation.
    async fn check(operation: &'static str, response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(Error::QuotaExceeded {
                operation,
                retry_after,
            });
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .map(|b| b.error.message)
            .unwrap_or(body);
        Err(Error::Sink {
            operation,
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl SinkRepository for SheetsSink {
    async fn fetch_existing(&self) -> Result<Vec<DestinationRow>> {
        const OP: &str = "fetch_existing";

        let mut url = self.values_url("")?;
        url.query_pairs_mut()
            .append_pair("majorDimension", "ROWS")
            .append_pair("valueRenderOption", "UNFORMATTED_VALUE");

        let response = self
            .client
            .get(url)
            .bearer_auth(self.bearer().await?)
            .send()
            .await
            .map_err(|e| Error::from_http(OP, e))?;
        let range: ValueRange = Self::check(OP, response)
            .await?
            .json()
            .await
            .map_err(|e| Error::from_http(OP, e))?;

        let rows: Vec<DestinationRow> = range
            .values
            .iter()
            .map(|values| DestinationRow::from_json(values))
            .collect();
        debug!("Read {} existing rows from {}", rows.len(), self.config.range());
        Ok(rows)
    }

    async fn append_rows(&self, rows: &[DestinationRow]) -> Result<usize> {
        const OP: &str = "append_rows";

        if rows.is_empty() {
            return Ok(0);
        }

        let mut url = self.values_url(":append")?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");

        let values: Vec<Vec<Value>> = rows.iter().map(DestinationRow::to_json).collect();
        let body = json!({ "majorDimension": "ROWS", "values": values });

        let response = self
            .client
            .post(url)
            .bearer_auth(self.bearer().await?)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::from_http(OP, e))?;
        let appended: AppendResponse = Self::check(OP, response)
            .await?
            .json()
            .await
            .map_err(|e| Error::from_http(OP, e))?;

        let updates = appended.updates;
        let confirmed = updates.as_ref().and_then(|u| u.updated_rows).unwrap_or(0);
        debug!(
            requested = rows.len(),
            confirmed,
            updated_range = ?updates.and_then(|u| u.updated_range),
            "Appended rows to {}",
            self.config.range()
        );
        Ok(confirmed)
    }
}
