//! Delegated-access credentials for the Sheets API.
//!
//! Two file shapes are accepted:
//!
//! ```text
//! {"access_token": "ya29..."}                          fixed bearer token
//! {"client_id": "..", "client_secret": "..",
//!  "refresh_token": "..", "token_uri": ".."}           authorized user
//! ```
//!
//! Authorized-user credentials are exchanged for a short-lived access token
//! with a single refresh-token grant. Interactive consent flows are not
//! supported: OAuth client-secret files are rejected with an explanation.

use std::path::Path;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::debug;

use crate::{Error, Result};

/// Google's OAuth token endpoint.
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Refresh this long before the reported expiry.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Loaded credentials.
#[derive(Clone)]
pub enum Credentials {
    /// Pre-issued bearer token, used as-is.
    AccessToken(String),

    /// Refresh-token grant against `token_uri`.
    AuthorizedUser {
        client_id: String,
        client_secret: String,
        refresh_token: String,
        token_uri: String,
    },
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AccessToken(_) => f.write_str("Credentials::AccessToken(<redacted>)"),
            Self::AuthorizedUser {
                client_id,
                token_uri,
                ..
            } => f
                .debug_struct("Credentials::AuthorizedUser")
                .field("client_id", client_id)
                .field("token_uri", token_uri)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CredentialsFile {
    access_token: Option<String>,
    /// Field name used by google-auth when dumping authorized-user files.
    token: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    refresh_token: Option<String>,
    token_uri: Option<String>,
    installed: Option<serde_json::Value>,
    web: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

/// A bearer token and when it stops being usable.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: Option<Instant>,
}

impl AccessToken {
    pub fn is_fresh(&self) -> bool {
        self.expires_at
            .is_none_or(|at| Instant::now() + EXPIRY_MARGIN < at)
    }
}

impl Credentials {
    /// Load credentials from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Credentials(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    /// Parse credentials from JSON text.
    pub fn from_json(raw: &str) -> Result<Self> {
        let file: CredentialsFile = serde_json::from_str(raw)
            .map_err(|e| Error::Credentials(format!("malformed credentials file: {e}")))?;

        if let (Some(client_id), Some(client_secret), Some(refresh_token)) = (
            file.client_id.clone(),
            file.client_secret.clone(),
            file.refresh_token.clone(),
        ) {
            return Ok(Self::AuthorizedUser {
                client_id,
                client_secret,
                refresh_token,
                token_uri: file
                    .token_uri
                    .unwrap_or_else(|| DEFAULT_TOKEN_URI.to_string()),
            });
        }

        if let Some(token) = file.access_token.or(file.token).filter(|t| !t.is_empty()) {
            return Ok(Self::AccessToken(token));
        }

        if file.installed.is_some() || file.web.is_some() {
            return Err(Error::Credentials(
                "OAuth client secrets need an interactive consent flow; \
                 supply authorized-user credentials (client_id, client_secret, refresh_token) \
                 or an access_token instead"
                    .to_string(),
            ));
        }

        Err(Error::Credentials(
            "no access_token or refresh_token found in credentials file".to_string(),
        ))
    }

    /// Obtain a bearer token, exchanging the refresh token if needed.
    pub async fn access_token(&self, client: &reqwest::Client) -> Result<AccessToken> {
        match self {
            Self::AccessToken(token) => Ok(AccessToken {
                token: token.clone(),
                expires_at: None,
            }),
            Self::AuthorizedUser {
                client_id,
                client_secret,
                refresh_token,
                token_uri,
            } => {
                let response = client
                    .post(token_uri)
                    .form(&[
                        ("grant_type", "refresh_token"),
                        ("client_id", client_id.as_str()),
                        ("client_secret", client_secret.as_str()),
                        ("refresh_token", refresh_token.as_str()),
                    ])
                    .send()
                    .await
                    .map_err(|e| Error::from_http("refresh_token", e))?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(Error::Credentials(format!(
                        "token refresh rejected with HTTP {}: {body}",
                        status.as_u16()
                    )));
                }

                let token: TokenResponse = response
                    .json()
                    .await
                    .map_err(|e| Error::Credentials(format!("malformed token response: {e}")))?;

                debug!(expires_in = ?token.expires_in, "Obtained Sheets access token");
                Ok(AccessToken {
                    token: token.access_token,
                    expires_at: token
                        .expires_in
                        .map(|secs| Instant::now() + Duration::from_secs(secs)),
                })
            }
        }
    }
}
