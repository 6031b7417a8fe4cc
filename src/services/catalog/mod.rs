//! Catalog adapters: a uniform capability set over each streaming provider.
//!
//! Adapters own their HTTP sessions and normalize provider wire formats into
//! the crate's value types. Candidate durations leave every adapter in
//! seconds; the scorer never has to guess units.

pub mod qobuz;
pub mod spotify;
pub mod tidal;
pub mod ytm;

use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

use crate::models::{Candidate, Provider, SourceTrack};

pub use qobuz::QobuzCatalog;
pub use spotify::SpotifyCatalog;
pub use tidal::TidalCatalog;
pub use ytm::YtmCatalog;

/// Total attempts for retryable statuses (429, 500-504).
const MAX_ATTEMPTS: u32 = 5;
/// Exponential backoff factor in seconds: factor * 2^(attempt-1).
const BACKOFF_FACTOR_SECS: f64 = 0.5;

/// Failure taxonomy shared by all adapters.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("credentials for {0} are missing")]
    AuthMissing(Provider),

    #[error("{0} rejected the stored credentials")]
    AuthInvalid(Provider),

    #[error("playlist not found")]
    NotFound,

    #[error("invalid playlist URL")]
    InvalidPlaylistRef,

    #[error("{provider} quota exhausted: {detail}")]
    Quota { provider: Provider, detail: String },

    #[error("conflict while inserting items: {detail}")]
    Conflict { detail: String },

    #[error("transient {provider} failure: {detail}")]
    Transient { provider: Provider, detail: String },

    #[error("unexpected {provider} response: {detail}")]
    InvalidResponse { provider: Provider, detail: String },
}

impl CatalogError {
    pub fn is_auth(&self) -> bool {
        matches!(self, CatalogError::AuthMissing(_) | CatalogError::AuthInvalid(_))
    }
}

/// Requested visibility for a created playlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistPrivacy {
    Private,
    Public,
    Unlisted,
}

impl PlaylistPrivacy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaylistPrivacy::Private => "PRIVATE",
            PlaylistPrivacy::Public => "PUBLIC",
            PlaylistPrivacy::Unlisted => "UNLISTED",
        }
    }
}

/// Result of an add-items call that reached the provider.
#[derive(Debug, Clone)]
pub struct AddOutcome {
    pub success: bool,
    pub detail: Option<String>,
}

impl AddOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            detail: None,
        }
    }

    pub fn non_success(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            detail: Some(detail.into()),
        }
    }
}

/// An enumerated source playlist: display name plus ordered tracks.
#[derive(Debug, Clone)]
pub struct SourcePlaylist {
    pub name: String,
    pub tracks: Vec<SourceTrack>,
}

/// Receives rotated credentials after an in-place token refresh so the
/// caller can persist them before the request is retried.
#[async_trait]
pub trait CredentialSink: Send + Sync {
    async fn credentials_rotated(
        &self,
        provider: Provider,
        credentials: &serde_json::Value,
    ) -> anyhow::Result<()>;
}

/// Read side: enumerate a playlist into ordered source tracks.
#[async_trait]
pub trait SourceCatalog: Send + Sync {
    async fn enumerate_playlist(&self, playlist_id: &str) -> Result<SourcePlaylist, CatalogError>;
}

/// Write side: search, create and fill a playlist on the target provider.
#[async_trait]
pub trait TargetCatalog: Send + Sync {
    fn provider(&self) -> Provider;

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Candidate>, CatalogError>;

    async fn create_playlist(
        &self,
        title: &str,
        description: &str,
        privacy: PlaylistPrivacy,
    ) -> Result<String, CatalogError>;

    /// Target ids currently in the playlist. Non-fatal: failures yield an
    /// empty set so the writer can proceed without idempotence data.
    async fn existing_items(&self, playlist_id: &str) -> HashSet<String>;

    async fn add_items(&self, playlist_id: &str, ids: &[String])
        -> Result<AddOutcome, CatalogError>;
}

pub(crate) fn transport_error(provider: Provider, err: reqwest::Error) -> CatalogError {
    CatalogError::Transient {
        provider,
        detail: err.to_string(),
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || (500..=504).contains(&status.as_u16())
}

/// Send a request, retrying 429 and 500-504 with exponential backoff
/// (factor 0.5 s, up to 5 total attempts). Other statuses are returned to
/// the caller untouched; transport errors share the same budget.
pub(crate) async fn send_with_retry<F>(
    provider: Provider,
    build: F,
) -> Result<reqwest::Response, CatalogError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match build().send().await {
            Ok(response) => {
                if is_retryable(response.status()) && attempt < MAX_ATTEMPTS {
                    let status = response.status();
                    let delay = backoff_delay(attempt);
                    tracing::debug!(
                        %provider,
                        %status,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "retrying catalog request"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Ok(response);
            }
            Err(err) if attempt < MAX_ATTEMPTS => {
                tracing::debug!(%provider, attempt, error = %err, "retrying after transport error");
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
            Err(err) => return Err(transport_error(provider, err)),
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_FACTOR_SECS * 2f64.powi(attempt.saturating_sub(1) as i32);
    let jitter = rand::thread_rng().gen_range(0.0..0.1);
    Duration::from_secs_f64(base + jitter)
}

/// Map a non-success response to the shared taxonomy, consuming the body
/// for diagnostics. 401/403 are handled by callers that can refresh first.
pub(crate) async fn status_error(provider: Provider, response: reqwest::Response) -> CatalogError {
    let status = response.status();
    let detail = body_snippet(response).await;
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CatalogError::AuthInvalid(provider),
        StatusCode::NOT_FOUND => CatalogError::NotFound,
        StatusCode::CONFLICT => CatalogError::Conflict { detail },
        StatusCode::TOO_MANY_REQUESTS => CatalogError::Transient {
            provider,
            detail: format!("rate limited after retries: {}", detail),
        },
        s if s.is_server_error() => CatalogError::Transient {
            provider,
            detail: format!("{}: {}", s, detail),
        },
        s => CatalogError::InvalidResponse {
            provider,
            detail: format!("{}: {}", s, detail),
        },
    }
}

pub(crate) async fn body_snippet(response: reqwest::Response) -> String {
    let text = response.text().await.unwrap_or_default();
    let mut snippet: String = text.chars().take(300).collect();
    if snippet.len() < text.len() {
        snippet.push('…');
    }
    snippet
}
