//! Spotify Web API client (read side of a migration).
//!
//! Works from a stored bearer token. When the credential blob also carries
//! app client credentials, an expired token is re-minted in place once and
//! the rotated blob is handed back through the credential sink.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{
    body_snippet, send_with_retry, status_error, CatalogError, CredentialSink, SourceCatalog,
    SourcePlaylist,
};
use crate::models::{Provider, SourceTrack};

const API_BASE: &str = "https://api.spotify.com/v1";
const ACCOUNTS_BASE: &str = "https://accounts.spotify.com";
const PAGE_SIZE: u32 = 50;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct SpotifyCatalog {
    http: Client,
    api_base: String,
    accounts_base: String,
    access_token: RwLock<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    sink: Option<Arc<dyn CredentialSink>>,
}

#[derive(Debug, Deserialize)]
struct PlaylistObject {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TrackPage {
    #[serde(default)]
    items: Vec<PlaylistEntry>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaylistEntry {
    track: Option<TrackObject>,
}

#[derive(Debug, Deserialize)]
struct TrackObject {
    id: Option<String>,
    name: Option<String>,
    duration_ms: Option<u64>,
    #[serde(default)]
    artists: Vec<ArtistObject>,
    album: Option<AlbumObject>,
    external_ids: Option<ExternalIds>,
}

#[derive(Debug, Deserialize)]
struct ArtistObject {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AlbumObject {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExternalIds {
    isrc: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

impl SpotifyCatalog {
    pub fn from_credentials(
        credentials: &serde_json::Value,
        sink: Option<Arc<dyn CredentialSink>>,
    ) -> Result<Self, CatalogError> {
        let access_token = credentials
            .get("access_token")
            .and_then(|v| v.as_str())
            .filter(|t| !t.is_empty())
            .ok_or(CatalogError::AuthMissing(Provider::Spotify))?
            .to_string();
        let client_id = credentials
            .get("client_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let client_secret = credentials
            .get("client_secret")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        Ok(Self {
            http: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .map_err(|e| super::transport_error(Provider::Spotify, e))?,
            api_base: API_BASE.to_string(),
            accounts_base: ACCOUNTS_BASE.to_string(),
            access_token: RwLock::new(access_token),
            client_id,
            client_secret,
            sink,
        })
    }

    /// Point the client at alternate endpoints (tests, proxies).
    pub fn with_base_urls(mut self, api_base: &str, accounts_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self.accounts_base = accounts_base.trim_end_matches('/').to_string();
        self
    }

    /// Authenticated GET with a single in-place token refresh on 401.
    async fn get_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T, CatalogError> {
        let mut refreshed = false;
        loop {
            let token = self.access_token.read().await.clone();
            let response = send_with_retry(Provider::Spotify, || {
                self.http.get(url).bearer_auth(&token)
            })
            .await?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && !refreshed {
                refreshed = true;
                self.refresh_access_token().await?;
                continue;
            }
            if status.is_success() {
                return response
                    .json::<T>()
                    .await
                    .map_err(|e| CatalogError::InvalidResponse {
                        provider: Provider::Spotify,
                        detail: e.to_string(),
                    });
            }
            return Err(status_error(Provider::Spotify, response).await);
        }
    }

    /// Mint a fresh bearer token with the client-credentials grant and hand
    /// the rotated blob back to the caller before retrying.
    async fn refresh_access_token(&self) -> Result<(), CatalogError> {
        let (client_id, client_secret) = match (&self.client_id, &self.client_secret) {
            (Some(id), Some(secret)) => (id.clone(), secret.clone()),
            _ => return Err(CatalogError::AuthInvalid(Provider::Spotify)),
        };

        let url = format!("{}/api/token", self.accounts_base);
        let response = send_with_retry(Provider::Spotify, || {
            self.http.post(&url).form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
            ])
        })
        .await?;

        if !response.status().is_success() {
            let detail = body_snippet(response).await;
            tracing::warn!(detail = %detail, "spotify token refresh rejected");
            return Err(CatalogError::AuthInvalid(Provider::Spotify));
        }

        let token: TokenResponse =
            response
                .json()
                .await
                .map_err(|e| CatalogError::InvalidResponse {
                    provider: Provider::Spotify,
                    detail: e.to_string(),
                })?;

        *self.access_token.write().await = token.access_token.clone();
        tracing::info!("refreshed spotify access token");

        if let Some(sink) = &self.sink {
            let rotated = serde_json::json!({
                "access_token": token.access_token,
                "client_id": client_id,
                "client_secret": client_secret,
            });
            if let Err(e) = sink.credentials_rotated(Provider::Spotify, &rotated).await {
                tracing::warn!(error = %e, "failed to persist rotated spotify credentials");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SourceCatalog for SpotifyCatalog {
    async fn enumerate_playlist(&self, playlist_id: &str) -> Result<SourcePlaylist, CatalogError> {
        let playlist: PlaylistObject = self
            .get_json(&format!("{}/playlists/{}", self.api_base, playlist_id))
            .await?;
        let name = playlist.name.unwrap_or_else(|| "Unknown Playlist".to_string());

        let mut tracks = Vec::new();
        let mut url = Some(format!(
            "{}/playlists/{}/tracks?limit={}",
            self.api_base, playlist_id, PAGE_SIZE
        ));
        while let Some(page_url) = url {
            let page: TrackPage = self.get_json(&page_url).await?;
            for entry in page.items {
                // Local files and removed episodes come back without a
                // usable track object; skip them.
                let Some(track) = entry.track else { continue };
                let Some(track_name) = track.name.filter(|n| !n.is_empty()) else {
                    continue;
                };
                let artists: Vec<String> =
                    track.artists.into_iter().filter_map(|a| a.name).collect();
                if artists.is_empty() {
                    continue;
                }
                tracks.push(SourceTrack {
                    name: track_name,
                    artists,
                    album: track.album.and_then(|a| a.name),
                    duration_ms: track.duration_ms,
                    isrc: track.external_ids.and_then(|e| e.isrc),
                    source_id: track.id,
                });
            }
            url = page.next;
        }

        tracing::info!(playlist = %playlist_id, tracks = tracks.len(), "enumerated source playlist");
        Ok(SourcePlaylist { name, tracks })
    }
}
