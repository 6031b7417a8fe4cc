//! TIDAL Web API client (target side).
//!
//! Bearer-token authenticated. When the credential blob carries a refresh
//! token and app client credentials, a 401 triggers one in-place refresh
//! through the OAuth endpoint before the request is retried.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::{
    body_snippet, send_with_retry, status_error, AddOutcome, CatalogError, CredentialSink,
    PlaylistPrivacy, TargetCatalog,
};
use crate::models::{Candidate, Provider};

const API_BASE: &str = "https://api.tidal.com/v1";
const AUTH_BASE: &str = "https://auth.tidal.com/v1/oauth2";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const ITEMS_PAGE_SIZE: u32 = 100;

pub struct TidalCatalog {
    http: Client,
    api_base: String,
    auth_base: String,
    access_token: RwLock<String>,
    refresh_token: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    country_code: String,
    user_id: RwLock<Option<String>>,
    sink: Option<Arc<dyn CredentialSink>>,
}

#[derive(Debug, Deserialize)]
struct SessionObject {
    #[serde(rename = "userId")]
    user_id: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    tracks: Option<TrackList>,
}

#[derive(Debug, Deserialize)]
struct TrackList {
    #[serde(default)]
    items: Vec<TrackItem>,
}

#[derive(Debug, Deserialize)]
struct TrackItem {
    id: Option<serde_json::Value>,
    title: Option<String>,
    #[serde(default)]
    artists: Vec<NamedObject>,
    album: Option<TitledObject>,
    /// Seconds on this API; normalized here so the scorer never guesses.
    duration: Option<u64>,
    isrc: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedObject {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TitledObject {
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedPlaylist {
    uuid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaylistItemsPage {
    #[serde(default)]
    items: Vec<PlaylistItemEntry>,
    #[serde(rename = "totalNumberOfItems", default)]
    total: u64,
}

#[derive(Debug, Deserialize)]
struct PlaylistItemEntry {
    item: Option<TrackItem>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    refresh_token: Option<String>,
}

fn id_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl TidalCatalog {
    pub fn from_credentials(
        credentials: &serde_json::Value,
        sink: Option<Arc<dyn CredentialSink>>,
    ) -> Result<Self, CatalogError> {
        let access_token = credentials
            .get("access_token")
            .and_then(|v| v.as_str())
            .filter(|t| !t.is_empty())
            .ok_or(CatalogError::AuthMissing(Provider::Tidal))?
            .to_string();
        let get_str = |key: &str| {
            credentials
                .get(key)
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };

        Ok(Self {
            http: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .map_err(|e| super::transport_error(Provider::Tidal, e))?,
            api_base: API_BASE.to_string(),
            auth_base: AUTH_BASE.to_string(),
            access_token: RwLock::new(access_token),
            refresh_token: get_str("refresh_token"),
            client_id: get_str("client_id"),
            client_secret: get_str("client_secret"),
            country_code: get_str("country_code").unwrap_or_else(|| "US".to_string()),
            user_id: RwLock::new(None),
            sink,
        })
    }

    /// Point the client at alternate endpoints (tests, proxies).
    pub fn with_base_urls(mut self, api_base: &str, auth_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self.auth_base = auth_base.trim_end_matches('/').to_string();
        self
    }

    /// Authenticated request with a single in-place refresh on 401;
    /// non-success statuses are mapped to the shared taxonomy.
    async fn execute(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        form: Option<&[(&str, String)]>,
    ) -> Result<reqwest::Response, CatalogError> {
        let url = format!("{}{}", self.api_base, path);
        let mut refreshed = false;
        loop {
            let token = self.access_token.read().await.clone();
            let response = send_with_retry(Provider::Tidal, || {
                let mut request = self
                    .http
                    .request(method.clone(), &url)
                    .bearer_auth(&token)
                    .query(&[("countryCode", self.country_code.as_str())])
                    .query(query);
                if let Some(fields) = form {
                    request = request.form(fields);
                }
                request
            })
            .await?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && !refreshed {
                refreshed = true;
                self.refresh_access_token().await?;
                continue;
            }
            if status.is_success() {
                return Ok(response);
            }
            return Err(status_error(Provider::Tidal, response).await);
        }
    }

    async fn request_json<T: for<'de> Deserialize<'de>>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        form: Option<&[(&str, String)]>,
    ) -> Result<T, CatalogError> {
        let response = self.execute(method, path, query, form).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| CatalogError::InvalidResponse {
                provider: Provider::Tidal,
                detail: e.to_string(),
            })
    }

    async fn refresh_access_token(&self) -> Result<(), CatalogError> {
        let (refresh_token, client_id, client_secret) =
            match (&self.refresh_token, &self.client_id, &self.client_secret) {
                (Some(r), Some(i), Some(s)) => (r.clone(), i.clone(), s.clone()),
                _ => return Err(CatalogError::AuthInvalid(Provider::Tidal)),
            };

        let url = format!("{}/token", self.auth_base);
        let response = send_with_retry(Provider::Tidal, || {
            self.http.post(&url).form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
            ])
        })
        .await?;

        if !response.status().is_success() {
            let detail = body_snippet(response).await;
            tracing::warn!(detail = %detail, "tidal token refresh rejected");
            return Err(CatalogError::AuthInvalid(Provider::Tidal));
        }

        let refreshed: RefreshResponse =
            response
                .json()
                .await
                .map_err(|e| CatalogError::InvalidResponse {
                    provider: Provider::Tidal,
                    detail: e.to_string(),
                })?;

        *self.access_token.write().await = refreshed.access_token.clone();
        tracing::info!("refreshed tidal access token");

        if let Some(sink) = &self.sink {
            let rotated = serde_json::json!({
                "access_token": refreshed.access_token,
                "refresh_token": refreshed.refresh_token.unwrap_or(refresh_token),
                "client_id": client_id,
                "client_secret": client_secret,
                "country_code": self.country_code,
            });
            if let Err(e) = sink.credentials_rotated(Provider::Tidal, &rotated).await {
                tracing::warn!(error = %e, "failed to persist rotated tidal credentials");
            }
        }
        Ok(())
    }

    /// The session's user id, fetched once and cached for the adapter's
    /// lifetime.
    async fn session_user_id(&self) -> Result<String, CatalogError> {
        if let Some(cached) = self.user_id.read().await.clone() {
            return Ok(cached);
        }
        let session: SessionObject = self
            .request_json(Method::GET, "/sessions", &[], None)
            .await?;
        let user_id =
            id_to_string(&session.user_id).ok_or_else(|| CatalogError::InvalidResponse {
                provider: Provider::Tidal,
                detail: "session without userId".to_string(),
            })?;
        *self.user_id.write().await = Some(user_id.clone());
        Ok(user_id)
    }

    fn candidate_from_item(item: TrackItem) -> Option<Candidate> {
        let target_id = item.id.as_ref().and_then(id_to_string)?;
        Some(Candidate {
            target_id,
            title: item.title.unwrap_or_default(),
            artists: item.artists.into_iter().filter_map(|a| a.name).collect(),
            album: item.album.and_then(|a| a.title),
            duration_secs: item.duration,
            isrc: item.isrc,
            score: None,
        })
    }
}

#[async_trait]
impl TargetCatalog for TidalCatalog {
    fn provider(&self) -> Provider {
        Provider::Tidal
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Candidate>, CatalogError> {
        let response: SearchResponse = self
            .request_json(
                Method::GET,
                "/search",
                &[
                    ("query", query.to_string()),
                    ("limit", limit.to_string()),
                    ("types", "TRACKS".to_string()),
                ],
                None,
            )
            .await?;

        let items = response.tracks.map(|t| t.items).unwrap_or_default();
        Ok(items
            .into_iter()
            .filter_map(Self::candidate_from_item)
            .collect())
    }

    async fn create_playlist(
        &self,
        title: &str,
        description: &str,
        _privacy: PlaylistPrivacy,
    ) -> Result<String, CatalogError> {
        let user_id = self.session_user_id().await?;
        let created: CreatedPlaylist = self
            .request_json(
                Method::POST,
                &format!("/users/{}/playlists", user_id),
                &[],
                Some(&[
                    ("title", title.to_string()),
                    ("description", description.to_string()),
                ]),
            )
            .await?;
        created
            .uuid
            .filter(|u| !u.is_empty())
            .ok_or_else(|| CatalogError::InvalidResponse {
                provider: Provider::Tidal,
                detail: "playlist create returned no uuid".to_string(),
            })
    }

    async fn existing_items(&self, playlist_id: &str) -> HashSet<String> {
        let mut ids = HashSet::new();
        let mut offset: u64 = 0;
        loop {
            let page: PlaylistItemsPage = match self
                .request_json(
                    Method::GET,
                    &format!("/playlists/{}/items", playlist_id),
                    &[
                        ("limit", ITEMS_PAGE_SIZE.to_string()),
                        ("offset", offset.to_string()),
                    ],
                    None,
                )
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(playlist = %playlist_id, error = %e, "could not fetch existing tidal items");
                    return HashSet::new();
                }
            };

            let fetched = page.items.len() as u64;
            for entry in page.items {
                if let Some(id) = entry.item.and_then(|i| i.id.as_ref().and_then(id_to_string)) {
                    ids.insert(id);
                }
            }
            offset += fetched;
            if fetched == 0 || offset >= page.total {
                return ids;
            }
        }
    }

    async fn add_items(
        &self,
        playlist_id: &str,
        ids: &[String],
    ) -> Result<AddOutcome, CatalogError> {
        // Omitting toIndex appends at the playlist tail.
        self.execute(
            Method::POST,
            &format!("/playlists/{}/items", playlist_id),
            &[],
            Some(&[("trackIds", ids.join(","))]),
        )
        .await?;
        Ok(AddOutcome::ok())
    }
}
