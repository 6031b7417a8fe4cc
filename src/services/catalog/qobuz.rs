//! Qobuz API client (target side).
//!
//! Requests authenticate with an app id plus user auth token; when an app
//! secret is present, write endpoints are MD5-signed the way the official
//! clients do (method name + sorted params + timestamp + secret).

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::{send_with_retry, status_error, AddOutcome, CatalogError, PlaylistPrivacy, TargetCatalog};
use crate::models::{Candidate, Provider};

const API_BASE: &str = "https://www.qobuz.com/api.json/0.2";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

pub struct QobuzCatalog {
    http: Client,
    api_base: String,
    app_id: String,
    user_auth_token: String,
    app_secret: Option<String>,
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
    artist: Option<NamedObject>,
    #[serde(default)]
    artists: Vec<NamedObject>,
    album: Option<TitledObject>,
    /// Seconds on this API.
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
struct ErrorEnvelope {
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaylistEnvelope {
    playlist: Option<PlaylistBody>,
    id: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PlaylistBody {
    id: Option<serde_json::Value>,
    tracks: Option<PlaylistTracks>,
}

#[derive(Debug, Deserialize)]
struct PlaylistTracks {
    #[serde(default)]
    items: Vec<TrackItem>,
}

fn id_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// MD5 signature over `method + sorted(key, value)… + ts + secret`.
fn request_signature(endpoint: &str, params: &BTreeMap<String, String>, ts: &str, secret: &str) -> String {
    let mut message = endpoint.trim_matches('/').to_string();
    for (key, value) in params {
        message.push_str(key);
        message.push_str(value);
    }
    message.push_str(ts);
    message.push_str(secret);
    format!("{:x}", md5::compute(message.as_bytes()))
}

impl QobuzCatalog {
    pub fn from_credentials(credentials: &serde_json::Value) -> Result<Self, CatalogError> {
        let get_str = |key: &str| {
            credentials
                .get(key)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let app_id = get_str("app_id").ok_or(CatalogError::AuthMissing(Provider::Qobuz))?;
        let user_auth_token = get_str("access_token")
            .or_else(|| get_str("user_auth_token"))
            .ok_or(CatalogError::AuthMissing(Provider::Qobuz))?;

        Ok(Self {
            http: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .map_err(|e| super::transport_error(Provider::Qobuz, e))?,
            api_base: API_BASE.to_string(),
            app_id,
            user_auth_token,
            app_secret: get_str("app_secret"),
        })
    }

    /// Point the client at an alternate endpoint (tests, proxies).
    pub fn with_base_url(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(&str, String)],
        data: &[(&str, String)],
    ) -> Result<serde_json::Value, CatalogError> {
        let mut query: BTreeMap<String, String> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        query
            .entry("app_id".to_string())
            .or_insert_with(|| self.app_id.clone());
        query
            .entry("user_auth_token".to_string())
            .or_insert_with(|| self.user_auth_token.clone());

        if let Some(secret) = &self.app_secret {
            let ts = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs()
                .to_string();
            query.insert("request_ts".to_string(), ts.clone());

            // The signature covers query params and form data alike.
            let mut signed = query.clone();
            for (key, value) in data {
                signed.insert(key.to_string(), value.clone());
            }
            query.insert(
                "request_sig".to_string(),
                request_signature(endpoint, &signed, &ts, secret),
            );
        }

        let url = format!("{}/{}", self.api_base, endpoint);
        let query_pairs: Vec<(String, String)> = query.into_iter().collect();
        let response = send_with_retry(Provider::Qobuz, || {
            let mut request = self.http.request(method.clone(), &url).query(&query_pairs);
            if !data.is_empty() {
                request = request.form(data);
            }
            request
        })
        .await?;

        if !response.status().is_success() {
            return Err(status_error(Provider::Qobuz, response).await);
        }

        let payload: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| CatalogError::InvalidResponse {
                    provider: Provider::Qobuz,
                    detail: e.to_string(),
                })?;

        // Qobuz reports some failures inside a 200 envelope.
        if let Ok(ErrorEnvelope { error: Some(body) }) =
            serde_json::from_value::<ErrorEnvelope>(payload.clone())
        {
            return Err(CatalogError::InvalidResponse {
                provider: Provider::Qobuz,
                detail: body.message.unwrap_or_else(|| "unknown qobuz error".to_string()),
            });
        }
        Ok(payload)
    }

    fn candidate_from_item(item: TrackItem) -> Option<Candidate> {
        let target_id = item.id.as_ref().and_then(id_to_string)?;
        let mut artists: Vec<String> = Vec::new();
        if let Some(name) = item.artist.and_then(|a| a.name) {
            artists.push(name);
        }
        for extra in item.artists {
            if let Some(name) = extra.name {
                if !artists.contains(&name) {
                    artists.push(name);
                }
            }
        }
        Some(Candidate {
            target_id,
            title: item.title.unwrap_or_default(),
            artists,
            album: item.album.and_then(|a| a.title),
            duration_secs: item.duration,
            isrc: item.isrc,
            score: None,
        })
    }
}

#[async_trait]
impl TargetCatalog for QobuzCatalog {
    fn provider(&self) -> Provider {
        Provider::Qobuz
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Candidate>, CatalogError> {
        let payload = self
            .request(
                Method::GET,
                "track/search",
                &[("query", query.to_string()), ("limit", limit.to_string())],
                &[],
            )
            .await?;
        let response: SearchResponse =
            serde_json::from_value(payload).map_err(|e| CatalogError::InvalidResponse {
                provider: Provider::Qobuz,
                detail: e.to_string(),
            })?;
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
        privacy: PlaylistPrivacy,
    ) -> Result<String, CatalogError> {
        let is_public = if privacy == PlaylistPrivacy::Public { "1" } else { "0" };
        let payload = self
            .request(
                Method::POST,
                "playlist/create",
                &[],
                &[
                    ("name", title.to_string()),
                    ("description", description.to_string()),
                    ("is_public", is_public.to_string()),
                ],
            )
            .await?;
        let envelope: PlaylistEnvelope =
            serde_json::from_value(payload).map_err(|e| CatalogError::InvalidResponse {
                provider: Provider::Qobuz,
                detail: e.to_string(),
            })?;
        envelope
            .playlist
            .and_then(|p| p.id)
            .or(envelope.id)
            .as_ref()
            .and_then(id_to_string)
            .ok_or_else(|| CatalogError::InvalidResponse {
                provider: Provider::Qobuz,
                detail: "playlist create returned no id".to_string(),
            })
    }

    async fn existing_items(&self, playlist_id: &str) -> HashSet<String> {
        let payload = match self
            .request(
                Method::GET,
                "playlist/get",
                &[
                    ("playlist_id", playlist_id.to_string()),
                    ("extra", "tracks".to_string()),
                ],
                &[],
            )
            .await
        {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(playlist = %playlist_id, error = %e, "could not fetch existing qobuz items");
                return HashSet::new();
            }
        };

        // Depending on the endpoint version the playlist object comes back
        // wrapped or at the top level.
        let node = payload.get("playlist").unwrap_or(&payload).clone();
        let body: PlaylistBody = match serde_json::from_value(node) {
            Ok(body) => body,
            Err(_) => return HashSet::new(),
        };
        body.tracks
            .map(|tracks| {
                tracks
                    .items
                    .iter()
                    .filter_map(|item| item.id.as_ref().and_then(id_to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn add_items(
        &self,
        playlist_id: &str,
        ids: &[String],
    ) -> Result<AddOutcome, CatalogError> {
        self.request(
            Method::POST,
            "playlist/addTracks",
            &[("playlist_id", playlist_id.to_string())],
            &[("track_ids", ids.join(","))],
        )
        .await?;
        Ok(AddOutcome::ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_signature_is_deterministic() {
        let mut params = BTreeMap::new();
        params.insert("playlist_id".to_string(), "42".to_string());
        params.insert("app_id".to_string(), "app".to_string());
        let first = request_signature("playlist/addTracks", &params, "1700000000", "secret");
        let second = request_signature("playlist/addTracks", &params, "1700000000", "secret");
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
    }

    #[test]
    fn test_request_signature_orders_params() {
        // BTreeMap ordering means insertion order cannot change the digest.
        let mut forward = BTreeMap::new();
        forward.insert("a".to_string(), "1".to_string());
        forward.insert("b".to_string(), "2".to_string());
        let mut reverse = BTreeMap::new();
        reverse.insert("b".to_string(), "2".to_string());
        reverse.insert("a".to_string(), "1".to_string());
        assert_eq!(
            request_signature("track/search", &forward, "1", "s"),
            request_signature("track/search", &reverse, "1", "s")
        );
    }
}
