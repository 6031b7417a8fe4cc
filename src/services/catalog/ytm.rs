//! YouTube Music internal-API client (target side).
//!
//! Authenticates with a browser-header credential blob (raw header lines or
//! a key/value map). The `SAPISIDHASH` authorization is recomputed per
//! request from the `SAPISID` cookie, the way the web client does it; a
//! stored `authorization` header is used verbatim as a fallback.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::{
    send_with_retry, status_error, AddOutcome, CatalogError, PlaylistPrivacy, TargetCatalog,
};
use crate::models::{Candidate, Provider};

const API_BASE: &str = "https://music.youtube.com/youtubei/v1";
const ORIGIN: &str = "https://music.youtube.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CLIENT_NAME: &str = "WEB_REMIX";
const CLIENT_VERSION: &str = "1.20240101.00.00";
/// Search params restricting results to songs.
const SONGS_FILTER_PARAMS: &str = "EgWKAQIIAWoKEAkQBRAKEAMQBA%3D%3D";

pub struct YtmCatalog {
    http: Client,
    api_base: String,
    origin: String,
    headers: BrowserHeaders,
}

/// Relevant headers extracted from the credential blob.
#[derive(Debug, Clone)]
pub struct BrowserHeaders {
    pub cookie: String,
    pub authorization: Option<String>,
    pub user_agent: Option<String>,
    pub goog_authuser: Option<String>,
}

impl BrowserHeaders {
    /// Parse a credential blob: `{"raw": "<header lines>"}`, a plain raw
    /// string, or a header name/value map. A cookie is mandatory.
    pub fn parse(credentials: &Value) -> Result<Self, CatalogError> {
        let pairs: Vec<(String, String)> = match credentials {
            Value::String(raw) => Self::split_raw(raw),
            Value::Object(map) => {
                if let Some(Value::String(raw)) = map.get("raw") {
                    Self::split_raw(raw)
                } else {
                    map.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                }
            }
            _ => Vec::new(),
        };

        let mut headers = Self {
            cookie: String::new(),
            authorization: None,
            user_agent: None,
            goog_authuser: None,
        };
        for (name, value) in pairs {
            match name.to_lowercase().as_str() {
                "cookie" => headers.cookie = value,
                "authorization" => headers.authorization = Some(value),
                "user-agent" => headers.user_agent = Some(value),
                "x-goog-authuser" => headers.goog_authuser = Some(value),
                _ => {}
            }
        }
        if headers.cookie.is_empty() {
            return Err(CatalogError::AuthMissing(Provider::YoutubeMusic));
        }
        Ok(headers)
    }

    fn split_raw(raw: &str) -> Vec<(String, String)> {
        raw.lines()
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect()
    }

    fn sapisid(&self) -> Option<String> {
        for chunk in self.cookie.split(';') {
            let (name, value) = chunk.split_once('=')?;
            let name = name.trim();
            if name == "SAPISID" || name == "__Secure-3PAPISID" {
                return Some(value.trim().to_string());
            }
        }
        None
    }
}

fn sapisid_hash(sapisid: &str, origin: &str, ts: u64) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("{} {} {}", ts, sapisid, origin).as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("SAPISIDHASH {}_{}", ts, hex)
}

/// `"3:21"` or `"1:02:03"` to seconds. Plain numbers are not durations
/// (album titles like "25" must not parse).
fn parse_duration_text(text: &str) -> Option<u64> {
    if !text.contains(':') {
        return None;
    }
    let mut seconds: u64 = 0;
    for part in text.split(':') {
        let value: u64 = part.trim().parse().ok()?;
        seconds = seconds.checked_mul(60)?.checked_add(value)?;
    }
    Some(seconds)
}

fn runs_text(node: &Value) -> Option<String> {
    let runs = node.get("runs")?.as_array()?;
    let text: Vec<&str> = runs.iter().filter_map(|r| r.get("text")?.as_str()).collect();
    if text.is_empty() {
        None
    } else {
        Some(text.concat())
    }
}

impl YtmCatalog {
    pub fn from_credentials(credentials: &Value) -> Result<Self, CatalogError> {
        let headers = BrowserHeaders::parse(credentials)?;
        Ok(Self {
            http: Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .map_err(|e| super::transport_error(Provider::YoutubeMusic, e))?,
            api_base: API_BASE.to_string(),
            origin: ORIGIN.to_string(),
            headers,
        })
    }

    /// Point the client at an alternate endpoint (tests, proxies).
    pub fn with_base_url(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    fn request_headers(&self) -> Result<HeaderMap, CatalogError> {
        let invalid = |_| CatalogError::AuthInvalid(Provider::YoutubeMusic);
        let mut map = HeaderMap::new();
        map.insert(
            HeaderName::from_static("cookie"),
            HeaderValue::from_str(&self.headers.cookie).map_err(invalid)?,
        );
        map.insert(
            HeaderName::from_static("x-origin"),
            HeaderValue::from_str(&self.origin).map_err(invalid)?,
        );

        let authorization = match self.headers.sapisid() {
            Some(sapisid) => {
                let ts = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                Some(sapisid_hash(&sapisid, &self.origin, ts))
            }
            None => self.headers.authorization.clone(),
        };
        if let Some(auth) = authorization {
            map.insert(
                HeaderName::from_static("authorization"),
                HeaderValue::from_str(&auth).map_err(invalid)?,
            );
        }
        if let Some(agent) = &self.headers.user_agent {
            map.insert(
                HeaderName::from_static("user-agent"),
                HeaderValue::from_str(agent).map_err(invalid)?,
            );
        }
        if let Some(authuser) = &self.headers.goog_authuser {
            map.insert(
                HeaderName::from_static("x-goog-authuser"),
                HeaderValue::from_str(authuser).map_err(invalid)?,
            );
        }
        Ok(map)
    }

    async fn post_endpoint(&self, endpoint: &str, mut body: Value) -> Result<Value, CatalogError> {
        body["context"] = json!({
            "client": { "clientName": CLIENT_NAME, "clientVersion": CLIENT_VERSION }
        });
        let headers = self.request_headers()?;
        let url = format!("{}/{}", self.api_base, endpoint);

        let response = send_with_retry(Provider::YoutubeMusic, || {
            self.http
                .post(&url)
                .headers(headers.clone())
                .json(&body)
        })
        .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            // Browser headers cannot be refreshed in place; the user has to
            // reconnect with a fresh capture.
            return Err(CatalogError::AuthInvalid(Provider::YoutubeMusic));
        }
        if !status.is_success() {
            return Err(status_error(Provider::YoutubeMusic, response).await);
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| CatalogError::InvalidResponse {
                provider: Provider::YoutubeMusic,
                detail: e.to_string(),
            })
    }

    fn candidates_from_search(payload: &Value) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        let sections = payload
            .pointer("/contents/tabbedSearchResultsRenderer/tabs/0/tabRenderer/content/sectionListRenderer/contents")
            .and_then(Value::as_array);
        let Some(sections) = sections else {
            return candidates;
        };

        for section in sections {
            let Some(shelf) = section
                .pointer("/musicShelfRenderer/contents")
                .and_then(Value::as_array)
            else {
                continue;
            };
            for entry in shelf {
                let Some(item) = entry.get("musicResponsiveListItemRenderer") else {
                    continue;
                };
                if let Some(candidate) = Self::candidate_from_item(item) {
                    candidates.push(candidate);
                }
            }
        }
        candidates
    }

    fn candidate_from_item(item: &Value) -> Option<Candidate> {
        let video_id = item
            .pointer("/playlistItemData/videoId")
            .and_then(Value::as_str)?
            .to_string();
        let title = item
            .pointer("/flexColumns/0/musicResponsiveListItemFlexColumnRenderer/text")
            .and_then(runs_text)
            .unwrap_or_default();

        // The secondary column runs as "Artist • Artist • Album • 3:21";
        // separators come through as literal " • " runs.
        let mut artists = Vec::new();
        let mut album = None;
        let mut duration_secs = None;
        if let Some(runs) = item
            .pointer("/flexColumns/1/musicResponsiveListItemFlexColumnRenderer/text/runs")
            .and_then(Value::as_array)
        {
            let fields: Vec<String> = runs
                .iter()
                .filter_map(|r| r.get("text").and_then(Value::as_str))
                .filter(|t| {
                    let trimmed = t.trim();
                    !trimmed.is_empty() && trimmed != "•"
                })
                .map(str::to_string)
                .collect();
            for field in fields {
                if let Some(seconds) = parse_duration_text(&field) {
                    duration_secs = Some(seconds);
                } else if album.is_none() && artists.is_empty() {
                    artists.push(field);
                } else if duration_secs.is_none() {
                    // Fields between the first artist and the duration are
                    // additional artists, then the album; keep the last one
                    // seen as the album.
                    if let Some(previous_album) = album.take() {
                        artists.push(previous_album);
                    }
                    album = Some(field);
                }
            }
        }

        Some(Candidate {
            target_id: video_id,
            title,
            artists,
            album,
            duration_secs,
            isrc: None,
            score: None,
        })
    }
}

#[async_trait]
impl TargetCatalog for YtmCatalog {
    fn provider(&self) -> Provider {
        Provider::YoutubeMusic
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<Candidate>, CatalogError> {
        let payload = self
            .post_endpoint(
                "search",
                json!({ "query": query, "params": SONGS_FILTER_PARAMS }),
            )
            .await?;
        let mut candidates = Self::candidates_from_search(&payload);
        candidates.truncate(limit);
        Ok(candidates)
    }

    async fn create_playlist(
        &self,
        title: &str,
        description: &str,
        privacy: PlaylistPrivacy,
    ) -> Result<String, CatalogError> {
        let payload = self
            .post_endpoint(
                "playlist/create",
                json!({
                    "title": title,
                    "description": description,
                    "privacyMode": privacy.as_str(),
                }),
            )
            .await?;
        payload
            .get("playlistId")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| CatalogError::InvalidResponse {
                provider: Provider::YoutubeMusic,
                detail: "playlist create returned no playlistId".to_string(),
            })
    }

    async fn existing_items(&self, playlist_id: &str) -> HashSet<String> {
        let browse_id = if playlist_id.starts_with("VL") {
            playlist_id.to_string()
        } else {
            format!("VL{}", playlist_id)
        };
        let payload = match self
            .post_endpoint("browse", json!({ "browseId": browse_id }))
            .await
        {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(playlist = %playlist_id, error = %e, "could not fetch existing ytm items");
                return HashSet::new();
            }
        };

        let mut ids = HashSet::new();
        if let Some(contents) = payload
            .pointer("/contents/singleColumnBrowseResultsRenderer/tabs/0/tabRenderer/content/sectionListRenderer/contents/0/musicPlaylistShelfRenderer/contents")
            .and_then(Value::as_array)
        {
            for entry in contents {
                if let Some(video_id) = entry
                    .pointer("/musicResponsiveListItemRenderer/playlistItemData/videoId")
                    .and_then(Value::as_str)
                {
                    ids.insert(video_id.to_string());
                }
            }
        }
        ids
    }

    async fn add_items(
        &self,
        playlist_id: &str,
        ids: &[String],
    ) -> Result<AddOutcome, CatalogError> {
        let actions: Vec<Value> = ids
            .iter()
            .map(|id| json!({ "action": "ACTION_ADD_VIDEO", "addedVideoId": id }))
            .collect();
        let payload = self
            .post_endpoint(
                "browse/edit_playlist",
                json!({
                    "playlistId": playlist_id,
                    "actions": actions,
                    // duplicates stay out; the writer pre-filters as well
                    "dedupeOption": "DEDUPE_OPTION_DROP_DUPLICATE",
                }),
            )
            .await?;

        match payload.get("status").and_then(Value::as_str) {
            None | Some("STATUS_SUCCEEDED") => Ok(AddOutcome::ok()),
            Some(other) => Ok(AddOutcome::non_success(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_raw_header_lines() {
        let blob = Value::String(
            "Cookie: SAPISID=abc123; other=1\nUser-Agent: Mozilla/5.0\nX-Goog-AuthUser: 0"
                .to_string(),
        );
        let headers = BrowserHeaders::parse(&blob).unwrap();
        assert!(headers.cookie.contains("SAPISID=abc123"));
        assert_eq!(headers.user_agent.as_deref(), Some("Mozilla/5.0"));
        assert_eq!(headers.goog_authuser.as_deref(), Some("0"));
        assert_eq!(headers.sapisid().as_deref(), Some("abc123"));
    }

    #[test]
    fn test_parse_header_map_and_raw_wrapper() {
        let map = serde_json::json!({ "cookie": "SAPISID=zzz", "authorization": "Bearer x" });
        let headers = BrowserHeaders::parse(&map).unwrap();
        assert_eq!(headers.authorization.as_deref(), Some("Bearer x"));

        let wrapped = serde_json::json!({ "raw": "Cookie: SAPISID=yyy" });
        assert_eq!(BrowserHeaders::parse(&wrapped).unwrap().sapisid().as_deref(), Some("yyy"));
    }

    #[test]
    fn test_missing_cookie_is_auth_missing() {
        let blob = serde_json::json!({ "authorization": "Bearer x" });
        assert!(matches!(
            BrowserHeaders::parse(&blob),
            Err(CatalogError::AuthMissing(Provider::YoutubeMusic))
        ));
    }

    #[test]
    fn test_sapisid_hash_shape() {
        let hash = sapisid_hash("abc", "https://music.youtube.com", 1700000000);
        assert!(hash.starts_with("SAPISIDHASH 1700000000_"));
        let hex = hash.rsplit('_').next().unwrap();
        assert_eq!(hex.len(), 40);
    }

    #[test]
    fn test_parse_duration_text() {
        assert_eq!(parse_duration_text("3:21"), Some(201));
        assert_eq!(parse_duration_text("1:02:03"), Some(3723));
        assert_eq!(parse_duration_text("0:59"), Some(59));
        assert_eq!(parse_duration_text("n/a"), None);
        assert_eq!(parse_duration_text("25"), None);
        assert_eq!(parse_duration_text(""), None);
    }

    #[test]
    fn test_candidates_from_search_payload() {
        let payload = serde_json::json!({
            "contents": { "tabbedSearchResultsRenderer": { "tabs": [ { "tabRenderer": { "content": {
                "sectionListRenderer": { "contents": [ { "musicShelfRenderer": { "contents": [
                    { "musicResponsiveListItemRenderer": {
                        "playlistItemData": { "videoId": "vid-1" },
                        "flexColumns": [
                            { "musicResponsiveListItemFlexColumnRenderer": { "text": { "runs": [ { "text": "Hello" } ] } } },
                            { "musicResponsiveListItemFlexColumnRenderer": { "text": { "runs": [
                                { "text": "Adele" }, { "text": " • " }, { "text": "25" }, { "text": " • " }, { "text": "4:55" }
                            ] } } }
                        ]
                    } }
                ] } } ] }
            } } } ] } }
        });
        let candidates = YtmCatalog::candidates_from_search(&payload);
        assert_eq!(candidates.len(), 1);
        let candidate = &candidates[0];
        assert_eq!(candidate.target_id, "vid-1");
        assert_eq!(candidate.title, "Hello");
        assert_eq!(candidate.artists, vec!["Adele".to_string()]);
        assert_eq!(candidate.album.as_deref(), Some("25"));
        assert_eq!(candidate.duration_secs, Some(295));
    }

    #[test]
    fn test_candidates_from_empty_payload() {
        assert!(YtmCatalog::candidates_from_search(&serde_json::json!({})).is_empty());
    }
}
