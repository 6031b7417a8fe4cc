use serde::{Deserialize, Serialize};

/// A track as described by the source catalog. Immutable within a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceTrack {
    pub name: String,
    /// Ordered; the first artist drives search query construction.
    pub artists: Vec<String>,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub isrc: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
}

impl SourceTrack {
    /// Human readable label for logs and review diagnostics.
    pub fn label(&self) -> String {
        let artist = self.artists.join(", ");
        let title = if self.name.is_empty() {
            "Unknown Title"
        } else {
            self.name.as_str()
        };
        match self.album.as_deref().filter(|a| !a.is_empty()) {
            Some(album) => format!("{} — {} — {}", artist, album, title),
            None => format!("{} — {}", artist, title),
        }
    }

    /// Free-text search query: `"<title> <first-artist>"`, trimmed.
    pub fn search_query(&self) -> String {
        let first_artist = self.artists.first().map(String::as_str).unwrap_or("");
        format!("{} {}", self.name, first_artist).trim().to_string()
    }
}

/// A target-catalog search result, annotated with a similarity score once
/// the matcher has seen it. Durations are seconds at this boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candidate {
    pub target_id: String,
    pub title: String,
    pub artists: Vec<String>,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub isrc: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
}

/// Extract the playlist id from a canonical playlist URL
/// (`…/playlist/<ID>[?query]`).
pub fn extract_playlist_id(playlist_url: &str) -> Option<String> {
    let (_, rest) = playlist_url.split_once("/playlist/")?;
    let id = rest
        .split(&['?', '/'][..])
        .next()
        .unwrap_or_default()
        .to_string();
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_playlist_id_canonical() {
        assert_eq!(
            extract_playlist_id("https://open.spotify.com/playlist/37i9dQZF1DXcBWIGoYBM5M"),
            Some("37i9dQZF1DXcBWIGoYBM5M".to_string())
        );
    }

    #[test]
    fn test_extract_playlist_id_with_query_and_suffix() {
        assert_eq!(
            extract_playlist_id("https://open.spotify.com/playlist/abc123?si=xyz"),
            Some("abc123".to_string())
        );
        assert_eq!(
            extract_playlist_id("https://open.spotify.com/playlist/abc123/extra"),
            Some("abc123".to_string())
        );
    }

    #[test]
    fn test_extract_playlist_id_invalid() {
        assert_eq!(extract_playlist_id("https://open.spotify.com/album/abc"), None);
        assert_eq!(extract_playlist_id("https://open.spotify.com/playlist/"), None);
        assert_eq!(extract_playlist_id(""), None);
    }

    #[test]
    fn test_label_formats() {
        let track = SourceTrack {
            name: "Hello".to_string(),
            artists: vec!["Adele".to_string()],
            album: Some("25".to_string()),
            duration_ms: Some(295_000),
            isrc: None,
            source_id: None,
        };
        assert_eq!(track.label(), "Adele — 25 — Hello");

        let bare = SourceTrack {
            name: String::new(),
            artists: vec![],
            album: None,
            duration_ms: None,
            isrc: None,
            source_id: None,
        };
        assert_eq!(bare.label(), " — Unknown Title");
    }

    #[test]
    fn test_search_query_trims_missing_artist() {
        let track = SourceTrack {
            name: "Hello".to_string(),
            artists: vec![],
            album: None,
            duration_ms: None,
            isrc: None,
            source_id: None,
        };
        assert_eq!(track.search_query(), "Hello");
    }
}
