use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Streaming catalog a connection or job refers to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Spotify,
    YoutubeMusic,
    Tidal,
    Qobuz,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Spotify => "spotify",
            Provider::YoutubeMusic => "youtube_music",
            Provider::Tidal => "tidal",
            Provider::Qobuz => "qobuz",
        }
    }

    /// Providers a playlist can be migrated into.
    pub fn is_target(&self) -> bool {
        !matches!(self, Provider::Spotify)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "spotify" => Ok(Provider::Spotify),
            "youtube_music" | "ytm" => Ok(Provider::YoutubeMusic),
            "tidal" => Ok(Provider::Tidal),
            "qobuz" => Ok(Provider::Qobuz),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_round_trip() {
        for provider in [
            Provider::Spotify,
            Provider::YoutubeMusic,
            Provider::Tidal,
            Provider::Qobuz,
        ] {
            assert_eq!(provider.as_str().parse::<Provider>().unwrap(), provider);
        }
    }

    #[test]
    fn test_provider_aliases_and_case() {
        assert_eq!("ytm".parse::<Provider>().unwrap(), Provider::YoutubeMusic);
        assert_eq!("TIDAL".parse::<Provider>().unwrap(), Provider::Tidal);
        assert!("deezer".parse::<Provider>().is_err());
    }

    #[test]
    fn test_target_capability() {
        assert!(!Provider::Spotify.is_target());
        assert!(Provider::YoutubeMusic.is_target());
        assert!(Provider::Tidal.is_target());
        assert!(Provider::Qobuz.is_target());
    }
}
