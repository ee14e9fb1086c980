use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use url::Url;

/// A normalized crawl target: `http`/`https` only, fragment stripped,
/// otherwise left in the canonical form produced by the URL parser.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetUrl(Url);

impl TargetUrl {
    pub fn parse(raw: &str) -> Result<Self, UrlError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(UrlError::Empty);
        }

        let mut url = Url::parse(raw).map_err(UrlError::Parse)?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(UrlError::UnsupportedScheme(other.to_string())),
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(UrlError::MissingHost);
        }

        url.set_fragment(None);
        Ok(Self(url))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn as_url(&self) -> &Url {
        &self.0
    }

    /// Path plus query, as matched against robots rules.
    pub fn path_and_query(&self) -> String {
        match self.0.query() {
            Some(query) => format!("{}?{}", self.0.path(), query),
            None => self.0.path().to_string(),
        }
    }

    /// `scheme://host[:port]/robots.txt` for this target's origin.
    pub fn robots_url(&self) -> Url {
        let mut robots = self.0.clone();
        robots.set_path("/robots.txt");
        robots.set_query(None);
        // Credentials never belong in the policy request.
        let _ = robots.set_username("");
        let _ = robots.set_password(None);
        robots
    }
}

impl FromStr for TargetUrl {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for TargetUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for TargetUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UrlError {
    #[error("URL is empty")]
    Empty,

    #[error("URL could not be parsed: {0}")]
    Parse(#[from] url::ParseError),

    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("URL has no host")]
    MissingHost,
}
