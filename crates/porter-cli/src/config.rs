use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use porter_session::{CredentialProvider, HttpTransportConfig};
use porter_upload::{BatchConfig, DEFAULT_CHUNK_SIZE, RouteConfig};

/// Largest body the upload routes accept in one call.
const MAX_CHUNK_SIZE: u64 = 150 * 1024 * 1024;

const BACKGROUND_IDENTIFIER: &str = "porter.background";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Settings read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Config {
    pub access_token: String,
    pub api_url: String,
    pub content_url: String,
    pub chunk_size: u64,
    pub temp_dir: PathBuf,
    /// Enables the background transport. Unfinished transfers are kept here.
    pub journal_path: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let defaults = RouteConfig::default();

        let access_token = get("PORTER_ACCESS_TOKEN").ok_or(ConfigError::Missing("PORTER_ACCESS_TOKEN"))?;
        let chunk_size = match get("PORTER_CHUNK_SIZE") {
            Some(raw) => parse_chunk_size(&raw)?,
            None => DEFAULT_CHUNK_SIZE,
        };

        Ok(Self {
            access_token,
            api_url: get("PORTER_API_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_url),
            content_url: get("PORTER_CONTENT_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.content_url),
            chunk_size,
            temp_dir: get("PORTER_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("porter")),
            journal_path: get("PORTER_JOURNAL_PATH").map(PathBuf::from),
        })
    }

    pub fn routes(&self) -> RouteConfig {
        RouteConfig {
            api_url: self.api_url.clone(),
            content_url: self.content_url.clone(),
            access_token: self.access_token.clone(),
        }
    }

    pub fn batch(&self) -> BatchConfig {
        BatchConfig {
            chunk_size: self.chunk_size,
            temp_root: self.temp_dir.join("batch"),
            ..BatchConfig::default()
        }
    }

    pub fn foreground_transport(&self) -> HttpTransportConfig {
        HttpTransportConfig {
            download_dir: self.temp_dir.join("downloads"),
            ..HttpTransportConfig::default()
        }
    }

    /// `None` without a journal path. Restored tasks are re-authorized with
    /// the current token.
    pub fn background_transport(&self) -> Option<HttpTransportConfig> {
        let journal = self.journal_path.as_ref()?;
        let bearer = format!("Bearer {}", self.access_token);
        let credentials: CredentialProvider =
            Arc::new(move || vec![("Authorization".to_string(), bearer.clone())]);
        Some(HttpTransportConfig {
            download_dir: self.temp_dir.join("downloads"),
            credentials: Some(credentials),
            ..HttpTransportConfig::background(BACKGROUND_IDENTIFIER, journal)
        })
    }
}

/// Accepts plain bytes or a `K`/`M` suffix (binary units).
fn parse_chunk_size(raw: &str) -> Result<u64, ConfigError> {
    let raw = raw.trim();
    let (digits, unit) = match raw.char_indices().last() {
        Some((at, 'k' | 'K')) => (&raw[..at], 1024),
        Some((at, 'm' | 'M')) => (&raw[..at], 1024 * 1024),
        _ => (raw, 1),
    };
    let invalid = |reason: String| ConfigError::Invalid {
        name: "PORTER_CHUNK_SIZE",
        reason,
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|err| invalid(format!("{raw:?}: {err}")))?;
    let size = value
        .checked_mul(unit)
        .ok_or_else(|| invalid(format!("{raw:?} overflows")))?;
    if size == 0 || size > MAX_CHUNK_SIZE {
        return Err(invalid(format!("must be between 1 byte and {MAX_CHUNK_SIZE} bytes")));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn token_is_required() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("PORTER_ACCESS_TOKEN"));

        let err = Config::from_lookup(lookup(&[("PORTER_ACCESS_TOKEN", "  ")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("PORTER_ACCESS_TOKEN"));
    }

    #[test]
    fn defaults_follow_the_libraries() {
        let config = Config::from_lookup(lookup(&[("PORTER_ACCESS_TOKEN", "t0k")])).unwrap();
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.api_url, RouteConfig::default().api_url);
        assert!(config.journal_path.is_none());
        assert!(config.background_transport().is_none());

        let routes = config.routes();
        assert_eq!(routes.access_token, "t0k");
        assert_eq!(config.batch().max_retries, porter_upload::DEFAULT_MAX_RETRIES);
        assert!(config.foreground_transport().identifier.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = Config::from_lookup(lookup(&[
            ("PORTER_ACCESS_TOKEN", "t0k"),
            ("PORTER_API_URL", "http://localhost:9000/2/"),
            ("PORTER_CHUNK_SIZE", "8M"),
            ("PORTER_TEMP_DIR", "/var/tmp/porter"),
            ("PORTER_JOURNAL_PATH", "/var/lib/porter/journal.json"),
        ]))
        .unwrap();
        assert_eq!(config.api_url, "http://localhost:9000/2");
        assert_eq!(config.chunk_size, 8 * 1024 * 1024);
        assert_eq!(config.batch().temp_root, PathBuf::from("/var/tmp/porter/batch"));

        let background = config.background_transport().unwrap();
        assert_eq!(background.identifier.as_deref(), Some(BACKGROUND_IDENTIFIER));
        let credentials = background.credentials.as_ref().unwrap();
        assert_eq!(
            credentials(),
            vec![("Authorization".to_string(), "Bearer t0k".to_string())]
        );
        assert_eq!(
            background.journal_path,
            Some(PathBuf::from("/var/lib/porter/journal.json"))
        );
    }

    #[test]
    fn chunk_size_parsing() {
        assert_eq!(parse_chunk_size("4096").unwrap(), 4096);
        assert_eq!(parse_chunk_size("64k").unwrap(), 64 * 1024);
        assert_eq!(parse_chunk_size(" 2 M ").unwrap(), 2 * 1024 * 1024);
        assert!(parse_chunk_size("0").is_err());
        assert!(parse_chunk_size("151M").is_err());
        assert!(parse_chunk_size("lots").is_err());
    }
}
