//! Configuration file parser for `feedmill.toml`.
//!
//! The config file is optional: a missing or empty file yields
//! `Config::default()`. Unknown keys are ignored by serde but logged, since
//! they are usually typos.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::feed::{
    FetchConfig, DEFAULT_CONCURRENCY_LIMIT, DEFAULT_FETCH_TIMEOUT, DEFAULT_MAX_FEED_BYTES,
    DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE_DELAY, DEFAULT_USER_AGENT,
};
use crate::util::HostPolicy;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// SEC-014: Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// A list to create at startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListConfig {
    pub name: String,
}

/// A feed to subscribe to at startup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeedConfig {
    pub url: String,
    #[serde(default)]
    pub title: Option<String>,
    /// List name; the default list when absent or unknown.
    #[serde(default)]
    pub list: Option<String>,
}

/// Top-level configuration. Any subset of keys may be given.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub concurrency_limit: usize,
    pub fetch_timeout_secs: u64,
    pub max_feed_bytes: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub user_agent: String,
    /// Allow feeds on localhost and private networks. Off by default (SSRF).
    pub allow_private_hosts: bool,
    /// SQLite file for persisting the store between runs.
    pub database_path: Option<PathBuf>,
    pub lists: Vec<ListConfig>,
    pub feeds: Vec<FeedConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT.as_secs(),
            max_feed_bytes: DEFAULT_MAX_FEED_BYTES,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY.as_millis() as u64,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            allow_private_hosts: false,
            database_path: None,
            lists: Vec::new(),
            feeds: Vec::new(),
        }
    }
}

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 10] = [
        "concurrency_limit",
        "fetch_timeout_secs",
        "max_feed_bytes",
        "max_retries",
        "retry_base_delay_ms",
        "user_agent",
        "allow_private_hosts",
        "database_path",
        "lists",
        "feeds",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Zero concurrency or timeout → `Err(ConfigError::Invalid)`
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // SEC-014: Check file size before reading to prevent memory exhaustion
        // from a maliciously large or corrupted config file.
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Race condition: file deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let config = Self::from_toml(&content)?;
        tracing::info!(
            path = %path.display(),
            feeds = config.feeds.len(),
            lists = config.lists.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parses and validates TOML text. Blank input yields the defaults.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        // Parse as a raw table first to detect unknown keys
        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.fetch_config().validate().map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.user_agent.trim().is_empty() {
            return Err(ConfigError::Invalid("user_agent must not be empty".into()));
        }
        Ok(())
    }

    /// Fetcher settings derived from this config. Validated by `load`.
    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            concurrency_limit: self.concurrency_limit,
            timeout: Duration::from_secs(self.fetch_timeout_secs),
            max_body_bytes: self.max_feed_bytes,
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            host_policy: HostPolicy::from_allow_private(self.allow_private_hosts),
            user_agent: self.user_agent.clone(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.concurrency_limit, 6);
        assert_eq!(config.fetch_timeout_secs, 20);
        assert_eq!(config.max_feed_bytes, 10 * 1024 * 1024);
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.retry_base_delay_ms, 500);
        assert!(!config.allow_private_hosts);
        assert!(config.database_path.is_none());
        assert!(config.feeds.is_empty());
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/feedmill_test_nonexistent_config.toml");
        assert_eq!(Config::load(path).unwrap(), Config::default());
    }

    #[test]
    fn test_empty_file_returns_default() {
        let dir = std::env::temp_dir().join("feedmill_config_test_empty");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("feedmill.toml");
        std::fs::write(&path, "  \n").unwrap();

        assert_eq!(Config::load(&path).unwrap(), Config::default());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_full_config() {
        let content = r#"
concurrency_limit = 3
fetch_timeout_secs = 5
max_feed_bytes = 1024
max_retries = 0
retry_base_delay_ms = 50
user_agent = "test-agent"
allow_private_hosts = true
database_path = "/var/lib/feedmill/db.sqlite"

[[lists]]
name = "Tech"

[[feeds]]
url = "https://a.example/feed.xml"
title = "A"
list = "Tech"

[[feeds]]
url = "https://b.example/rss"
"#;
        let config = Config::from_toml(content).unwrap();
        assert_eq!(config.concurrency_limit, 3);
        assert_eq!(
            config.database_path.as_deref(),
            Some(Path::new("/var/lib/feedmill/db.sqlite"))
        );
        assert_eq!(config.lists, vec![ListConfig { name: "Tech".into() }]);
        assert_eq!(
            config.feeds,
            vec![
                FeedConfig {
                    url: "https://a.example/feed.xml".into(),
                    title: Some("A".into()),
                    list: Some("Tech".into()),
                },
                FeedConfig {
                    url: "https://b.example/rss".into(),
                    title: None,
                    list: None,
                },
            ]
        );

        let fetch = config.fetch_config();
        assert_eq!(fetch.timeout, Duration::from_secs(5));
        assert_eq!(fetch.retry_base_delay, Duration::from_millis(50));
        assert_eq!(fetch.host_policy, HostPolicy::AllowPrivate);
        assert_eq!(fetch.user_agent, "test-agent");
    }

    #[test]
    fn test_zero_concurrency_is_invalid() {
        assert!(matches!(
            Config::from_toml("concurrency_limit = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_toml("fetch_timeout_secs = 0"),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        assert!(matches!(
            Config::from_toml("concurrency_limit = [broken"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_wrong_type_returns_error() {
        assert!(matches!(
            Config::from_toml("concurrency_limit = \"six\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let config = Config::from_toml("theme = \"dark\"\nmax_retries = 4\n").unwrap();
        assert_eq!(config.max_retries, 4);
    }

    #[test]
    fn test_oversized_file_rejected() {
        let dir = std::env::temp_dir().join("feedmill_config_test_large");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("feedmill.toml");
        let padding = "# padding\n".repeat(110_000);
        std::fs::write(&path, padding).unwrap();

        assert!(matches!(Config::load(&path), Err(ConfigError::TooLarge(_))));

        std::fs::remove_dir_all(&dir).ok();
    }
}
