//! Configuration file parser for ~/.config/feedmill/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are silently ignored by serde (with `deny_unknown_fields` off),
//! though we log a warning when the file contains potential typos.
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable that overrides `database_path`.
pub const DATABASE_ENV: &str = "FEEDMILL_DATABASE";

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

    /// The item store could not be opened at startup. Fatal: no trigger may run without it.
    #[error("Item store unreachable at '{path}': {reason}")]
    StoreUnreachable { path: String, reason: String },
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Where collected items go after deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Chunk into durable queue jobs consumed by the worker pool.
    Queue,
    /// Persist and enrich inline through the sequential processor.
    Sequential,
}

/// Delay shape between retries of a failed queue job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Top-level application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// Missing keys fall back to `Default::default()`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file. `:memory:` is accepted for throwaway runs.
    pub database_path: PathBuf,

    /// Outline (OPML) document downloaded by the outline ingestion trigger.
    pub outline_url: String,

    /// `User-Agent` sent with every feed and article request.
    pub user_agent: String,

    /// Per-request timeout for feed fetches, in seconds.
    pub feed_timeout_secs: u64,

    /// Default destination for collected items.
    pub dispatch_mode: DispatchMode,

    /// Socket address for `feedmill serve`.
    pub listen_addr: String,

    pub queue: QueueConfig,
    pub enrich: EnrichConfig,
    pub registry: RegistryConfig,
}

/// `[queue]` section: chunking, retry policy and worker pool sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Items per queued chunk job.
    pub chunk_size: usize,
    /// Total attempts per job (first run included).
    pub attempts: u32,
    pub backoff: BackoffKind,
    /// Fixed delay, or base delay for exponential backoff, in milliseconds.
    pub backoff_ms: u64,
    /// Chunk handlers running at the same time.
    pub concurrency: usize,
    /// Idle wait between claim attempts when no job is due, in milliseconds.
    pub poll_interval_ms: u64,
}

/// `[enrich]` section: sequential processor pacing and limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnrichConfig {
    pub batch_size: usize,
    /// Deadline for one item's fetch + extraction, in milliseconds.
    pub item_timeout_ms: u64,
    pub max_description_chars: usize,
    /// Pause between two items of the same batch, in milliseconds.
    pub item_delay_ms: u64,
    /// Pause between two batches, in milliseconds.
    pub batch_delay_ms: u64,
}

/// `[registry]` section: publisher roster maintenance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub upsert_batch_size: usize,
    /// Publishers health-checked concurrently during a prune sweep.
    pub prune_group_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("feedmill.db"),
            outline_url: "https://raw.githubusercontent.com/kilimchoi/engineering-blogs/master/engineering_blogs.opml".to_string(),
            user_agent: format!("Mozilla/5.0 (compatible; feedmill/{})", env!("CARGO_PKG_VERSION")),
            feed_timeout_secs: 10,
            dispatch_mode: DispatchMode::Queue,
            listen_addr: "127.0.0.1:3000".to_string(),
            queue: QueueConfig::default(),
            enrich: EnrichConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            attempts: 3,
            backoff: BackoffKind::Fixed,
            backoff_ms: 1000,
            concurrency: 5,
            poll_interval_ms: 500,
        }
    }
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            item_timeout_ms: 3000,
            max_description_chars: 5000,
            item_delay_ms: 250,
            batch_delay_ms: 1000,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            upsert_batch_size: 100,
            prune_group_size: 2,
        }
    }
}

impl Config {
    /// SEC-014: Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 9] = [
        "database_path",
        "outline_url",
        "user_agent",
        "feed_timeout_secs",
        "dispatch_mode",
        "listen_addr",
        "queue",
        "enrich",
        "registry",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → silently accepted (serde default behavior), logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // SEC-014: Check file size before reading to prevent memory exhaustion
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

        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text. Blank text yields the defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            tracing::debug!("Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        tracing::info!(
            database = %config.database_path.display(),
            dispatch_mode = ?config.dispatch_mode,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Apply environment overrides on top of file values.
    pub fn apply_env(mut self) -> Self {
        if let Ok(path) = std::env::var(DATABASE_ENV) {
            if !path.trim().is_empty() {
                tracing::debug!(path = %path, "Database path overridden from environment");
                self.database_path = PathBuf::from(path);
            }
        }
        self
    }

    pub fn feed_timeout(&self) -> Duration {
        Duration::from_secs(self.feed_timeout_secs)
    }
}

impl EnrichConfig {
    pub fn item_timeout(&self) -> Duration {
        Duration::from_millis(self.item_timeout_ms)
    }

    pub fn item_delay(&self) -> Duration {
        Duration::from_millis(self.item_delay_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.queue.chunk_size, 1000);
        assert_eq!(config.queue.attempts, 3);
        assert_eq!(config.queue.backoff, BackoffKind::Fixed);
        assert_eq!(config.queue.backoff_ms, 1000);
        assert_eq!(config.queue.concurrency, 5);
        assert_eq!(config.enrich.batch_size, 50);
        assert_eq!(config.enrich.item_timeout(), Duration::from_secs(3));
        assert_eq!(config.enrich.max_description_chars, 5000);
        assert_eq!(config.registry.prune_group_size, 2);
        assert_eq!(config.dispatch_mode, DispatchMode::Queue);
        assert!(config.user_agent.contains("feedmill"));
    }

    #[test]
    fn test_missing_file_returns_default() {
        let path = Path::new("/tmp/feedmill_test_nonexistent_config.toml");
        let config = Config::load(path).unwrap();
        assert_eq!(config.queue.chunk_size, 1000);
    }

    #[test]
    fn test_whitespace_only_returns_default() {
        let config = Config::from_toml_str("   \n  \n  ").unwrap();
        assert_eq!(config.enrich.batch_size, 50);
    }

    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let config = Config::from_toml_str(
            r#"
dispatch_mode = "sequential"

[enrich]
item_timeout_ms = 1500
"#,
        )
        .unwrap();
        assert_eq!(config.dispatch_mode, DispatchMode::Sequential);
        assert_eq!(config.enrich.item_timeout_ms, 1500);
        assert_eq!(config.enrich.batch_size, 50); // default
        assert_eq!(config.queue.concurrency, 5); // default
    }

    #[test]
    fn test_full_config() {
        let config = Config::from_toml_str(
            r#"
database_path = "/var/lib/feedmill/items.db"
outline_url = "https://example.com/blogs.opml"
user_agent = "TestBot/2.0"
feed_timeout_secs = 20
listen_addr = "0.0.0.0:8080"

[queue]
chunk_size = 250
attempts = 5
backoff = "exponential"
backoff_ms = 200
concurrency = 3
poll_interval_ms = 50

[enrich]
batch_size = 10
item_timeout_ms = 500
max_description_chars = 100
item_delay_ms = 0
batch_delay_ms = 0

[registry]
upsert_batch_size = 2
prune_group_size = 4
"#,
        )
        .unwrap();
        assert_eq!(
            config.database_path,
            PathBuf::from("/var/lib/feedmill/items.db")
        );
        assert_eq!(config.user_agent, "TestBot/2.0");
        assert_eq!(config.feed_timeout(), Duration::from_secs(20));
        assert_eq!(config.queue.backoff, BackoffKind::Exponential);
        assert_eq!(config.queue.chunk_size, 250);
        assert_eq!(config.queue.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.enrich.max_description_chars, 100);
        assert_eq!(config.registry.prune_group_size, 4);
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let err = Config::from_toml_str("this is not [valid toml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_unknown_dispatch_mode_rejected() {
        assert!(Config::from_toml_str("dispatch_mode = \"carrier-pigeon\"\n").is_err());
    }

    #[test]
    fn test_unknown_keys_accepted() {
        let config = Config::from_toml_str("totally_fake_key = 1\n[enrich]\nbatch_size = 7\n").unwrap();
        assert_eq!(config.enrich.batch_size, 7);
    }

    // SEC-014: File size limit
    #[test]
    fn test_too_large_file_rejected() {
        let dir = std::env::temp_dir().join("feedmill_config_test_too_large");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "a".repeat(1_048_577)).unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TooLarge(_)));
        assert!(err.to_string().contains("too large"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_load_reads_file() {
        let dir = std::env::temp_dir().join("feedmill_config_test_load");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[queue]\nconcurrency = 9\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.queue.concurrency, 9);

        std::fs::remove_dir_all(&dir).ok();
    }
}
