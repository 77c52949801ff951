//! Configuration file parser for `<config_dir>/config.toml`.
//!
//! The config file is optional: a missing or empty file yields
//! `Config::default()`. Unknown keys are accepted by serde and logged as
//! warnings. The engine re-reads this file at the start of every cycle, so
//! edits take effect on the next cycle.
use secrecy::SecretString;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::content::{ArticleFormat, VideoResolution};

/// Environment variable that overrides `api_token` from the file.
pub const TOKEN_ENV_VAR: &str = "OFFLINE_MODE_API_TOKEN";

pub const DEFAULT_API_BASE_URL: &str = "https://api.raindrop.io/rest/v1";
pub const DEFAULT_READER_BASE_URL: &str = "https://r.jina.ai";

const MIN_SYNC_INTERVAL_SECS: u64 = 60;
const MAX_CONCURRENCY: usize = 8;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config file exceeds maximum allowed size.
    #[error("Config file too large: {0}")]
    TooLarge(String),

    /// The configuration parses but cannot drive a sync cycle.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Struct
// ============================================================================

/// Settings consumed by the sync engine.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
/// `Debug` masks `api_token`.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Raindrop.io API token. `OFFLINE_MODE_API_TOKEN` takes precedence.
    pub api_token: Option<String>,

    /// Folder that receives the "Offline Mode" tree.
    pub download_path: PathBuf,

    /// Download the video facet of video bookmarks.
    pub video_enabled: bool,

    pub video_resolution: VideoResolution,

    /// Seconds between scheduled cycles (minimum 60).
    pub sync_interval_seconds: u64,

    /// Consecutive failed cycles after which an item is no longer retried.
    pub retry_ceiling: u32,

    /// Parallel item fetches within one cycle (1..=8).
    pub concurrency: usize,

    /// Per-request timeout for catalog and article calls.
    pub request_timeout_seconds: u64,

    /// How long `stop` waits for the in-flight item to finish.
    pub shutdown_grace_seconds: u64,

    pub api_base_url: String,

    pub article_format: ArticleFormat,

    /// Reader proxy used by `article_format = "markdown"`.
    pub reader_base_url: String,

    /// Explicit path to yt-dlp; looked up in `PATH` when unset.
    pub yt_dlp_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_token: None,
            download_path: dirs::download_dir().unwrap_or_default(),
            video_enabled: false,
            video_resolution: VideoResolution::default(),
            sync_interval_seconds: 12 * 60 * 60,
            retry_ceiling: 3,
            concurrency: 3,
            request_timeout_seconds: 30,
            shutdown_grace_seconds: 30,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            article_format: ArticleFormat::default(),
            reader_base_url: DEFAULT_READER_BASE_URL.to_string(),
            yt_dlp_path: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .field("download_path", &self.download_path)
            .field("video_enabled", &self.video_enabled)
            .field("video_resolution", &self.video_resolution)
            .field("sync_interval_seconds", &self.sync_interval_seconds)
            .field("retry_ceiling", &self.retry_ceiling)
            .field("concurrency", &self.concurrency)
            .field("request_timeout_seconds", &self.request_timeout_seconds)
            .field("shutdown_grace_seconds", &self.shutdown_grace_seconds)
            .field("api_base_url", &self.api_base_url)
            .field("article_format", &self.article_format)
            .field("reader_base_url", &self.reader_base_url)
            .field("yt_dlp_path", &self.yt_dlp_path)
            .finish()
    }
}

const KNOWN_KEYS: &[&str] = &[
    "api_token",
    "download_path",
    "video_enabled",
    "video_resolution",
    "sync_interval_seconds",
    "retry_ceiling",
    "concurrency",
    "request_timeout_seconds",
    "shutdown_grace_seconds",
    "api_base_url",
    "article_format",
    "reader_base_url",
    "yt_dlp_path",
];

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    /// - Out-of-range numbers → clamped, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
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
                // File deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::parse(&content)
    }

    /// Parse TOML content. See [`Config::load`].
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(content)?;
        Ok(config.clamped())
    }

    fn clamped(mut self) -> Self {
        if self.sync_interval_seconds < MIN_SYNC_INTERVAL_SECS {
            tracing::warn!(
                value = self.sync_interval_seconds,
                min = MIN_SYNC_INTERVAL_SECS,
                "sync_interval_seconds too small, clamping"
            );
            self.sync_interval_seconds = MIN_SYNC_INTERVAL_SECS;
        }
        if self.retry_ceiling == 0 {
            tracing::warn!("retry_ceiling must be at least 1, using 1");
            self.retry_ceiling = 1;
        }
        let concurrency = self.concurrency.clamp(1, MAX_CONCURRENCY);
        if concurrency != self.concurrency {
            tracing::warn!(value = self.concurrency, used = concurrency, "concurrency out of range, clamping");
            self.concurrency = concurrency;
        }
        if self.request_timeout_seconds == 0 {
            self.request_timeout_seconds = 1;
        }
        self
    }

    /// API token, preferring the environment variable over the file.
    pub fn api_token(&self) -> Option<SecretString> {
        self.api_token_with_env(std::env::var(TOKEN_ENV_VAR).ok())
    }

    fn api_token_with_env(&self, env: Option<String>) -> Option<SecretString> {
        env.filter(|t| !t.trim().is_empty())
            .or_else(|| self.api_token.clone().filter(|t| !t.trim().is_empty()))
            .map(|t| SecretString::from(t.trim().to_string()))
    }

    /// Check the settings a cycle cannot run without and return the token.
    pub fn require_token(&self) -> Result<SecretString, ConfigError> {
        self.validate_download_path()?;
        self.api_token().ok_or_else(|| {
            ConfigError::Invalid(format!(
                "no API token configured (set api_token or {TOKEN_ENV_VAR})"
            ))
        })
    }

    fn validate_download_path(&self) -> Result<(), ConfigError> {
        if self.download_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("download_path is empty".to_string()));
        }
        Ok(())
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

// ============================================================================
// Tests
// ============================================================================
