//! Crawl configuration loaded from a JSON file.
//!
//! Only `symbols` is required:
//!
//! ```json
//! { "symbols": ["SPY", "AAPL"] }
//! ```
//!
//! Everything else falls back to defaults and can be overridden from the CLI.

use crate::data::layout::is_safe_name;
use crate::data::yahoo::YahooConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CrawlConfig {
    /// Equity symbols, processed in this order.
    pub symbols: Vec<String>,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Option contract workers; defaults to the host's available parallelism.
    #[serde(default)]
    pub workers: Option<usize>,

    /// Snapshot option chains and track in-the-money contracts.
    #[serde(default = "default_true")]
    pub options: bool,

    #[serde(default)]
    pub http_cache: HttpCacheConfig,

    #[serde(default)]
    pub provider: ProviderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HttpCacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

impl Default for HttpCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_cache_dir(),
            ttl_secs: default_cache_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub base_url: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
}

impl ProviderConfig {
    pub fn to_yahoo(&self) -> YahooConfig {
        let defaults = YahooConfig::default();
        YahooConfig {
            base_url: self.base_url.clone().unwrap_or(defaults.base_url),
            user_agent: self.user_agent.clone().unwrap_or(defaults.user_agent),
            timeout: self
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            base_delay: self
                .base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("yfinance.cache")
}

fn default_cache_ttl() -> u64 {
    12 * 60 * 60
}

fn default_true() -> bool {
    true
}

impl CrawlConfig {
    /// Load and validate a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: CrawlConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbols.is_empty() {
            return Err(ConfigError::Invalid("symbols must not be empty".into()));
        }
        if let Some(bad) = self.symbols.iter().find(|s| !is_safe_name(s)) {
            return Err(ConfigError::Invalid(format!("invalid symbol '{bad}'")));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        Ok(())
    }

    /// Configured worker count, else the host's available parallelism.
    pub fn effective_workers(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.http_cache.ttl_secs)
    }
}
