//! # Configuration
//!
//! Binlink reads a TOML file with one section per concern:
//!
//! - [`TransferConfig`] - link delimiter, chunk sizing, segment pacing and retry policies
//! - [`PackConfig`] - values stamped into binpack headers
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ```toml
//! [transfer]
//! delimiter = 10
//! chunk_ceiling = 4096
//! segment_len = 250
//! segment_delay_ms = 20
//!
//! [transfer.retry]
//! backoff_ms = 250
//!
//! [transfer.poll]
//! backoff_ms = 750
//!
//! [pack]
//! host = "stm32"
//! snapshot = ""
//!
//! [logging]
//! level = "info"
//! ```
//!
//! Every transfer gets its own copy of [`TransferConfig`]; nothing here is
//! process-global.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

pub use crate::transfer::TransferConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub pack: PackConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PackConfig {
    /// Recorded on the `HOST:` header line.
    #[serde(default)]
    pub host: String,
    /// Recorded on the `SNAP:` header line.
    #[serde(default)]
    pub snapshot: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl LoggingConfig {
    /// Configured level; unknown names fall back to `Info`.
    pub fn level_filter(&self) -> log::LevelFilter {
        self.level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        Self::parse(&content).map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        if config.transfer.fallback_chunk_size == 0 {
            return Err(anyhow!("transfer.fallback_chunk_size must be non-zero"));
        }
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let content = toml::to_string_pretty(&Config::default())
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }
}
