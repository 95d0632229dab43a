//! Configuration loading and management

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Daemon configuration, stored as `config.json` in the data directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Seconds between background pulls (default: 5)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Base URL of the repository contents API
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// User-Agent sent with every request (the hosted API rejects requests without one)
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_poll_interval() -> u64 {
    5
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_user_agent() -> String {
    format!("roster-daemon/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            api_base: default_api_base(),
            user_agent: default_user_agent(),
        }
    }
}

impl Config {
    /// Load configuration from the data directory, writing defaults on first run
    pub fn load(data_dir: &Path) -> Result<Self> {
        let config_file = data_dir.join("config.json");

        if config_file.exists() {
            let content = std::fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {:?}", config_file))?;
            let config: Config =
                serde_json::from_str(&content).with_context(|| "Failed to parse config.json")?;
            tracing::debug!("Loaded configuration from {:?}", config_file);
            Ok(config)
        } else {
            let config = Config::default();

            std::fs::create_dir_all(data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", data_dir))?;

            let content = serde_json::to_string_pretty(&config)?;
            std::fs::write(&config_file, content)
                .with_context(|| format!("Failed to write default config: {:?}", config_file))?;
            tracing::info!("Created default config at {:?}", config_file);

            Ok(config)
        }
    }

    pub fn poll_interval(&self) -> Duration {
        // Zero would make tokio's interval panic
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}
