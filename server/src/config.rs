use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::warn;
use xskpump_common::af_xdp::XdpConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Seconds between statistics reports
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,

    /// Suppress the periodic statistics report
    #[serde(default)]
    pub quiet: bool,

    #[serde(default)]
    pub xdp: XdpConfig,
}

fn default_stats_interval() -> u64 {
    2
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stats_interval: default_stats_interval(),
            quiet: false,
            xdp: XdpConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    /// Load `path`, or fall back to defaults when it does not exist.
    /// A file that exists but cannot be read or parsed is an error.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("Config file {} not found, using defaults", path.display());
            return Ok(Config::default());
        }
        Self::load(path)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}
