use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Process-level configuration, read once at startup.
///
/// Everything an operator can change at runtime lives in the data directory
/// (see [`crate::store`]); this file only describes where the service listens,
/// where it keeps its data and how the published channel presents itself.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub feed: ChannelConfig,
}

fn default_bind() -> String {
    "0.0.0.0:5000".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_api_base_url() -> String {
    "https://api.github.com".to_string()
}

fn default_user_agent() -> String {
    "GitHub-RSS-Aggregator/1.0".to_string()
}

/// Static channel metadata written into every built feed.
#[derive(Debug, Deserialize, Clone)]
pub struct ChannelConfig {
    #[serde(default = "default_feed_title")]
    pub title: String,
    #[serde(default = "default_feed_link")]
    pub link: String,
    #[serde(default = "default_feed_description")]
    pub description: String,
}

fn default_feed_title() -> String {
    "GitHub Releases".to_string()
}

fn default_feed_link() -> String {
    "http://localhost:5000/rss".to_string()
}

fn default_feed_description() -> String {
    "Latest releases of the monitored GitHub repositories".to_string()
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            title: default_feed_title(),
            link: default_feed_link(),
            description: default_feed_description(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            data_dir: default_data_dir(),
            api_base_url: default_api_base_url(),
            user_agent: default_user_agent(),
            feed: ChannelConfig::default(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn from_str(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }
}
