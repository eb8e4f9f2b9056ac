//! Server configuration.
//!
//! Read from a TOML file whose path comes from `FLIPPY_HUB_CONFIG` or the
//! first command-line argument. Every key is optional; a missing file means
//! all defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use flippy_hub::HubConfig;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "FLIPPY_HUB_CONFIG";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Socket address to listen on.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Request path accepted for the WebSocket upgrade.
    #[serde(default = "default_path")]
    pub path: String,

    /// Header carrying the user id set by the authenticating gateway.
    #[serde(default = "default_user_header")]
    pub user_header: String,

    #[serde(default)]
    pub hub: HubSection,

    /// Chats preloaded into the in-memory directory.
    #[serde(default)]
    pub chats: Vec<ChatSeed>,
}

/// The `[hub]` table. Durations are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSection {
    #[serde(default = "default_read_deadline_ms")]
    pub read_deadline_ms: u64,

    #[serde(default = "default_write_wait_ms")]
    pub write_wait_ms: u64,

    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default = "default_send_buffer_size")]
    pub send_buffer_size: usize,
}

/// One `[[chats]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSeed {
    pub id: String,
    #[serde(default)]
    pub members: Vec<String>,
}

fn default_listen() -> String {
    "0.0.0.0:8080".into()
}

fn default_path() -> String {
    "/ws".into()
}

fn default_user_header() -> String {
    "x-user-id".into()
}

fn default_read_deadline_ms() -> u64 {
    millis(HubConfig::default().read_deadline)
}

fn default_write_wait_ms() -> u64 {
    millis(HubConfig::default().write_wait)
}

fn default_max_message_size() -> usize {
    HubConfig::default().max_message_size
}

fn default_send_buffer_size() -> usize {
    HubConfig::default().send_buffer_size
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            read_deadline_ms: default_read_deadline_ms(),
            write_wait_ms: default_write_wait_ms(),
            max_message_size: default_max_message_size(),
            send_buffer_size: default_send_buffer_size(),
        }
    }
}

impl HubSection {
    /// Converts to the hub's own settings.
    pub fn to_hub_config(&self) -> HubConfig {
        HubConfig {
            read_deadline: Duration::from_millis(self.read_deadline_ms),
            write_wait: Duration::from_millis(self.write_wait_ms),
            max_message_size: self.max_message_size,
            send_buffer_size: self.send_buffer_size,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_path(),
            user_header: default_user_header(),
            hub: HubSection::default(),
            chats: Vec::new(),
        }
    }
}

impl Config {
    /// Loads the file named by the environment or the command line.
    pub fn load() -> anyhow::Result<Self> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    /// Loads configuration from `path`, or defaults if it does not exist.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.hub.to_hub_config().validate()?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }
}

fn config_path() -> Option<PathBuf> {
    std::env::var_os(CONFIG_ENV)
        .filter(|v| !v.is_empty())
        .or_else(|| std::env::args_os().nth(1))
        .map(PathBuf::from)
}
