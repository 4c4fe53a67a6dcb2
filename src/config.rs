//! Configuration loading and persistence.
//!
//! Reads `config.json` from the platform config directory, then applies
//! environment overrides. The API token is never written to disk; it comes
//! from `CLASSROOM_RT_TOKEN` (or is set by the embedding application).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use std::{fs, path::PathBuf};

use crate::constants::{
    BACKOFF_JITTER, CHANNEL_OPEN_TIMEOUT, DEFAULT_CABLE_CHANNEL, DEFAULT_OUTBOUND_CAPACITY,
    DEFAULT_SERVER_URL, INITIAL_BACKOFF, MAX_BACKOFF,
};
use crate::mux::MuxOptions;
use crate::transport::cable::CableOptions;
use crate::transport::{AuthParams, BackoffPolicy};

const CONFIG_FILE: &str = "config.json";

/// Configuration for the multiplexer and its cable transport.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// URL of the dashboard server.
    pub server_url: String,
    /// API token - NOT serialized to disk.
    #[serde(skip)]
    pub token: String,
    /// Server-side cable channel class.
    pub cable_channel: String,
    /// Seconds to wait for a channel-open acknowledgment.
    pub open_timeout_secs: u64,
    /// Outbound messages held while disconnected.
    pub queue_capacity: usize,
    /// First reconnect delay in milliseconds.
    pub reconnect_initial_ms: u64,
    /// Cap on the reconnect delay in milliseconds.
    pub reconnect_max_ms: u64,
    /// Upper bound of reconnect jitter in milliseconds.
    pub reconnect_jitter_ms: u64,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("server_url", &self.server_url)
            .field("has_token", &self.has_token())
            .field("cable_channel", &self.cable_channel)
            .field("open_timeout_secs", &self.open_timeout_secs)
            .field("queue_capacity", &self.queue_capacity)
            .field("reconnect_initial_ms", &self.reconnect_initial_ms)
            .field("reconnect_max_ms", &self.reconnect_max_ms)
            .field("reconnect_jitter_ms", &self.reconnect_jitter_ms)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            token: String::new(),
            cable_channel: DEFAULT_CABLE_CHANNEL.to_string(),
            open_timeout_secs: CHANNEL_OPEN_TIMEOUT.as_secs(),
            queue_capacity: DEFAULT_OUTBOUND_CAPACITY,
            reconnect_initial_ms: millis(INITIAL_BACKOFF),
            reconnect_max_ms: millis(MAX_BACKOFF),
            reconnect_jitter_ms: millis(BACKOFF_JITTER),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `CLASSROOM_RT_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("CLASSROOM_RT_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("classroom-realtime")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    ///
    /// A missing or unreadable file falls back to defaults.
    pub fn load() -> Result<Self> {
        let dir = Self::config_dir()?;
        let mut config = Self::load_from(&dir).unwrap_or_else(|e| {
            log::debug!("Using default config: {e:#}");
            Self::default()
        });
        config.apply_env_overrides();
        Ok(config)
    }

    /// Reads `config.json` from `dir` without applying overrides.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        if !config_path.exists() {
            anyhow::bail!("Config file not found: {}", config_path.display());
        }
        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config in {}", config_path.display()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup` (normally the process environment).
    /// Unparseable numeric values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(server_url) = lookup("CLASSROOM_RT_SERVER_URL") {
            self.server_url = server_url;
        }

        if let Some(token) = lookup("CLASSROOM_RT_TOKEN") {
            self.token = token;
        }

        if let Some(cable_channel) = lookup("CLASSROOM_RT_CABLE_CHANNEL") {
            self.cable_channel = cable_channel;
        }

        if let Some(timeout) = lookup("CLASSROOM_RT_OPEN_TIMEOUT_SECS") {
            if let Ok(secs) = timeout.parse::<u64>() {
                self.open_timeout_secs = secs;
            }
        }

        if let Some(capacity) = lookup("CLASSROOM_RT_QUEUE_CAPACITY") {
            if let Ok(cap) = capacity.parse::<usize>() {
                self.queue_capacity = cap;
            }
        }
    }

    /// Persists the configuration to the config directory.
    /// The token is NOT saved.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?)
    }

    /// Persists the configuration to `dir/config.json`.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        let config_path = dir.join(CONFIG_FILE);
        fs::write(&config_path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Whether an API token is configured.
    pub fn has_token(&self) -> bool {
        !self.token.is_empty()
    }

    /// Credentials for the WebSocket handshake.
    pub fn auth_params(&self) -> AuthParams {
        if self.has_token() {
            AuthParams::bearer(self.token.clone())
        } else {
            AuthParams::default()
        }
    }

    /// Reconnect backoff.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(self.reconnect_initial_ms),
            max: Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_initial_ms)),
            jitter: Duration::from_millis(self.reconnect_jitter_ms),
        }
    }

    /// Cable transport options.
    pub fn cable_options(&self) -> CableOptions {
        CableOptions {
            cable_channel: self.cable_channel.clone(),
            backoff: self.backoff_policy(),
        }
    }

    /// Multiplexer options.
    pub fn mux_options(&self) -> MuxOptions {
        MuxOptions {
            open_timeout: Duration::from_secs(self.open_timeout_secs),
            outbound_capacity: self.queue_capacity,
        }
    }
}
