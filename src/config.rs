//! Client configuration.
//!
//! Loaded from a JSON file, then overridden by environment variables:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `DOCKER_HOST` | `host` |
//! | `DOCKWIRE_API_VERSION` | `api_version` |
//! | `DOCKWIRE_CONFIG` | path of the config file itself |
//!
//! Without `DOCKWIRE_CONFIG` the file is looked up at
//! `<platform config dir>/dockwire/config.json`. A missing file means
//! defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::{DeliveryPolicy, DEFAULT_INBOX_CAPACITY};
use crate::error::{Error, Result};
use crate::hijack::DEFAULT_READ_BUFFER;
use crate::transport::{EngineHost, DEFAULT_HOST};

/// How a full subscriber inbox is handled. See [`DeliveryPolicy`].
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Wait for the subscriber.
    #[default]
    Block,
    /// Drop the item for that subscriber.
    DropNewest,
    /// Wait up to `delivery_timeout_ms`, then drop.
    Timeout,
}

/// Configuration for the engine client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Engine address (`unix:///path` or `tcp://host:port`).
    pub host: String,
    /// API version prefix such as `v1.43`. `None` uses the engine default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Socket read buffer for exec/attach sessions, in bytes.
    pub read_buffer_size: usize,
    /// Items each pump subscriber may have queued.
    pub inbox_capacity: usize,
    /// Backpressure mode for pump subscribers.
    pub delivery: DeliveryMode,
    /// Per-subscriber wait for [`DeliveryMode::Timeout`].
    pub delivery_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            api_version: None,
            read_buffer_size: DEFAULT_READ_BUFFER,
            inbox_capacity: DEFAULT_INBOX_CAPACITY,
            delivery: DeliveryMode::Block,
            delivery_timeout_ms: 1000,
        }
    }
}

impl ClientConfig {
    /// Default config file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("dockwire").join("config.json"))
    }

    /// Load from the config file (if any) and apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var_os("DOCKWIRE_CONFIG")
            .map(PathBuf::from)
            .or_else(Self::default_path);

        let mut config = match path {
            Some(path) if path.exists() => Self::load_from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Read a config file. Missing fields take their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Invalid config {}: {e}", path.display())))
    }

    /// Apply overrides looked up through `var`.
    pub fn apply_env_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(host) = var("DOCKER_HOST").filter(|h| !h.is_empty()) {
            self.host = host;
        }
        if let Some(version) = var("DOCKWIRE_API_VERSION").filter(|v| !v.is_empty()) {
            self.api_version = Some(if version.starts_with('v') {
                version
            } else {
                format!("v{version}")
            });
        }
    }

    /// Check that the settings are usable.
    pub fn validate(&self) -> Result<()> {
        self.engine_host()?;
        if self.inbox_capacity == 0 {
            return Err(Error::Config("inbox_capacity must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Parsed engine address.
    pub fn engine_host(&self) -> Result<EngineHost> {
        EngineHost::parse(&self.host)
    }

    /// Delivery policy for pump channels.
    pub fn delivery_policy(&self) -> DeliveryPolicy {
        match self.delivery {
            DeliveryMode::Block => DeliveryPolicy::Block,
            DeliveryMode::DropNewest => DeliveryPolicy::DropNewest,
            DeliveryMode::Timeout => {
                DeliveryPolicy::BlockWithTimeout(Duration::from_millis(self.delivery_timeout_ms))
            }
        }
    }
}
