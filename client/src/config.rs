//! Client configuration

use anyhow::Result;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use ykacc_transport::{AccessoryFilter, BusyPolicy, SmartCardConfig};

use crate::connection::SessionSwitchPolicy;

/// Client configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClientConfig {
    /// Accessory selection
    #[serde(default)]
    pub accessory: AccessoryConfig,

    /// Command exchange
    #[serde(default)]
    pub smart_card: SmartCardSection,

    /// Application session lifecycle
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ClientConfig {
    /// Load configuration from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: ClientConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load another file and overlay it onto this configuration
    pub async fn load_merge(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let content = tokio::fs::read_to_string(path).await?;
        let other: ClientConfig = toml::from_str(&content)?;
        self.merge(other);
        Ok(())
    }

    /// Merge another config into this one
    ///
    /// Scalars overwrite when the new value differs from its default;
    /// options overwrite when `Some`.
    pub fn merge(&mut self, other: ClientConfig) {
        if other.accessory.protocol != default_protocol() {
            self.accessory.protocol = other.accessory.protocol;
        }
        if other.accessory.name_filter.is_some() {
            self.accessory.name_filter = other.accessory.name_filter;
        }
        if other.accessory.connect_timeout_ms != default_connect_timeout_ms() {
            self.accessory.connect_timeout_ms = other.accessory.connect_timeout_ms;
        }

        if other.smart_card.response_timeout_ms != default_response_timeout_ms() {
            self.smart_card.response_timeout_ms = other.smart_card.response_timeout_ms;
        }
        if other.smart_card.busy_policy != BusyPolicy::default() {
            self.smart_card.busy_policy = other.smart_card.busy_policy;
        }
        if other.smart_card.max_wait_extensions != default_max_wait_extensions() {
            self.smart_card.max_wait_extensions = other.smart_card.max_wait_extensions;
        }
        if other.smart_card.max_get_response_rounds != default_max_get_response_rounds() {
            self.smart_card.max_get_response_rounds = other.smart_card.max_get_response_rounds;
        }
        if other.smart_card.read_chunk_size != default_read_chunk_size() {
            self.smart_card.read_chunk_size = other.smart_card.read_chunk_size;
        }

        if other.session.switch_policy != SessionSwitchPolicy::default() {
            self.session.switch_policy = other.session.switch_policy;
        }

        if other.logging.level != default_log_level() {
            self.logging.level = other.logging.level;
        }
    }
}

/// Accessory selection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AccessoryConfig {
    /// Protocol string to open on the accessory
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Only consider accessories whose name contains this (case-insensitive)
    #[serde(default)]
    pub name_filter: Option<String>,

    /// How long to wait for a matching accessory to attach
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_protocol() -> String {
    "com.yubico.ylp".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

impl AccessoryConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Filter matching accessories usable for this configuration
    pub fn filter(&self) -> AccessoryFilter {
        let filter = AccessoryFilter::supports_protocol(self.protocol.clone());
        match &self.name_filter {
            Some(name) => filter.and(AccessoryFilter::name_contains(name.clone())),
            None => filter,
        }
    }
}

impl Default for AccessoryConfig {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            name_filter: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Command exchange configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SmartCardSection {
    /// Response deadline per command (ms)
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,

    /// Behaviour of a second caller while a command is in flight
    #[serde(default)]
    pub busy_policy: BusyPolicy,

    #[serde(default = "default_max_wait_extensions")]
    pub max_wait_extensions: u32,

    #[serde(default = "default_max_get_response_rounds")]
    pub max_get_response_rounds: u32,

    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
}

fn default_response_timeout_ms() -> u64 {
    10_000
}

fn default_max_wait_extensions() -> u32 {
    12
}

fn default_max_get_response_rounds() -> u32 {
    16
}

fn default_read_chunk_size() -> usize {
    512
}

impl SmartCardSection {
    pub fn to_interface_config(&self) -> SmartCardConfig {
        SmartCardConfig {
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            busy_policy: self.busy_policy,
            max_wait_extensions: self.max_wait_extensions,
            max_get_response_rounds: self.max_get_response_rounds,
            read_chunk_size: self.read_chunk_size,
            ..SmartCardConfig::default()
        }
    }
}

impl Default for SmartCardSection {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout_ms(),
            busy_policy: BusyPolicy::default(),
            max_wait_extensions: default_max_wait_extensions(),
            max_get_response_rounds: default_max_get_response_rounds(),
            read_chunk_size: default_read_chunk_size(),
        }
    }
}

/// Application session configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionConfig {
    /// What to do when a different application is requested while one is active
    #[serde(default)]
    pub switch_policy: SessionSwitchPolicy,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// One of trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}
