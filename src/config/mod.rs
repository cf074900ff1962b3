//! # Configuration Management Module
//!
//! TOML configuration for the `meshlink` binary and for embedders that want the
//! same defaults. Every section carries serde defaults, so a partial file (or an
//! empty one) loads.
//!
//! ## Configuration Structure
//!
//! - [`RadioConfig`] - transport kind/address, reconnect budget, timer intervals
//! - [`BrokerConfig`] - MQTT broker endpoint, credentials, channel and key
//! - [`StorageConfig`] - data directory and message retention
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ## Configuration File Format
//!
//! ```toml
//! [radio]
//! transport = "tcp"
//! address = "meshtastic.local"
//! max_reconnect_attempts = 5
//!
//! [broker]
//! enabled = true
//! host = "mqtt.meshtastic.org"
//! port = 1883
//! username = "meshdev"
//! password = "large4cats"
//! topic_prefix = "msh/US"
//! channel_name = "LongFast"
//!
//! [storage]
//! data_dir = "./data"
//! retention_days = 30
//! max_messages = 5000
//!
//! [logging]
//! level = "info"
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshlink::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Config::create_default("config.toml").await?;
//!     let config = Config::load("config.toml").await?;
//!     println!("Broker: {}:{}", config.broker.host, config.broker.port);
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

use crate::broker::crypto::{parse_key_hex, DEFAULT_KEY};
use crate::broker::{BrokerSettings, DEFAULT_MAX_RETRIES};
use crate::ingest::RetentionPolicy;
use crate::protobuf::{parse_node_id, BROADCAST_ADDR};
use crate::radio::{RadioSettings, TransportKind};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub radio: RadioConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RadioConfig {
    /// Transport used when `run` is given no `--tcp`/`--serial` override.
    /// Leave unset to start without a radio.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportKind>,
    /// Host[:port] for tcp, device path for serial.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    pub baud_rate: u32,
    pub max_reconnect_attempts: u32,
    pub watchdog_interval_secs: u64,
    pub ble_heartbeat_interval_secs: u64,
    /// Heartbeat interval pushed to wired and network devices.
    pub device_heartbeat_interval_secs: u64,
    pub housekeeping_interval_secs: u64,
}

impl Default for RadioConfig {
    fn default() -> Self {
        let defaults = RadioSettings::default();
        Self {
            transport: None,
            address: None,
            baud_rate: 115_200,
            max_reconnect_attempts: defaults.max_reconnect_attempts,
            watchdog_interval_secs: defaults.watchdog_interval.as_secs(),
            ble_heartbeat_interval_secs: defaults.ble_heartbeat_interval.as_secs(),
            device_heartbeat_interval_secs: defaults.device_heartbeat_interval.as_secs(),
            housekeeping_interval_secs: defaults.housekeeping_interval.as_secs(),
        }
    }
}

impl RadioConfig {
    pub fn settings(&self) -> Result<RadioSettings> {
        let secs = |name: &str, v: u64| {
            if v == 0 {
                Err(anyhow!("radio.{} must be greater than zero", name))
            } else {
                Ok(Duration::from_secs(v))
            }
        };
        Ok(RadioSettings {
            max_reconnect_attempts: self.max_reconnect_attempts,
            watchdog_interval: secs("watchdog_interval_secs", self.watchdog_interval_secs)?,
            ble_heartbeat_interval: secs(
                "ble_heartbeat_interval_secs",
                self.ble_heartbeat_interval_secs,
            )?,
            device_heartbeat_interval: secs(
                "device_heartbeat_interval_secs",
                self.device_heartbeat_interval_secs,
            )?,
            housekeeping_interval: secs(
                "housekeeping_interval_secs",
                self.housekeeping_interval_secs,
            )?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub topic_prefix: String,
    pub channel_name: String,
    /// Channel key as 32 hex digits; the default channel key when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub max_retries: u32,
    /// Sender identity for published packets (`!a1b2c3d4`). Random per run when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "mqtt.meshtastic.org".to_string(),
            port: 1883,
            username: Some("meshdev".to_string()),
            password: Some("large4cats".to_string()),
            topic_prefix: "msh/US".to_string(),
            channel_name: "LongFast".to_string(),
            key: None,
            max_retries: DEFAULT_MAX_RETRIES,
            node_id: None,
        }
    }
}

impl BrokerConfig {
    /// Resolve the section into bridge settings. `fallback_node` is used when no
    /// `node_id` is configured.
    pub fn settings(&self, fallback_node: u32) -> Result<BrokerSettings> {
        let key = match &self.key {
            Some(raw) => parse_key_hex(raw)
                .ok_or_else(|| anyhow!("broker.key must be 32 hex digits"))?,
            None => DEFAULT_KEY,
        };
        let local_node = match &self.node_id {
            Some(raw) => parse_node_id(raw)
                .filter(|n| *n != 0 && *n != BROADCAST_ADDR)
                .ok_or_else(|| anyhow!("broker.node_id '{}' is not a valid node id", raw))?,
            None => fallback_node,
        };
        Ok(BrokerSettings {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone().filter(|u| !u.is_empty()),
            password: self.password.clone(),
            topic_prefix: self.topic_prefix.clone(),
            channel_name: self.channel_name.clone(),
            key,
            max_retries: self.max_retries,
            local_node,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    pub retention_days: u32,
    pub max_messages: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let retention = RetentionPolicy::default();
        Self {
            data_dir: "./data".to_string(),
            retention_days: retention.max_age.num_days() as u32,
            max_messages: retention.max_messages,
        }
    }
}

impl StorageConfig {
    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_age: chrono::Duration::days(i64::from(self.retention_days.max(1))),
            max_messages: self.max_messages.max(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
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

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }
}
