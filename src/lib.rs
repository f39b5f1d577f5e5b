//! naspaneld periodically samples host metrics (cpu, memory, storage,
//! network plus user declared probes) and publishes them as JSON over
//! MQTT 3.1.1. By default it embeds its own broker so no external one is
//! needed; `mqtt.type: external` turns it into a plain client instead.
//!
//! Sessions are always effectively clean: `session_present` is never
//! set and subscriptions die with the connection.

use serde::{Deserialize, Serialize};

pub mod collector;
pub mod external;
pub mod link;
pub mod protocol;
pub mod router;
pub mod server;

pub use link::local::{LinkRx, LinkTx};
pub use router::{Event, Notification};
pub use server::broker::Broker;

use collector::custom::CollectorConfig;
use protocol::QoS;

pub type ConnectionId = usize;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerSettings,
    pub mqtt: MqttSettings,
    pub collection: CollectionSettings,
    pub custom_collectors: Vec<CollectorConfig>,
}

/// Identity reported in the payload. 'auto' sniffs from the OS.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSettings {
    pub hostname: String,
    pub ip: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            hostname: "auto".to_owned(),
            ip: "auto".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MqttMode {
    /// Run the embedded broker
    #[default]
    Builtin,
    /// Act only as a client towards an external broker
    External,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MqttSettings {
    #[serde(rename = "type")]
    pub mode: MqttMode,
    /// Listen address in builtin mode, broker address in external mode
    pub host: String,
    pub port: u16,
    pub topic: String,
    /// QoS for published telemetry, 0 or 1
    pub qos: u8,
    /// Login towards the external broker
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub keep_alive: Option<u64>,
    /// Credentials clients of the builtin broker must present
    pub auth: Option<Vec<LoginCredentials>>,
    pub connections: ConnectionSettings,
}

impl Default for MqttSettings {
    fn default() -> Self {
        MqttSettings {
            mode: MqttMode::Builtin,
            host: "0.0.0.0".to_owned(),
            port: 1883,
            topic: "nas/panel/data".to_owned(),
            qos: 1,
            username: None,
            password: None,
            client_id: None,
            keep_alive: None,
            auth: None,
            connections: ConnectionSettings::default(),
        }
    }
}

impl MqttSettings {
    /// Validated publish QoS. Falls back to at-most-once if called on an
    /// unvalidated config.
    pub fn publish_qos(&self) -> QoS {
        protocol::qos(self.qos).unwrap_or(QoS::AtMostOnce)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConnectionSettings {
    /// Grace period for the CONNECT packet on a fresh socket
    pub connection_timeout_ms: u64,
    pub max_payload_size: usize,
    pub max_inflight_count: u16,
    pub retransmit_timeout_ms: u64,
    pub max_retransmit_attempts: u8,
    pub outgoing_queue_size: usize,
    /// How long the router may block on a congested QoS 1 subscriber
    /// before dropping it
    pub slow_consumer_timeout_ms: u64,
    pub graceful_shutdown_timeout_ms: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            connection_timeout_ms: 10_000,
            max_payload_size: 1024 * 1024,
            max_inflight_count: 100,
            retransmit_timeout_ms: 5_000,
            max_retransmit_attempts: 3,
            outgoing_queue_size: 100,
            slow_consumer_timeout_ms: 1_000,
            graceful_shutdown_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CollectionSettings {
    /// Seconds between collection ticks
    pub interval: u64,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        CollectionSettings { interval: 5 }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration load error = {0}")]
    Load(#[from] config::ConfigError),
    #[error("mqtt.qos must be 0 or 1, got {0}")]
    InvalidQoS(u8),
    #[error("collection.interval must be a positive number of seconds")]
    InvalidInterval,
    #[error("custom collector needs a non-empty name")]
    UnnamedCollector,
    #[error("duplicate custom collector name = {0}")]
    DuplicateCollector(String),
    #[error("invalid regex transform for collector {name} = {source}")]
    InvalidTransform {
        name: String,
        #[source]
        source: regex::Error,
    },
    #[error("external mode requires mqtt.host pointing at the broker, not 0.0.0.0")]
    ExternalHostUnset,
}

impl Config {
    /// Full startup validation. Never called again at runtime; a config
    /// that passes can't produce configuration errors later.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.qos > 1 {
            return Err(ConfigError::InvalidQoS(self.mqtt.qos));
        }

        if self.collection.interval == 0 {
            return Err(ConfigError::InvalidInterval);
        }

        if self.mqtt.mode == MqttMode::External && self.mqtt.host == "0.0.0.0" {
            return Err(ConfigError::ExternalHostUnset);
        }

        let mut names = std::collections::HashSet::new();
        for collector in &self.custom_collectors {
            if collector.name.is_empty() {
                return Err(ConfigError::UnnamedCollector);
            }

            if !names.insert(collector.name.as_str()) {
                return Err(ConfigError::DuplicateCollector(collector.name.clone()));
            }

            // compiles declared transforms, rejecting anything outside
            // the closed set right here
            collector::custom::Probe::new(collector)?;
        }

        Ok(())
    }
}
