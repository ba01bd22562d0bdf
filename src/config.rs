//! Configuration for the bridge daemon.
//!
//! Loaded from a TOML file. On first run, if no config exists, a default one
//! is written to the data directory.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::MeshClientConfig;
use crate::constants::{protocol, timing, transport};
use crate::error::AppError;
use crate::meshid::{parse_node_id, ChannelDef, NodeId};
use crate::network::MqttTransportConfig;

/// Platform-specific data directory for the bridge
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("meshbridge")
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".meshbridge")
    }
}

/// Default location of the config file
pub fn default_config_path() -> PathBuf {
    get_data_dir().join("meshbridge.toml")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub mesh: MeshConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub multicast: MulticastConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Bridge node ID, `!` + 8 hex digits
    pub id: String,
    #[serde(default)]
    pub long_name: String,
    #[serde(default)]
    pub short_name: String,
    /// Base64 X25519 private key for direct messages
    #[serde(default)]
    pub private_key: Option<String>,
    /// Base64 X25519 public key; derived from the private key when omitted
    #[serde(default)]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default = "default_hop_limit")]
    pub hop_limit: u32,
    #[serde(default = "default_primary_channel")]
    pub primary_channel: String,
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelConfig>,
    #[serde(default = "default_neighbor_interval")]
    pub neighbor_broadcast_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_root_topic")]
    pub root_topic: String,
    /// Broker client ID; the node ID is used when empty
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MulticastConfig {
    pub enabled: bool,
    #[serde(default = "default_multicast_group")]
    pub group: String,
    #[serde(default = "default_multicast_port")]
    pub port: u16,
    /// Local interface address to join the group on
    #[serde(default)]
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
    /// `stdout` or `file`
    pub output: String,
    pub file_path: String,
}

fn default_hop_limit() -> u32 {
    protocol::DEFAULT_HOP_LIMIT
}

fn default_primary_channel() -> String {
    protocol::DEFAULT_CHANNEL_NAME.to_string()
}

fn default_channels() -> Vec<ChannelConfig> {
    vec![ChannelConfig {
        name: protocol::DEFAULT_CHANNEL_NAME.to_string(),
        key: Some("AQ==".to_string()),
    }]
}

fn default_neighbor_interval() -> u64 {
    timing::NEIGHBOR_BROADCAST_INTERVAL.as_secs()
}

fn default_mqtt_port() -> u16 {
    transport::MQTT_DEFAULT_PORT
}

fn default_root_topic() -> String {
    "msh/US/2/e".to_string()
}

fn default_multicast_group() -> String {
    transport::MULTICAST_GROUP.to_string()
}

fn default_multicast_port() -> u16 {
    transport::MULTICAST_PORT
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "mqtt.meshtastic.org".to_string(),
            port: default_mqtt_port(),
            username: Some("meshdev".to_string()),
            password: Some("large4cats".to_string()),
            root_topic: default_root_topic(),
            client_id: String::new(),
            tls: false,
        }
    }
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group: default_multicast_group(),
            port: default_multicast_port(),
            interface: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            output: "stdout".to_string(),
            file_path: "./logs/meshbridge.log".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let id = NodeId(rand::random::<u32>() | 0x1000_0000);
        let (long_name, short_name) = id.default_names();
        Self {
            node: NodeConfig {
                id: id.to_string(),
                long_name,
                short_name,
                private_key: None,
                public_key: None,
            },
            mesh: MeshConfig {
                hop_limit: default_hop_limit(),
                primary_channel: default_primary_channel(),
                channels: default_channels(),
                neighbor_broadcast_interval_secs: default_neighbor_interval(),
            },
            mqtt: MqttConfig::default(),
            multicast: MulticastConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), AppError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Load the config at `path`, writing a fresh default one if it is missing
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load_from_file(path);
        }

        let mut config = Config::default();
        if config.node.private_key.is_none() {
            use base64::{engine::general_purpose::STANDARD, Engine as _};
            config.node.private_key = Some(STANDARD.encode(crate::crypto::generate_private_key()));
        }
        config.save_to_file(path)?;
        tracing::info!("📝 Wrote default config to {}", path.display());
        Ok(config)
    }

    /// Reject values that would only fail later, once transports are up
    pub fn validate(&self) -> Result<(), AppError> {
        self.node_id()?;
        self.channel_defs()?;
        if !self.mesh.channels.iter().any(|c| c.name == self.mesh.primary_channel) {
            return Err(AppError::Config(format!(
                "primary channel '{}' is not in the channel list",
                self.mesh.primary_channel
            )));
        }
        if self.mqtt.enabled && self.mqtt.host.is_empty() {
            return Err(AppError::Config("mqtt.host must be set".to_string()));
        }
        Ok(())
    }

    pub fn node_id(&self) -> Result<NodeId, AppError> {
        Ok(parse_node_id(&self.node.id)?)
    }

    pub fn channel_defs(&self) -> Result<Vec<ChannelDef>, AppError> {
        self.mesh
            .channels
            .iter()
            .map(|c| ChannelDef::new(c.name.clone(), c.key.as_deref()).map_err(AppError::from))
            .collect()
    }

    pub fn primary_channel_def(&self) -> Result<ChannelDef, AppError> {
        self.channel_defs()?
            .into_iter()
            .find(|c| c.name() == self.mesh.primary_channel)
            .ok_or_else(|| AppError::Config("primary channel missing".to_string()))
    }

    pub fn client_config(&self) -> Result<MeshClientConfig, AppError> {
        let mut config = MeshClientConfig::new(self.node_id()?);
        config.hop_limit = self.mesh.hop_limit;
        config.neighbor_broadcast_interval =
            Duration::from_secs(self.mesh.neighbor_broadcast_interval_secs);
        Ok(config)
    }

    pub fn mqtt_config(&self) -> Result<MqttTransportConfig, AppError> {
        let node_id = self.node_id()?;
        let client_id = if self.mqtt.client_id.is_empty() {
            node_id.to_string()
        } else {
            self.mqtt.client_id.clone()
        };
        Ok(MqttTransportConfig {
            host: self.mqtt.host.clone(),
            port: self.mqtt.port,
            username: self.mqtt.username.clone(),
            password: self.mqtt.password.clone(),
            root_topic: self.mqtt.root_topic.clone(),
            client_id,
            tls: self.mqtt.tls,
            node_id,
        })
    }
}
