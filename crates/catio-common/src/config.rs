//! Configuration structures for the ADS bridge.
//!
//! Supports TOML deserialization with defaults that run a local simulated
//! I/O server against a local client out of the box.

use crate::ads_types::AdsDataType;
use crate::net_id::{NetId, PORT_IO_SERVER};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default TCP port for AMS/ADS traffic.
pub const ADS_TCP_PORT: u16 = 48898;
/// Default UDP port of the route service.
pub const ADS_UDP_PORT: u16 = 48899;

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Client connection settings.
    pub client: ClientConfig,

    /// Simulated I/O server settings.
    pub server: ServerConfig,

    /// Client-side notification reduction.
    pub notification: NotificationConfig,

    /// UDP route service.
    pub discovery: DiscoveryConfig,

    /// Terminal topology served by the simulated I/O server.
    pub topology: TopologyConfig,
}

/// Client connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address (host:port).
    pub address: String,

    /// NetId of the I/O server.
    pub target_net_id: NetId,

    /// AMS port of the I/O server.
    pub target_port: u16,

    /// Our own NetId as written into request headers.
    pub source_net_id: NetId,

    /// Our own AMS port.
    pub source_port: u16,

    /// Upper bound for establishing the TCP connection.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Upper bound for a response to arrive.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Wait for the first byte of the next frame.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Wait for the remainder of a frame once it started.
    #[serde(with = "humantime_serde")]
    pub frame_timeout: Duration,

    /// Capacity of the notification channel between reader and consumer.
    pub notification_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: format!("127.0.0.1:{ADS_TCP_PORT}"),
            target_net_id: NetId::new(127, 0, 0, 1, 1, 1),
            target_port: PORT_IO_SERVER,
            source_net_id: NetId::new(127, 0, 0, 1, 1, 20),
            source_port: 30000,
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(60),
            frame_timeout: Duration::from_secs(1),
            notification_capacity: 256,
        }
    }
}

/// Simulated I/O server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (host:port).
    pub bind_addr: String,

    /// NetId of the I/O server.
    pub net_id: NetId,

    /// Name reported by ReadDeviceInfo.
    pub device_name: String,

    /// Wait for the first byte of the next frame.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Wait for the remainder of a frame once it started.
    #[serde(with = "humantime_serde")]
    pub frame_timeout: Duration,

    /// How often the broadcaster samples every active handle.
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,

    /// How often buffered samples are pushed to each connection.
    #[serde(with = "humantime_serde")]
    pub flush_period: Duration,

    /// Frames queued per connection before the broadcaster drops.
    pub outbound_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("127.0.0.1:{ADS_TCP_PORT}"),
            net_id: NetId::new(127, 0, 0, 1, 1, 1),
            device_name: String::from("CATio I/O Server"),
            idle_timeout: Duration::from_secs(60),
            frame_timeout: Duration::from_secs(1),
            sample_interval: Duration::from_millis(10),
            flush_period: Duration::from_millis(100),
            outbound_capacity: 64,
        }
    }
}

/// Client-side notification reduction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Window over which bursts are averaged before diffing.
    #[serde(with = "humantime_serde")]
    pub flush_window: Duration,

    /// Default max delay requested on subscription.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Default cycle time requested on subscription.
    #[serde(with = "humantime_serde")]
    pub cycle_time: Duration,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            flush_window: Duration::from_millis(500),
            max_delay: Duration::from_millis(100),
            cycle_time: Duration::from_millis(10),
        }
    }
}

/// UDP route service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Responder bind address (host:port).
    pub bind_addr: String,

    /// How long a client waits for a reply datagram.
    #[serde(with = "humantime_serde")]
    pub reply_timeout: Duration,

    /// Route name announced when adding a route.
    pub route_name: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("127.0.0.1:{ADS_UDP_PORT}"),
            reply_timeout: Duration::from_secs(2),
            route_name: String::from("catio"),
        }
    }
}

/// Terminal topology: devices, their slaves and the slaves' channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// EtherCAT master devices.
    pub devices: Vec<DeviceConfig>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            devices: vec![DeviceConfig {
                name: String::from("Device 1 (EtherCAT)"),
                net_id: NetId::new(127, 0, 0, 1, 2, 1),
                slaves: vec![
                    TerminalConfig::coupler("EK1100", 0x044C_2C52),
                    TerminalConfig {
                        name: String::from("EL1004"),
                        vendor_id: 2,
                        product_code: 0x03EC_3052,
                        revision: 0x0010_0000,
                        serial: 0,
                        channels: (1..=4)
                            .map(|n| ChannelConfig::input(&format!("Input {n}"), AdsDataType::Bool))
                            .collect(),
                    },
                    TerminalConfig {
                        name: String::from("EL3104"),
                        vendor_id: 2,
                        product_code: 0x0C20_3052,
                        revision: 0x0014_0000,
                        serial: 0,
                        channels: (1..=4)
                            .map(|n| ChannelConfig::input(&format!("AI {n}"), AdsDataType::Int))
                            .collect(),
                    },
                ],
            }],
        }
    }
}

/// One EtherCAT master device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Display name.
    pub name: String,

    /// NetId of the master device.
    pub net_id: NetId,

    /// Slaves in bus order.
    #[serde(default)]
    pub slaves: Vec<TerminalConfig>,
}

/// One slave terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    /// Terminal name, reported through CoE object 0x1008.
    pub name: String,

    /// EtherCAT vendor id.
    #[serde(default)]
    pub vendor_id: u32,

    /// Product code.
    #[serde(default)]
    pub product_code: u32,

    /// Revision number.
    #[serde(default)]
    pub revision: u32,

    /// Serial number.
    #[serde(default)]
    pub serial: u32,

    /// Process data channels.
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

impl TerminalConfig {
    /// A Beckhoff terminal without process data.
    #[must_use]
    pub fn coupler(name: &str, product_code: u32) -> Self {
        Self {
            name: name.to_string(),
            vendor_id: 2,
            product_code,
            revision: 0x0012_0000,
            serial: 0,
            channels: Vec::new(),
        }
    }
}

/// One process data channel of a terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel name, last component of the symbol name.
    pub name: String,

    /// Element type.
    pub data_type: AdsDataType,

    /// Process image region.
    #[serde(default)]
    pub direction: Direction,
}

impl ChannelConfig {
    /// An input channel.
    #[must_use]
    pub fn input(name: &str, data_type: AdsDataType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            direction: Direction::Input,
        }
    }

    /// An output channel.
    #[must_use]
    pub fn output(name: &str, data_type: AdsDataType) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            direction: Direction::Output,
        }
    }
}

/// Process image region of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Slave to master (0xF020).
    #[default]
    Input,
    /// Master to slave (0xF030).
    Output,
}

impl BridgeConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails [`Self::validate`].
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section for values the runtime cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.client.validate()?;
        self.server.validate()?;
        self.notification.validate()?;
        non_zero("discovery.reply_timeout", self.discovery.reply_timeout)
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }
}

impl ClientConfig {
    /// Reject zero timeouts and a zero notification capacity.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("client.connect_timeout", self.connect_timeout)?;
        non_zero("client.request_timeout", self.request_timeout)?;
        non_zero("client.idle_timeout", self.idle_timeout)?;
        non_zero("client.frame_timeout", self.frame_timeout)?;
        if self.notification_capacity == 0 {
            return Err(ConfigError::invalid("client.notification_capacity", "must be at least 1"));
        }
        Ok(())
    }
}

impl ServerConfig {
    /// Reject zero timeouts, periods and queue capacity.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("server.idle_timeout", self.idle_timeout)?;
        non_zero("server.frame_timeout", self.frame_timeout)?;
        non_zero("server.sample_interval", self.sample_interval)?;
        non_zero("server.flush_period", self.flush_period)?;
        if self.outbound_capacity == 0 {
            return Err(ConfigError::invalid("server.outbound_capacity", "must be at least 1"));
        }
        Ok(())
    }
}

impl NotificationConfig {
    /// Reject a zero flush window.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("notification.flush_window", self.flush_window)
    }
}

fn non_zero(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::invalid(field, "must be greater than zero"));
    }
    Ok(())
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value parsed but cannot be used.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Dotted path of the field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: &str) -> Self {
        Self::Invalid {
            field,
            reason: reason.to_string(),
        }
    }
}

/// Serde helper module for `Duration` using humantime format.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.client.target_port, PORT_IO_SERVER);
        assert_eq!(config.client.address, "127.0.0.1:48898");
        assert_eq!(config.topology.devices.len(), 1);
        assert_eq!(config.topology.devices[0].slaves.len(), 3);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            [client]
            address = "10.0.0.5:48898"
            target_net_id = "10.0.0.5.1.1"
            request_timeout = "500ms"

            [notification]
            flush_window = "1s"

            [[topology.devices]]
            name = "ETH1"
            net_id = "10.0.0.5.2.1"

            [[topology.devices.slaves]]
            name = "EL2008"
            product_code = 0x07D83052

            [[topology.devices.slaves.channels]]
            name = "Output 1"
            data_type = "BOOL"
            direction = "output"
        "#;

        let config = BridgeConfig::from_toml(toml).unwrap();
        assert_eq!(config.client.target_net_id, NetId::new(10, 0, 0, 5, 1, 1));
        assert_eq!(config.client.request_timeout, Duration::from_millis(500));
        assert_eq!(config.notification.flush_window, Duration::from_secs(1));
        // Unset fields keep their defaults.
        assert_eq!(config.client.frame_timeout, Duration::from_secs(1));

        let device = &config.topology.devices[0];
        assert_eq!(device.slaves[0].product_code, 0x07D8_3052);
        assert_eq!(
            device.slaves[0].channels[0],
            ChannelConfig::output("Output 1", AdsDataType::Bool)
        );
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = BridgeConfig::default();
        let toml = config.to_toml().unwrap();
        let parsed = BridgeConfig::from_toml(&toml).unwrap();
        assert_eq!(config.server.flush_period, parsed.server.flush_period);
        assert_eq!(config.server.net_id, parsed.server.net_id);
        assert_eq!(
            config.topology.devices[0].slaves[2].channels,
            parsed.topology.devices[0].slaves[2].channels
        );
    }

    #[test]
    fn test_invalid_net_id_rejected() {
        let toml = r#"
            [server]
            net_id = "1.2.3"
        "#;
        assert!(matches!(
            BridgeConfig::from_toml(toml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_zero_periods_rejected() {
        for (toml, field) in [
            ("[server]\nflush_period = \"0s\"", "server.flush_period"),
            ("[server]\nsample_interval = \"0s\"", "server.sample_interval"),
            ("[notification]\nflush_window = \"0s\"", "notification.flush_window"),
            ("[client]\nrequest_timeout = \"0s\"", "client.request_timeout"),
            ("[server]\noutbound_capacity = 0", "server.outbound_capacity"),
        ] {
            match BridgeConfig::from_toml(toml) {
                Err(ConfigError::Invalid { field: got, .. }) => assert_eq!(got, field),
                other => panic!("{toml}: expected invalid {field}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(BridgeConfig::default().validate().is_ok());
        assert!(ServerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_missing_file() {
        let err = BridgeConfig::from_file(std::path::Path::new("/nonexistent/catio.toml"))
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/catio.toml"));
    }

    #[test]
    fn test_shipped_default_config() {
        let config = BridgeConfig::from_toml(include_str!("../../../config/default.toml")).unwrap();
        let device = &config.topology.devices[0];
        assert_eq!(device.slaves.len(), 4);
        assert_eq!(device.slaves[2].channels[0].direction, Direction::Output);
        assert_eq!(config.client.target_net_id, config.server.net_id);
        assert_eq!(config.notification.flush_window, Duration::from_millis(500));
    }
}
