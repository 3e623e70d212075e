//! Common utilities for acceptance tests.
//!
//! Provides helpers for:
//! - Starting a simulated I/O server on a dynamic port
//! - Connecting clients with test timeouts
//! - Loading topologies from TOML files

#![allow(dead_code)]

use catio_ads::{AdsClient, AdsServer, ClientOptions, RunningServer, Topology};
use catio_common::config::{BridgeConfig, Direction, ServerConfig, TopologyConfig};
use std::io::Write;
use std::time::Duration;

/// Two EtherCAT masters with terminals on both, as written by an operator.
pub const TWO_MASTER_TOML: &str = r#"
[server]
bind_addr = "127.0.0.1:0"
net_id = "192.168.10.5.1.1"
device_name = "Rack 7"
sample_interval = "5ms"
flush_period = "20ms"

[client]
target_net_id = "192.168.10.5.1.1"

[notification]
flush_window = "100ms"

[[topology.devices]]
name = "Device 1 (EtherCAT)"
net_id = "192.168.10.5.2.1"

[[topology.devices.slaves]]
name = "EK1100"
vendor_id = 2
product_code = 0x044C2C52

[[topology.devices.slaves]]
name = "EL2008"
vendor_id = 2
product_code = 0x07D83052
channels = [
    { name = "Output 1", data_type = "BOOL", direction = "output" },
    { name = "Output 2", data_type = "BOOL", direction = "output" },
]

[[topology.devices.slaves]]
name = "EL3602"
vendor_id = 2
product_code = 0x0E123052
channels = [
    { name = "AI 1", data_type = "DINT" },
    { name = "AI 2", data_type = "DINT" },
]

[[topology.devices]]
name = "Device 2 (EtherCAT)"
net_id = "192.168.10.5.3.1"

[[topology.devices.slaves]]
name = "EK1100"
vendor_id = 2
product_code = 0x044C2C52

[[topology.devices.slaves]]
name = "EL3202"
vendor_id = 2
product_code = 0x0C823052
channels = [
    { name = "Temperature", data_type = "REAL" },
]
"#;

/// Write `content` to a temporary TOML file and load it.
pub fn load_toml(content: &str) -> BridgeConfig {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp file");
    file.write_all(content.as_bytes()).expect("write config");
    BridgeConfig::from_file(file.path()).expect("valid config")
}

/// A server and a connected client.
pub struct TestBed {
    /// Loaded configuration.
    pub config: BridgeConfig,
    /// Running server.
    pub server: RunningServer,
    /// Connected client.
    pub client: AdsClient,
}

impl TestBed {
    /// Start a server for `config` and connect a client to it.
    pub async fn start(config: BridgeConfig) -> Self {
        let server = AdsServer::new(
            config.server.clone(),
            Topology::from_config(&config.topology),
        )
        .spawn()
        .await
        .expect("server should bind");

        let mut options = ClientOptions::from_config(&config.client);
        options.address = server.local_addr().to_string();
        options.request_timeout = Duration::from_secs(1);
        let client = AdsClient::connect(options)
            .await
            .expect("client should connect");

        Self {
            config,
            server,
            client,
        }
    }

    /// Server and client over the default single-master topology.
    pub async fn default_topology() -> Self {
        let config = BridgeConfig {
            server: ServerConfig {
                bind_addr: "127.0.0.1:0".into(),
                sample_interval: Duration::from_millis(5),
                flush_period: Duration::from_millis(20),
                ..ServerConfig::default()
            },
            topology: TopologyConfig::default(),
            ..BridgeConfig::default()
        };
        Self::start(config).await
    }

    /// Overwrite process data inside the server.
    pub fn set_process_data(&self, region: Direction, offset: usize, bytes: &[u8]) {
        let state = self.server.state();
        let mut guard = state.write().unwrap();
        guard.topology.image.write(region, offset, bytes).unwrap();
    }

    /// Read process data inside the server.
    pub fn process_data(&self, region: Direction, offset: usize, len: usize) -> Vec<u8> {
        let state = self.server.state();
        let guard = state.read().unwrap();
        guard.topology.image.read(region, offset, len).unwrap().to_vec()
    }

    /// Close the client and stop the server.
    pub async fn stop(self) {
        self.client.close().await.unwrap();
        self.server.shutdown().await;
    }
}
