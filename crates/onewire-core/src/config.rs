//! Bridge configuration, stored as TOML.
//!
//! Every section has defaults, so an empty file (or no file) is valid.

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::adapter::{Ds2480Options, Ds2480Timing, StreamingFlags};
use crate::address::Address;
use crate::error::OneWireError;
use crate::net::ServerOptions;
use crate::net::constants::{
    DEFAULT_MULTICAST_GROUP, DEFAULT_MULTICAST_PORT, DEFAULT_PORT, DEFAULT_SECRET,
};
use crate::sim::VirtualBus;
use crate::state::machine::LadderPolicy;
use crate::state::transport::BaudRate;
use crate::transport::LeasePolicy;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub adapter: AdapterConfig,
    pub lease: LeasePolicy,
    pub proxy: ProxyConfig,
    pub discovery: DiscoveryConfig,
    pub simulated: SimulatedConfig,
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Which adapter drives the local bus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    /// DS2480-based serial bridge.
    #[default]
    Ds2480,
    /// Passive serial adapter driven one time slot per byte.
    Ds9097,
    Simulated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub kind: AdapterKind,
    /// Serial port name, e.g. `COM1` or `/dev/ttyUSB0`.
    pub port: Option<String>,
    /// Highest host baud rate (9600, 19200, 57600 or 115200).
    pub max_baud: u32,
    pub streaming: StreamingFlags,
    pub ladder: LadderPolicy,
    pub timing: Ds2480Timing,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            kind: AdapterKind::default(),
            port: None,
            max_baud: BaudRate::B115200.bps(),
            streaming: StreamingFlags::default(),
            ladder: LadderPolicy::default(),
            timing: Ds2480Timing::default(),
        }
    }
}

impl AdapterConfig {
    pub fn ds2480_options(&self, lease: LeasePolicy) -> crate::error::Result<Ds2480Options> {
        Ok(Ds2480Options {
            max_baud: BaudRate::from_bps(self.max_baud)?,
            streaming: self.streaming,
            lease,
            ladder: self.ladder,
            timing: self.timing,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen: String,
    pub secret: String,
    pub multithreaded: bool,
    /// Client read timeout in single-threaded mode.
    pub idle_timeout_ms: u64,
    /// How long shutdown waits for connection threads.
    pub shutdown_grace_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{DEFAULT_PORT}"),
            secret: DEFAULT_SECRET.to_string(),
            multithreaded: true,
            idle_timeout_ms: 30_000,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl ProxyConfig {
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            secret: self.secret.clone(),
            multithreaded: self.multithreaded,
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub group: Ipv4Addr,
    pub port: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group: DEFAULT_MULTICAST_GROUP,
            port: DEFAULT_MULTICAST_PORT,
        }
    }
}

/// Devices on the simulated bus, as 16-digit hex addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedConfig {
    pub devices: Vec<String>,
    /// Subset of `devices` that answers alarm searches.
    pub alarming: Vec<String>,
}

impl SimulatedConfig {
    pub fn build_bus(&self) -> crate::error::Result<VirtualBus> {
        let mut bus = VirtualBus::new();
        for device in &self.devices {
            bus.add_device(parse_address(device)?);
        }
        for device in &self.alarming {
            bus.set_alarming(parse_address(device)?, true);
        }
        Ok(bus)
    }
}

fn parse_address(text: &str) -> crate::error::Result<Address> {
    text.parse()
        .map_err(|e| OneWireError::invalid(format!("bad device address {text:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config: BridgeConfig = toml::from_str("").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.adapter.kind, AdapterKind::Ds2480);
        assert_eq!(config.proxy.listen, "0.0.0.0:6161");
        assert_eq!(config.discovery.group, Ipv4Addr::new(228, 5, 6, 7));
        assert_eq!(config.lease.retry_interval_ms, 50);
    }

    #[test]
    fn test_partial_sections() {
        let config: BridgeConfig = toml::from_str(
            r#"
            [adapter]
            kind = "simulated"
            max_baud = 57600

            [proxy]
            multithreaded = false

            [simulated]
            devices = ["6F00000000DEAD28"]
            "#,
        )
        .unwrap();
        assert_eq!(config.adapter.kind, AdapterKind::Simulated);
        assert!(config.adapter.streaming.bytes);
        assert!(!config.proxy.multithreaded);
        assert_eq!(config.proxy.secret, DEFAULT_SECRET);

        let options = config.adapter.ds2480_options(config.lease).unwrap();
        assert_eq!(options.max_baud, BaudRate::B57600);
    }

    #[test]
    fn test_bad_baud_and_address_are_rejected() {
        let adapter = AdapterConfig {
            max_baud: 38400,
            ..AdapterConfig::default()
        };
        assert!(adapter.ds2480_options(LeasePolicy::default()).is_err());

        let simulated = SimulatedConfig {
            devices: vec!["not hex".into()],
            alarming: Vec::new(),
        };
        assert!(simulated.build_bus().is_err());
    }

    #[test]
    fn test_simulated_bus_from_config() {
        let first = Address::with_crc(0x28, [1, 2, 3, 4, 5, 6]);
        let second = Address::with_crc(0x10, [1, 2, 3, 4, 5, 6]);
        let simulated = SimulatedConfig {
            devices: vec![first.to_string(), second.to_string()],
            alarming: vec![second.to_string()],
        };
        let bus = simulated.build_bus().unwrap();
        assert_eq!(bus.devices().len(), 2);
        assert!(bus.devices().iter().any(|d| d.address == second && d.alarming));
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("owbridge-config-{}.toml", std::process::id()));
        let mut config = BridgeConfig::default();
        config.adapter.port = Some("/dev/ttyUSB0".into());
        config.proxy.idle_timeout_ms = 1_000;
        config.save_to_file(&path).unwrap();

        let loaded = BridgeConfig::load_from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
