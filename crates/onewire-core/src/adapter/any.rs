//! Adapter chosen at run time.

use std::net::ToSocketAddrs;
use std::sync::{Arc, Mutex};

use tracing::info;

use super::{Capability, Ds2480Adapter, Ds9097Adapter, PortAdapter, SimAdapter};
use crate::address::Address;
use crate::config::{AdapterKind, BridgeConfig};
use crate::error::{OneWireError, Result};
use crate::events::{BusObserver, TracingObserver};
use crate::net::NetAdapter;
use crate::state::link::{PowerCondition, PowerDuration, ResetResult, Speed};
use crate::transport::{SerialPortLink, SessionId};

/// One of the concrete adapters behind a single type.
pub enum AnyAdapter {
    Ds2480(Ds2480Adapter),
    Ds9097(Ds9097Adapter),
    Simulated(SimAdapter),
    Remote(NetAdapter),
}

macro_rules! delegate {
    ($self:ident, $adapter:ident => $call:expr) => {
        match $self {
            AnyAdapter::Ds2480($adapter) => $call,
            AnyAdapter::Ds9097($adapter) => $call,
            AnyAdapter::Simulated($adapter) => $call,
            AnyAdapter::Remote($adapter) => $call,
        }
    };
}

impl AnyAdapter {
    /// Open the local adapter described by `config`.
    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        Self::from_config_with_observer(config, Arc::new(TracingObserver))
    }

    pub fn from_config_with_observer(
        config: &BridgeConfig,
        observer: Arc<dyn BusObserver>,
    ) -> Result<Self> {
        let adapter = match config.adapter.kind {
            AdapterKind::Simulated => {
                let bus = config.simulated.build_bus()?;
                AnyAdapter::Simulated(SimAdapter::with_observer(
                    Arc::new(Mutex::new(bus)),
                    config.lease,
                    observer,
                ))
            }
            AdapterKind::Ds2480 => {
                let port = config.adapter.port.as_ref().ok_or(OneWireError::PortNotSelected)?;
                let options = config.adapter.ds2480_options(config.lease)?;
                let link = Box::new(SerialPortLink::new(port.clone()));
                AnyAdapter::Ds2480(Ds2480Adapter::open_with_observer(link, options, observer)?)
            }
            AdapterKind::Ds9097 => {
                let port = config.adapter.port.as_ref().ok_or(OneWireError::PortNotSelected)?;
                let link = Box::new(SerialPortLink::new(port.clone()));
                AnyAdapter::Ds9097(Ds9097Adapter::open_with_observer(link, config.lease, observer)?)
            }
        };
        info!(
            adapter = adapter.adapter_name(),
            port = adapter.port_name(),
            "Adapter opened"
        );
        Ok(adapter)
    }

    /// Connect to a proxy server.
    pub fn remote(addr: impl ToSocketAddrs, secret: &str) -> Result<Self> {
        Ok(AnyAdapter::Remote(NetAdapter::connect(addr, secret)?))
    }
}

impl PortAdapter for AnyAdapter {
    fn adapter_name(&self) -> &str {
        delegate!(self, a => a.adapter_name())
    }

    fn port_name(&self) -> &str {
        delegate!(self, a => a.port_name())
    }

    fn session_id(&self) -> SessionId {
        delegate!(self, a => a.session_id())
    }

    fn new_session(&self) -> Result<Box<dyn PortAdapter>> {
        delegate!(self, a => a.new_session())
    }

    fn adapter_detected(&mut self) -> Result<bool> {
        delegate!(self, a => a.adapter_detected())
    }

    fn adapter_version(&mut self) -> Result<String> {
        delegate!(self, a => a.adapter_version())
    }

    fn has_capability(&mut self, capability: Capability) -> Result<bool> {
        delegate!(self, a => a.has_capability(capability))
    }

    fn begin_exclusive(&mut self, blocking: bool) -> Result<bool> {
        delegate!(self, a => a.begin_exclusive(blocking))
    }

    fn end_exclusive(&mut self) -> Result<()> {
        delegate!(self, a => a.end_exclusive())
    }

    fn find_first_device(&mut self) -> Result<bool> {
        delegate!(self, a => a.find_first_device())
    }

    fn find_next_device(&mut self) -> Result<bool> {
        delegate!(self, a => a.find_next_device())
    }

    fn address(&mut self) -> Result<Address> {
        delegate!(self, a => a.address())
    }

    fn is_present(&mut self, address: Address) -> Result<bool> {
        delegate!(self, a => a.is_present(address))
    }

    fn is_alarming(&mut self, address: Address) -> Result<bool> {
        delegate!(self, a => a.is_alarming(address))
    }

    fn set_search_only_alarming(&mut self) -> Result<()> {
        delegate!(self, a => a.set_search_only_alarming())
    }

    fn set_no_reset_search(&mut self) -> Result<()> {
        delegate!(self, a => a.set_no_reset_search())
    }

    fn set_search_all(&mut self) -> Result<()> {
        delegate!(self, a => a.set_search_all())
    }

    fn target_all_families(&mut self) -> Result<()> {
        delegate!(self, a => a.target_all_families())
    }

    fn target_families(&mut self, families: &[u8]) -> Result<()> {
        delegate!(self, a => a.target_families(families))
    }

    fn exclude_families(&mut self, families: &[u8]) -> Result<()> {
        delegate!(self, a => a.exclude_families(families))
    }

    fn reset(&mut self) -> Result<ResetResult> {
        delegate!(self, a => a.reset())
    }

    fn put_bit(&mut self, bit: bool) -> Result<()> {
        delegate!(self, a => a.put_bit(bit))
    }

    fn get_bit(&mut self) -> Result<bool> {
        delegate!(self, a => a.get_bit())
    }

    fn data_block(&mut self, block: &mut [u8]) -> Result<()> {
        delegate!(self, a => a.data_block(block))
    }

    fn put_byte(&mut self, byte: u8) -> Result<()> {
        delegate!(self, a => a.put_byte(byte))
    }

    fn get_byte(&mut self) -> Result<u8> {
        delegate!(self, a => a.get_byte())
    }

    fn get_block(&mut self, len: usize) -> Result<Vec<u8>> {
        delegate!(self, a => a.get_block(len))
    }

    fn set_power_duration(&mut self, duration: PowerDuration) -> Result<()> {
        delegate!(self, a => a.set_power_duration(duration))
    }

    fn start_power_delivery(&mut self, condition: PowerCondition) -> Result<bool> {
        delegate!(self, a => a.start_power_delivery(condition))
    }

    fn set_program_pulse_duration(&mut self, duration: PowerDuration) -> Result<()> {
        delegate!(self, a => a.set_program_pulse_duration(duration))
    }

    fn start_program_pulse(&mut self, condition: PowerCondition) -> Result<bool> {
        delegate!(self, a => a.start_program_pulse(condition))
    }

    fn start_break(&mut self) -> Result<()> {
        delegate!(self, a => a.start_break())
    }

    fn set_power_normal(&mut self) -> Result<()> {
        delegate!(self, a => a.set_power_normal())
    }

    fn set_speed(&mut self, speed: Speed) -> Result<()> {
        delegate!(self, a => a.set_speed(speed))
    }

    fn speed(&self) -> Speed {
        delegate!(self, a => a.speed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::enumerate;
    use crate::config::SimulatedConfig;
    use crate::error::ErrorKind;

    #[test]
    fn test_simulated_from_config() {
        let device = Address::with_crc(0x28, [1, 2, 3, 4, 5, 6]);
        let config = BridgeConfig {
            adapter: crate::config::AdapterConfig {
                kind: AdapterKind::Simulated,
                ..Default::default()
            },
            simulated: SimulatedConfig {
                devices: vec![device.to_string()],
                alarming: Vec::new(),
            },
            ..Default::default()
        };
        let mut adapter = AnyAdapter::from_config(&config).unwrap();
        assert!(matches!(adapter, AnyAdapter::Simulated(_)));
        assert_eq!(enumerate(&mut adapter).unwrap(), vec![device]);

        let mut session = adapter.new_session().unwrap();
        assert_ne!(session.session_id(), adapter.session_id());
        assert!(session.is_present(device).unwrap());
    }

    #[test]
    fn test_serial_kinds_need_a_port() {
        for kind in [AdapterKind::Ds2480, AdapterKind::Ds9097] {
            let mut config = BridgeConfig::default();
            config.adapter.kind = kind;
            let err = AnyAdapter::from_config(&config).err().unwrap();
            assert!(matches!(err, OneWireError::PortNotSelected));
            assert_eq!(err.kind(), ErrorKind::Setup);
        }
    }
}
