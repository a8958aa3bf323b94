//! Adapter backed directly by a [`VirtualBus`], with no serial layer.

use std::sync::{Arc, Mutex, MutexGuard};

use super::{Capability, PortAdapter};
use crate::address::Address;
use crate::error::{OneWireError, Result};
use crate::events::{BusEvent, BusObserver, TracingObserver};
use crate::search::{self, SearchBus};
use crate::sim::VirtualBus;
use crate::state::link::{
    LinkState, PowerCondition, PowerDuration, PowerLevel, ResetResult, Speed,
};
use crate::sync::lock;
use crate::transport::{ExclusiveLease, LeasePolicy, LocalExclusive, SessionId};

const ADAPTER_NAME: &str = "Simulated";

struct SimPort {
    name: String,
    bus: Arc<Mutex<VirtualBus>>,
    lease: ExclusiveLease,
    observer: Arc<dyn BusObserver>,
}

/// Bus access for one operation.
struct SimBus<'a> {
    bus: MutexGuard<'a, VirtualBus>,
    _exclusive: LocalExclusive<'a>,
}

impl SearchBus for SimBus<'_> {
    fn search_reset(&mut self) -> Result<bool> {
        Ok(self.bus.reset().is_presence())
    }

    fn write_byte(&mut self, byte: u8) -> Result<()> {
        self.bus.touch_byte(byte);
        Ok(())
    }

    fn read_bit(&mut self) -> Result<bool> {
        Ok(self.bus.touch_bit(true))
    }

    fn write_bit(&mut self, bit: bool) -> Result<()> {
        self.bus.touch_bit(bit);
        Ok(())
    }
}

impl SimBus<'_> {
    fn is_present(&mut self, link: &LinkState, address: Address, alarm_only: bool) -> Result<bool> {
        let mut probe = link.seeded_for(address);
        probe.search_alarm_only = alarm_only;
        Ok(search::search_pass(self, &mut probe)? && probe.address == address)
    }
}

/// In-process adapter that supports every capability.
///
/// Handy for tests and for running the proxy without hardware. Sessions
/// created with [`PortAdapter::new_session`] share the bus and lease.
pub struct SimAdapter {
    port: Arc<SimPort>,
    session: SessionId,
    link: LinkState,
}

impl SimAdapter {
    pub fn new(bus: VirtualBus) -> Self {
        Self::with_shared_bus(Arc::new(Mutex::new(bus)), LeasePolicy::default())
    }

    pub fn with_shared_bus(bus: Arc<Mutex<VirtualBus>>, lease: LeasePolicy) -> Self {
        Self::with_observer(bus, lease, Arc::new(TracingObserver))
    }

    pub fn with_observer(
        bus: Arc<Mutex<VirtualBus>>,
        lease: LeasePolicy,
        observer: Arc<dyn BusObserver>,
    ) -> Self {
        let port = Arc::new(SimPort {
            name: "SIM0".to_string(),
            bus,
            lease: ExclusiveLease::new(lease),
            observer,
        });
        Self::attach(port)
    }

    fn attach(port: Arc<SimPort>) -> Self {
        Self {
            port,
            session: SessionId::next(),
            link: LinkState::new(),
        }
    }

    pub fn bus(&self) -> Arc<Mutex<VirtualBus>> {
        Arc::clone(&self.port.bus)
    }

    fn with_bus<T>(&mut self, f: impl FnOnce(&mut SimBus<'_>, &mut LinkState) -> Result<T>) -> Result<T> {
        let port = Arc::clone(&self.port);
        let exclusive = port.lease.local(self.session)?;
        let mut bus = SimBus {
            bus: lock(&port.bus),
            _exclusive: exclusive,
        };
        f(&mut bus, &mut self.link)
    }

    fn found(&self, found: bool) -> bool {
        if found {
            self.port.observer.on_event(&BusEvent::DeviceFound {
                address: self.link.address,
            });
        }
        found
    }
}

impl Drop for SimAdapter {
    fn drop(&mut self) {
        self.port.lease.cleanup(self.session);
    }
}

impl PortAdapter for SimAdapter {
    fn adapter_name(&self) -> &str {
        ADAPTER_NAME
    }

    fn port_name(&self) -> &str {
        &self.port.name
    }

    fn session_id(&self) -> SessionId {
        self.session
    }

    fn new_session(&self) -> Result<Box<dyn PortAdapter>> {
        Ok(Box::new(Self::attach(Arc::clone(&self.port))))
    }

    fn adapter_detected(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn adapter_version(&mut self) -> Result<String> {
        Ok("Simulated adapter, version 1".to_string())
    }

    fn has_capability(&mut self, _capability: Capability) -> Result<bool> {
        Ok(true)
    }

    fn begin_exclusive(&mut self, blocking: bool) -> Result<bool> {
        Ok(self.port.lease.acquire(self.session, blocking))
    }

    fn end_exclusive(&mut self) -> Result<()> {
        self.port.lease.release(self.session);
        Ok(())
    }

    fn find_first_device(&mut self) -> Result<bool> {
        let found = self.with_bus(|bus, link| {
            search::find_first(link, |l| search::search_pass(&mut *bus, l))
        })?;
        Ok(self.found(found))
    }

    fn find_next_device(&mut self) -> Result<bool> {
        let found = self.with_bus(|bus, link| {
            search::find_next(link, |l| search::search_pass(&mut *bus, l))
        })?;
        Ok(self.found(found))
    }

    fn address(&mut self) -> Result<Address> {
        Ok(self.link.address)
    }

    fn is_present(&mut self, address: Address) -> Result<bool> {
        self.with_bus(|bus, link| bus.is_present(link, address, false))
    }

    fn is_alarming(&mut self, address: Address) -> Result<bool> {
        self.with_bus(|bus, link| bus.is_present(link, address, true))
    }

    fn set_search_only_alarming(&mut self) -> Result<()> {
        self.link.set_search_only_alarming();
        Ok(())
    }

    fn set_no_reset_search(&mut self) -> Result<()> {
        self.link.set_no_reset_search();
        Ok(())
    }

    fn set_search_all(&mut self) -> Result<()> {
        self.link.set_search_all();
        Ok(())
    }

    fn target_all_families(&mut self) -> Result<()> {
        self.link.target_all_families();
        Ok(())
    }

    fn target_families(&mut self, families: &[u8]) -> Result<()> {
        self.link.target_families(families);
        Ok(())
    }

    fn exclude_families(&mut self, families: &[u8]) -> Result<()> {
        self.link.exclude_families(families);
        Ok(())
    }

    fn reset(&mut self) -> Result<ResetResult> {
        self.with_bus(|bus, link| {
            link.power_level = PowerLevel::Normal;
            Ok(bus.bus.reset())
        })
    }

    fn put_bit(&mut self, bit: bool) -> Result<()> {
        if self.get_bit_with(bit)? != bit {
            return Err(OneWireError::comm("1-Wire bit echo was incorrect"));
        }
        Ok(())
    }

    fn get_bit(&mut self) -> Result<bool> {
        self.get_bit_with(true)
    }

    fn data_block(&mut self, block: &mut [u8]) -> Result<()> {
        self.with_bus(|bus, link| {
            for byte in block.iter_mut() {
                *byte = bus.bus.touch_byte(*byte);
            }
            if link.level_change_on_next_byte && !block.is_empty() {
                link.level_change_on_next_byte = false;
                link.power_level = PowerLevel::PowerDelivery;
            }
            Ok(())
        })
    }

    fn set_power_duration(&mut self, duration: PowerDuration) -> Result<()> {
        self.link.power_duration = duration;
        Ok(())
    }

    fn start_power_delivery(&mut self, condition: PowerCondition) -> Result<bool> {
        match condition {
            PowerCondition::Now => {
                self.link.power_level = PowerLevel::PowerDelivery;
                Ok(true)
            }
            PowerCondition::AfterBit => {
                self.link.level_change_on_next_bit = true;
                Ok(false)
            }
            PowerCondition::AfterByte => {
                self.link.level_change_on_next_byte = true;
                Ok(false)
            }
        }
    }

    fn set_program_pulse_duration(&mut self, duration: PowerDuration) -> Result<()> {
        self.link.program_pulse_duration = duration;
        Ok(())
    }

    fn start_program_pulse(&mut self, condition: PowerCondition) -> Result<bool> {
        if condition != PowerCondition::Now {
            return Err(OneWireError::Unsupported {
                adapter: ADAPTER_NAME,
                operation: "deferred program pulse",
            });
        }
        Ok(true)
    }

    fn start_break(&mut self) -> Result<()> {
        self.link.power_level = PowerLevel::Break;
        Ok(())
    }

    fn set_power_normal(&mut self) -> Result<()> {
        self.link.power_level = PowerLevel::Normal;
        Ok(())
    }

    fn set_speed(&mut self, speed: Speed) -> Result<()> {
        self.link.speed = speed;
        Ok(())
    }

    fn speed(&self) -> Speed {
        self.link.speed
    }
}

impl SimAdapter {
    fn get_bit_with(&mut self, bit: bool) -> Result<bool> {
        self.with_bus(|bus, link| {
            let read = bus.bus.touch_bit(bit);
            if link.level_change_on_next_bit {
                link.level_change_on_next_bit = false;
                link.power_level = PowerLevel::PowerDelivery;
            }
            Ok(read)
        })
    }

    /// Power level of this session, for tests and diagnostics.
    pub fn power_level(&self) -> PowerLevel {
        self.link.power_level
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::enumerate;

    fn devices() -> Vec<Address> {
        vec![
            Address::with_crc(0x10, [1, 0, 0, 0, 0, 0]),
            Address::with_crc(0x10, [2, 0, 0, 0, 0, 0]),
            Address::with_crc(0x26, [3, 0, 0, 0, 0, 0]),
            Address::with_crc(0x28, [4, 0, 0, 0, 0, 0]),
        ]
    }

    #[test]
    fn test_enumerates_virtual_bus() {
        let mut adapter = SimAdapter::new(VirtualBus::with_devices(&devices()));
        let mut found = enumerate(&mut adapter).unwrap();
        found.sort();
        assert_eq!(found, devices());
    }

    #[test]
    fn test_bus_changes_are_visible() {
        let mut adapter = SimAdapter::new(VirtualBus::with_devices(&devices()));
        let bus = adapter.bus();
        bus.lock().unwrap().remove_device(devices()[2]);
        assert_eq!(enumerate(&mut adapter).unwrap().len(), 3);
        assert!(!adapter.is_present(devices()[2]).unwrap());
        assert!(adapter.is_present(devices()[3]).unwrap());
    }

    #[test]
    fn test_power_conditions() {
        let mut adapter = SimAdapter::new(VirtualBus::with_devices(&devices()));
        assert!(!adapter.start_power_delivery(PowerCondition::AfterByte).unwrap());
        assert_eq!(adapter.power_level(), PowerLevel::Normal);
        adapter.get_byte().unwrap();
        assert_eq!(adapter.power_level(), PowerLevel::PowerDelivery);

        adapter.set_power_normal().unwrap();
        assert!(!adapter.start_power_delivery(PowerCondition::AfterBit).unwrap());
        adapter.get_bit().unwrap();
        assert_eq!(adapter.power_level(), PowerLevel::PowerDelivery);

        adapter.start_break().unwrap();
        assert_eq!(adapter.power_level(), PowerLevel::Break);
        adapter.set_power_normal().unwrap();
        assert_eq!(adapter.power_level(), PowerLevel::Normal);
    }

    #[test]
    fn test_match_rom_selects_device() {
        let all = devices();
        let mut adapter = SimAdapter::new(VirtualBus::with_devices(&all));
        assert_eq!(adapter.reset().unwrap(), ResetResult::Presence);
        adapter.put_byte(0x55).unwrap();
        let mut rom = *all[1].bytes();
        adapter.data_block(&mut rom).unwrap();
        assert_eq!(adapter.bus().lock().unwrap().selected(), vec![all[1]]);
    }

    #[test]
    fn test_sessions_share_lease() {
        let mut first = SimAdapter::new(VirtualBus::new());
        let mut second = first.new_session().unwrap();
        assert!(first.begin_exclusive(false).unwrap());
        assert!(!second.begin_exclusive(false).unwrap());
        drop(first);
        assert!(second.begin_exclusive(false).unwrap());
    }
}
