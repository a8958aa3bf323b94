//! Passive serial adapter (DS9097 and clones).
//!
//! The UART runs at 115200 baud so one byte spans one 1-Wire time slot:
//! `0xFF` is a write-1 / read slot, `0x00` a write-0 slot, and the echo
//! tells what the bus held. Resets use a serial break. There is no search
//! accelerator, so searches go through [`search::search_pass`].

use std::sync::{Arc, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, trace};

use super::{Capability, PortAdapter};
use crate::address::Address;
use crate::error::{OneWireError, Result};
use crate::events::{BusEvent, BusObserver, PacketDirection, TracingObserver};
use crate::search::{self, SearchBus};
use crate::state::link::{LinkState, PowerCondition, PowerDuration, ResetResult, Speed};
use crate::transport::{
    LeasePolicy, LocalExclusive, SerialLink, SessionId, TransportError, TransportSession,
};

const ADAPTER_NAME: &str = "DS9097";
const SLOT_BAUD: u32 = 115_200;
const SLOT_ONE: u8 = 0xFF;
const SLOT_ZERO: u8 = 0x00;
/// Data bytes per serial exchange; each expands to eight slot bytes.
const MAX_BLOCK_CHUNK: usize = 128;
/// Echo of a break nobody answered.
const BREAK_ECHO_IDLE: u8 = 0xF0;
const BREAK_DURATION: Duration = Duration::from_millis(1);
/// Read slots sent to check the adapter echoes at all.
const PROBE_SLOTS: [u8; 4] = [SLOT_ONE; 4];

struct Ds9097Port {
    session: TransportSession,
    present: AtomicBool,
    observer: Arc<dyn BusObserver>,
}

impl Ds9097Port {
    fn enter(&self, session: SessionId) -> Result<Slots<'_>> {
        let exclusive = self.session.local_exclusive(session)?;
        Ok(Slots {
            port: self,
            link: self.session.link(),
            _exclusive: exclusive,
        })
    }
}

fn probe(link: &mut dyn SerialLink) -> std::result::Result<Vec<u8>, TransportError> {
    link.set_baud_rate(SLOT_BAUD)?;
    link.flush()?;
    link.write(&PROBE_SLOTS)?;
    link.read_exact_default(PROBE_SLOTS.len())
}

/// Time-slot access for one operation.
struct Slots<'a> {
    port: &'a Ds9097Port,
    link: MutexGuard<'a, Box<dyn SerialLink>>,
    _exclusive: LocalExclusive<'a>,
}

impl Slots<'_> {
    fn ensure_ready(&mut self) -> Result<()> {
        if self.port.present.load(Ordering::Acquire) {
            return Ok(());
        }
        let port = self.port.session.port_name().to_string();
        match probe(self.link.as_mut()) {
            Ok(_) => {
                self.port.present.store(true, Ordering::Release);
                self.port.observer.on_event(&BusEvent::AdapterDetected {
                    port,
                    adapter: ADAPTER_NAME.to_string(),
                });
                Ok(())
            }
            Err(e) => {
                debug!(port = %port, error = %e, "No echo from passive adapter");
                Err(OneWireError::AdapterNotDetected { port })
            }
        }
    }

    fn lost(&mut self, e: TransportError) -> OneWireError {
        if self.port.present.swap(false, Ordering::AcqRel) {
            self.port.observer.on_event(&BusEvent::AdapterLost {
                port: self.port.session.port_name().to_string(),
                reason: e.to_string(),
            });
        }
        e.into()
    }

    /// Send slot bytes and return their echoes.
    fn exchange(&mut self, slots: &[u8]) -> Result<Vec<u8>> {
        self.ensure_ready()?;
        self.port.observer.on_event(&BusEvent::Packet {
            direction: PacketDirection::Tx,
            length: slots.len(),
            data: None,
        });
        let result = self
            .link
            .write(slots)
            .and_then(|_| self.link.read_exact_default(slots.len()));
        result.map_err(|e| self.lost(e))
    }

    fn reset(&mut self) -> Result<ResetResult> {
        self.ensure_ready()?;
        let result = self
            .link
            .flush()
            .and_then(|_| self.link.send_break(BREAK_DURATION))
            .and_then(|_| self.link.read_exact_default(1));
        let echo = match result {
            Ok(bytes) => bytes[0],
            Err(e) => return Err(self.lost(e)),
        };
        trace!(echo = %format!("0x{echo:02X}"), "Break echo");
        Ok(match echo {
            BREAK_ECHO_IDLE => ResetResult::NoPresence,
            0x00 => ResetResult::Short,
            _ => ResetResult::Presence,
        })
    }

    fn touch_bit(&mut self, bit: bool) -> Result<bool> {
        let echo = self.exchange(&[if bit { SLOT_ONE } else { SLOT_ZERO }])?;
        Ok(echo[0] == SLOT_ONE)
    }

    fn block(&mut self, block: &mut [u8]) -> Result<()> {
        for chunk in block.chunks_mut(MAX_BLOCK_CHUNK) {
            let slots: Vec<u8> = chunk
                .iter()
                .flat_map(|&byte| {
                    (0..8).map(move |i| {
                        if (byte >> i) & 0x01 == 0x01 {
                            SLOT_ONE
                        } else {
                            SLOT_ZERO
                        }
                    })
                })
                .collect();
            let echo = self.exchange(&slots)?;
            for (byte, bits) in chunk.iter_mut().zip(echo.chunks(8)) {
                *byte = bits
                    .iter()
                    .enumerate()
                    .fold(0u8, |acc, (i, &e)| acc | (u8::from(e == SLOT_ONE) << i));
            }
        }
        Ok(())
    }

    fn is_present(&mut self, link: &LinkState, address: Address, alarm_only: bool) -> Result<bool> {
        let mut probe = link.seeded_for(address);
        probe.search_alarm_only = alarm_only;
        Ok(search::search_pass(self, &mut probe)? && probe.address == address)
    }
}

impl SearchBus for Slots<'_> {
    fn search_reset(&mut self) -> Result<bool> {
        Ok(self.reset()?.is_presence())
    }

    fn write_byte(&mut self, byte: u8) -> Result<()> {
        let mut block = [byte];
        self.block(&mut block)
    }

    fn read_bit(&mut self) -> Result<bool> {
        self.touch_bit(true)
    }

    fn write_bit(&mut self, bit: bool) -> Result<()> {
        self.touch_bit(bit).map(|_| ())
    }
}

/// One session on a passive serial adapter.
pub struct Ds9097Adapter {
    port: Arc<Ds9097Port>,
    session: SessionId,
    link: LinkState,
}

impl Ds9097Adapter {
    pub fn open(link: Box<dyn SerialLink>, lease: LeasePolicy) -> Result<Self> {
        Self::open_with_observer(link, lease, Arc::new(TracingObserver))
    }

    pub fn open_with_observer(
        link: Box<dyn SerialLink>,
        lease: LeasePolicy,
        observer: Arc<dyn BusObserver>,
    ) -> Result<Self> {
        let port = Arc::new(Ds9097Port {
            session: TransportSession::new(link, lease),
            present: AtomicBool::new(false),
            observer,
        });
        Self::attach(port)
    }

    fn attach(port: Arc<Ds9097Port>) -> Result<Self> {
        let session = SessionId::next();
        port.session.attach(session)?;
        Ok(Self {
            port,
            session,
            link: LinkState::new(),
        })
    }

    fn with_slots<T>(
        &mut self,
        f: impl FnOnce(&mut Slots<'_>, &mut LinkState) -> Result<T>,
    ) -> Result<T> {
        let port = Arc::clone(&self.port);
        let mut slots = port.enter(self.session)?;
        f(&mut slots, &mut self.link)
    }

    fn unsupported(operation: &'static str) -> OneWireError {
        OneWireError::Unsupported {
            adapter: ADAPTER_NAME,
            operation,
        }
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

impl Drop for Ds9097Adapter {
    fn drop(&mut self) {
        self.port.session.detach(self.session);
    }
}

impl PortAdapter for Ds9097Adapter {
    fn adapter_name(&self) -> &str {
        ADAPTER_NAME
    }

    fn port_name(&self) -> &str {
        self.port.session.port_name()
    }

    fn session_id(&self) -> SessionId {
        self.session
    }

    fn new_session(&self) -> Result<Box<dyn PortAdapter>> {
        Ok(Box::new(Self::attach(Arc::clone(&self.port))?))
    }

    fn adapter_detected(&mut self) -> Result<bool> {
        self.with_slots(|slots, _| Ok(slots.ensure_ready().is_ok()))
    }

    fn adapter_version(&mut self) -> Result<String> {
        Ok("DS9097 adapter".to_string())
    }

    fn has_capability(&mut self, _capability: Capability) -> Result<bool> {
        Ok(false)
    }

    fn begin_exclusive(&mut self, blocking: bool) -> Result<bool> {
        Ok(self.port.session.begin_exclusive(self.session, blocking))
    }

    fn end_exclusive(&mut self) -> Result<()> {
        self.port.session.end_exclusive(self.session);
        Ok(())
    }

    fn find_first_device(&mut self) -> Result<bool> {
        let found = self.with_slots(|slots, link| {
            search::find_first(link, |l| search::search_pass(&mut *slots, l))
        })?;
        Ok(self.found(found))
    }

    fn find_next_device(&mut self) -> Result<bool> {
        let found = self.with_slots(|slots, link| {
            search::find_next(link, |l| search::search_pass(&mut *slots, l))
        })?;
        Ok(self.found(found))
    }

    fn address(&mut self) -> Result<Address> {
        Ok(self.link.address)
    }

    fn is_present(&mut self, address: Address) -> Result<bool> {
        self.with_slots(|slots, link| slots.is_present(link, address, false))
    }

    fn is_alarming(&mut self, address: Address) -> Result<bool> {
        self.with_slots(|slots, link| slots.is_present(link, address, true))
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
        self.with_slots(|slots, _| slots.reset())
    }

    fn put_bit(&mut self, bit: bool) -> Result<()> {
        if self.with_slots(|slots, _| slots.touch_bit(bit))? != bit {
            return Err(OneWireError::comm("1-Wire bit echo was incorrect"));
        }
        Ok(())
    }

    fn get_bit(&mut self) -> Result<bool> {
        self.with_slots(|slots, _| slots.touch_bit(true))
    }

    fn data_block(&mut self, block: &mut [u8]) -> Result<()> {
        self.with_slots(|slots, _| slots.block(block))
    }

    fn set_power_duration(&mut self, _duration: PowerDuration) -> Result<()> {
        Err(Self::unsupported("power delivery"))
    }

    fn start_power_delivery(&mut self, _condition: PowerCondition) -> Result<bool> {
        Err(Self::unsupported("power delivery"))
    }

    fn set_program_pulse_duration(&mut self, _duration: PowerDuration) -> Result<()> {
        Err(Self::unsupported("program pulse"))
    }

    fn start_program_pulse(&mut self, _condition: PowerCondition) -> Result<bool> {
        Err(Self::unsupported("program pulse"))
    }

    fn start_break(&mut self) -> Result<()> {
        Err(Self::unsupported("break"))
    }

    fn set_power_normal(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_speed(&mut self, speed: Speed) -> Result<()> {
        if speed != Speed::Regular {
            return Err(Self::unsupported("speeds other than regular"));
        }
        self.link.speed = speed;
        Ok(())
    }

    fn speed(&self) -> Speed {
        self.link.speed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::enumerate;
    use crate::error::ErrorKind;
    use crate::events::tests::RecordingObserver;
    use crate::sim::{Ds9097Emulator, VirtualBus};

    fn devices() -> Vec<Address> {
        vec![
            Address::with_crc(0x28, [0xA1, 0, 0, 0, 0, 1]),
            Address::with_crc(0x28, [0xA1, 0, 0, 0, 0, 2]),
            Address::with_crc(0x12, [0x10, 0x20, 0x30, 0x40, 0x50, 0x60]),
        ]
    }

    fn emulated(addresses: &[Address]) -> (Ds9097Adapter, Ds9097Emulator) {
        let emulator = Ds9097Emulator::new(VirtualBus::with_devices(addresses));
        let adapter = Ds9097Adapter::open(Box::new(emulator.clone()), LeasePolicy::default())
            .unwrap();
        (adapter, emulator)
    }

    #[test]
    fn test_reset_via_break() {
        let (mut adapter, _) = emulated(&devices());
        assert_eq!(adapter.reset().unwrap(), ResetResult::Presence);

        let (mut empty, _) = emulated(&[]);
        assert_eq!(empty.reset().unwrap(), ResetResult::NoPresence);
    }

    #[test]
    fn test_software_search_finds_every_device() {
        let (mut adapter, _) = emulated(&devices());
        let mut found = enumerate(&mut adapter).unwrap();
        found.sort();
        let mut expected = devices();
        expected.sort();
        assert_eq!(found, expected);
    }

    #[test]
    fn test_search_with_include_and_exclude() {
        let (mut adapter, _) = emulated(&devices());
        adapter.target_families(&[0x12]).unwrap();
        assert_eq!(enumerate(&mut adapter).unwrap(), vec![devices()[2]]);

        adapter.target_all_families().unwrap();
        adapter.exclude_families(&[0x12]).unwrap();
        let found = enumerate(&mut adapter).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|a| a.family() == 0x28));
    }

    #[test]
    fn test_block_spans_several_writes() {
        let observer = Arc::new(RecordingObserver::default());
        let emulator = Ds9097Emulator::new(VirtualBus::with_devices(&devices()));
        let mut adapter = Ds9097Adapter::open_with_observer(
            Box::new(emulator),
            LeasePolicy::default(),
            observer.clone(),
        )
        .unwrap();
        adapter.reset().unwrap();
        adapter.put_byte(0xCC).unwrap();
        assert_eq!(adapter.get_block(200).unwrap(), vec![0xFF; 200]);

        let writes: Vec<usize> = observer
            .events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                BusEvent::Packet { length, .. } => Some(*length),
                _ => None,
            })
            .collect();
        assert_eq!(writes, vec![8, 128 * 8, 72 * 8]);
    }

    #[test]
    fn test_presence_and_alarm_checks() {
        let all = devices();
        let (mut adapter, emulator) = emulated(&all);
        emulator.bus().lock().unwrap().set_alarming(all[1], true);

        assert!(adapter.is_present(all[2]).unwrap());
        assert!(!adapter.is_present(Address::with_crc(0x01, [9, 9, 9, 9, 9, 9])).unwrap());
        assert!(adapter.is_alarming(all[1]).unwrap());
        assert!(!adapter.is_alarming(all[0]).unwrap());
    }

    #[test]
    fn test_unplugged_adapter() {
        let (mut adapter, emulator) = emulated(&devices());
        assert!(adapter.adapter_detected().unwrap());

        emulator.unplug();
        assert_eq!(adapter.reset().unwrap_err().kind(), ErrorKind::Communication);
        assert_eq!(adapter.reset().unwrap_err().kind(), ErrorKind::AdapterUnreachable);
        assert!(!adapter.adapter_detected().unwrap());
    }

    #[test]
    fn test_regular_speed_only() {
        let (mut adapter, _) = emulated(&[]);
        assert!(adapter.set_speed(Speed::Regular).is_ok());
        assert_eq!(
            adapter.set_speed(Speed::Overdrive).unwrap_err().kind(),
            ErrorKind::Setup
        );
        for capability in Capability::ALL {
            assert!(!adapter.has_capability(capability).unwrap());
        }
        assert!(adapter.start_power_delivery(PowerCondition::Now).is_err());
    }
}
