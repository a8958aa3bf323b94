//! Wired-AND 1-Wire bus populated with virtual devices.
//!
//! Devices understand the ROM layer only: search, alarm search, match and
//! skip. After that they stay passive, so read slots return ones.

use tracing::trace;

use crate::address::Address;
use crate::error::Result;
use crate::protocol::constants::{
    ROM_ALARM_SEARCH, ROM_MATCH, ROM_OVERDRIVE_SKIP, ROM_SEARCH, ROM_SKIP,
};
use crate::search::SearchBus;
use crate::state::link::ResetResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualDevice {
    pub address: Address,
    pub alarming: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchSlot {
    Bit,
    Complement,
    Direction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RomPhase {
    /// Devices ignore the bus until the next reset.
    Idle,
    /// Collecting the ROM command, least significant bit first.
    Command { value: u8, bits: u8 },
    Search {
        index: usize,
        slot: SearchSlot,
        participants: Vec<usize>,
    },
    Match { received: Address, bits: usize },
}

#[derive(Debug, Clone)]
pub struct VirtualBus {
    devices: Vec<VirtualDevice>,
    shorted: bool,
    phase: RomPhase,
    /// Device selected by the last match, or every device after a skip.
    selected: Vec<usize>,
}

impl Default for VirtualBus {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualBus {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            shorted: false,
            phase: RomPhase::Idle,
            selected: Vec::new(),
        }
    }

    pub fn with_devices(addresses: &[Address]) -> Self {
        let mut bus = Self::new();
        for &address in addresses {
            bus.add_device(address);
        }
        bus
    }

    pub fn add_device(&mut self, address: Address) {
        if !self.devices.iter().any(|d| d.address == address) {
            self.devices.push(VirtualDevice {
                address,
                alarming: false,
            });
        }
    }

    pub fn remove_device(&mut self, address: Address) {
        self.devices.retain(|d| d.address != address);
        self.phase = RomPhase::Idle;
    }

    pub fn set_alarming(&mut self, address: Address, alarming: bool) {
        if let Some(device) = self.devices.iter_mut().find(|d| d.address == address) {
            device.alarming = alarming;
        }
    }

    pub fn set_shorted(&mut self, shorted: bool) {
        self.shorted = shorted;
    }

    pub fn devices(&self) -> &[VirtualDevice] {
        &self.devices
    }

    /// Addresses selected by the last match or skip command.
    pub fn selected(&self) -> Vec<Address> {
        self.selected
            .iter()
            .map(|&i| self.devices[i].address)
            .collect()
    }

    /// Reset pulse followed by the presence window.
    pub fn reset(&mut self) -> ResetResult {
        self.selected.clear();
        if self.shorted {
            self.phase = RomPhase::Idle;
            return ResetResult::Short;
        }
        if self.devices.is_empty() {
            self.phase = RomPhase::Idle;
            return ResetResult::NoPresence;
        }
        self.phase = RomPhase::Command { value: 0, bits: 0 };
        ResetResult::Presence
    }

    /// One time slot. `write` false pulls the line low for the whole slot;
    /// true releases it so devices may pull it low.
    pub fn touch_bit(&mut self, write: bool) -> bool {
        if self.shorted {
            return false;
        }
        let phase = std::mem::replace(&mut self.phase, RomPhase::Idle);
        let (line, next) = match phase {
            RomPhase::Idle => (write, RomPhase::Idle),
            RomPhase::Command { value, bits } => {
                let value = value | (u8::from(write) << bits);
                if bits + 1 < 8 {
                    (write, RomPhase::Command {
                        value,
                        bits: bits + 1,
                    })
                } else {
                    (write, self.start_rom_command(value))
                }
            }
            RomPhase::Search {
                index,
                slot,
                mut participants,
            } => match slot {
                SearchSlot::Bit => {
                    let line = write
                        && participants
                            .iter()
                            .all(|&d| self.devices[d].address.bit(index));
                    (line, RomPhase::Search {
                        index,
                        slot: SearchSlot::Complement,
                        participants,
                    })
                }
                SearchSlot::Complement => {
                    let line = write
                        && participants
                            .iter()
                            .all(|&d| !self.devices[d].address.bit(index));
                    (line, RomPhase::Search {
                        index,
                        slot: SearchSlot::Direction,
                        participants,
                    })
                }
                SearchSlot::Direction => {
                    participants.retain(|&d| self.devices[d].address.bit(index) == write);
                    if index + 1 < 64 {
                        (write, RomPhase::Search {
                            index: index + 1,
                            slot: SearchSlot::Bit,
                            participants,
                        })
                    } else {
                        self.selected = participants;
                        (write, RomPhase::Idle)
                    }
                }
            },
            RomPhase::Match {
                mut received,
                bits,
            } => {
                received.set_bit(bits, write);
                if bits + 1 < 64 {
                    (write, RomPhase::Match {
                        received,
                        bits: bits + 1,
                    })
                } else {
                    self.selected = self
                        .devices
                        .iter()
                        .position(|d| d.address == received)
                        .into_iter()
                        .collect();
                    (write, RomPhase::Idle)
                }
            }
        };
        self.phase = next;
        line
    }

    /// Eight slots, least significant bit first.
    pub fn touch_byte(&mut self, byte: u8) -> u8 {
        (0..8).fold(0u8, |acc, i| {
            let bit = self.touch_bit((byte >> i) & 0x01 == 0x01);
            acc | (u8::from(bit) << i)
        })
    }

    fn start_rom_command(&mut self, command: u8) -> RomPhase {
        trace!(command = %format!("0x{command:02X}"), "Virtual bus ROM command");
        match command {
            ROM_SEARCH | ROM_ALARM_SEARCH => {
                let participants = self
                    .devices
                    .iter()
                    .enumerate()
                    .filter(|(_, d)| command == ROM_SEARCH || d.alarming)
                    .map(|(i, _)| i)
                    .collect();
                RomPhase::Search {
                    index: 0,
                    slot: SearchSlot::Bit,
                    participants,
                }
            }
            ROM_MATCH => RomPhase::Match {
                received: Address::default(),
                bits: 0,
            },
            ROM_SKIP | ROM_OVERDRIVE_SKIP => {
                self.selected = (0..self.devices.len()).collect();
                RomPhase::Idle
            }
            _ => RomPhase::Idle,
        }
    }
}

impl SearchBus for VirtualBus {
    fn search_reset(&mut self) -> Result<bool> {
        Ok(self.reset().is_presence())
    }

    fn write_byte(&mut self, byte: u8) -> Result<()> {
        self.touch_byte(byte);
        Ok(())
    }

    fn read_bit(&mut self) -> Result<bool> {
        Ok(self.touch_bit(true))
    }

    fn write_bit(&mut self, bit: bool) -> Result<()> {
        self.touch_bit(bit);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_presence() {
        let mut bus = VirtualBus::new();
        assert_eq!(bus.reset(), ResetResult::NoPresence);
        bus.add_device(Address::with_crc(0x28, [1, 2, 3, 4, 5, 6]));
        assert_eq!(bus.reset(), ResetResult::Presence);
        bus.set_shorted(true);
        assert_eq!(bus.reset(), ResetResult::Short);
    }

    #[test]
    fn test_idle_bus_reads_ones() {
        let mut bus = VirtualBus::with_devices(&[Address::with_crc(0x28, [1, 2, 3, 4, 5, 6])]);
        bus.reset();
        bus.touch_byte(ROM_SKIP);
        assert_eq!(bus.touch_byte(0xFF), 0xFF);
        assert_eq!(bus.touch_byte(0x5A), 0x5A);
    }

    #[test]
    fn test_search_slots_follow_wired_and() {
        let a = Address::new([0b01, 0, 0, 0, 0, 0, 0, 0]);
        let b = Address::new([0b10, 0, 0, 0, 0, 0, 0, 0]);
        let mut bus = VirtualBus::with_devices(&[a, b]);
        bus.reset();
        bus.touch_byte(ROM_SEARCH);
        // bit 0 differs: both slots read zero
        assert!(!bus.touch_bit(true));
        assert!(!bus.touch_bit(true));
        bus.touch_bit(true);
        // only `a` remains, its bit 1 is zero
        assert!(!bus.touch_bit(true));
        assert!(bus.touch_bit(true));
    }

    #[test]
    fn test_match_rom_selects_one_device() {
        let a = Address::with_crc(0x10, [1, 1, 1, 1, 1, 1]);
        let b = Address::with_crc(0x10, [2, 2, 2, 2, 2, 2]);
        let mut bus = VirtualBus::with_devices(&[a, b]);
        bus.reset();
        bus.touch_byte(ROM_MATCH);
        for &byte in b.bytes() {
            bus.touch_byte(byte);
        }
        assert_eq!(bus.selected(), vec![b]);
    }

    #[test]
    fn test_removed_device_no_longer_answers() {
        let a = Address::with_crc(0x10, [1, 1, 1, 1, 1, 1]);
        let mut bus = VirtualBus::with_devices(&[a]);
        bus.remove_device(a);
        assert_eq!(bus.reset(), ResetResult::NoPresence);
        assert!(bus.devices().is_empty());
    }
}
