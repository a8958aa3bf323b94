//! Discrepancy search over raw time slots, plus the family-filter loop
//! shared by every adapter.
//!
//! [`search_pass`] walks the 64 bit pairs one slot at a time for adapters
//! without a search accelerator. [`find_next`] wraps any single-pass
//! search (software or accelerated) with the include/exclude filters.

use tracing::trace;

use crate::address::Address;
use crate::error::Result;
use crate::protocol::constants::{ROM_ALARM_SEARCH, ROM_SEARCH};
use crate::protocol::response::{bit_read, bit_write};
use crate::state::link::LinkState;

/// Bit-level bus access needed by a software search.
pub trait SearchBus {
    /// Reset the bus; true when at least one device answered.
    fn search_reset(&mut self) -> Result<bool>;

    fn write_byte(&mut self, byte: u8) -> Result<()>;

    /// Read slot.
    fn read_bit(&mut self) -> Result<bool>;

    fn write_bit(&mut self, bit: bool) -> Result<()>;
}

/// One search pass continuing from `link`'s cursor.
///
/// Returns false on an empty bus, a broken bit pair, or a CRC failure; the
/// cursor's `last_discrepancy` is cleared in that case.
pub fn search_pass<B: SearchBus + ?Sized>(bus: &mut B, link: &mut LinkState) -> Result<bool> {
    if !link.skip_reset_on_search && !bus.search_reset()? {
        link.last_discrepancy = 0;
        return Ok(false);
    }
    bus.write_byte(if link.search_alarm_only {
        ROM_ALARM_SEARCH
    } else {
        ROM_SEARCH
    })?;

    let mut id = link.address;
    let mut last_zero = 0u8;
    let mut family_zero = 0u8;

    for i in 0..64 {
        let position = i as u8 + 1;
        let bit = bus.read_bit()?;
        let complement = bus.read_bit()?;
        let direction = match (bit, complement) {
            (true, true) => {
                trace!(position, "No device answered search slot");
                link.last_discrepancy = 0;
                return Ok(false);
            }
            (true, false) => true,
            (false, true) => false,
            (false, false) => {
                let direction = if position < link.last_discrepancy {
                    id.bit(i)
                } else {
                    position == link.last_discrepancy
                };
                if !direction {
                    last_zero = position;
                    if position < 9 {
                        family_zero = position;
                    }
                }
                direction
            }
        };
        id.set_bit(i, direction);
        bus.write_bit(direction)?;
    }

    if !id.is_valid() {
        trace!(address = %id, "Search result failed CRC");
        link.last_discrepancy = 0;
        return Ok(false);
    }

    link.address = id;
    link.last_discrepancy = last_zero;
    link.last_family_discrepancy = family_zero;
    link.is_last_device = last_zero == 0;
    Ok(true)
}

/// Advance the enumeration to the next device that passes the filters.
///
/// `pass` performs one raw search from the cursor. With a single include
/// family and a fresh cursor the walk is seeded at that family; a filtered
/// device makes the cursor skip the rest of its family.
pub fn find_next<F>(link: &mut LinkState, mut pass: F) -> Result<bool>
where
    F: FnMut(&mut LinkState) -> Result<bool>,
{
    if link.is_last_device {
        link.reset_search();
        return Ok(false);
    }

    if link.is_fresh_search() && link.include_families.len() == 1 {
        link.last_discrepancy = 64;
        link.address = Address::new([link.include_families[0], 0, 0, 0, 0, 0, 0, 0]);
    }

    loop {
        if !pass(link)? {
            link.reset_search();
            return Ok(false);
        }
        if link.accepts_family(link.address.family()) {
            return Ok(true);
        }
        trace!(address = %link.address, "Skipping filtered family");
        if !link.is_last_device && link.last_family_discrepancy != 0 {
            link.last_discrepancy = link.last_family_discrepancy;
            link.last_family_discrepancy = 0;
        } else {
            link.reset_search();
            return Ok(false);
        }
    }
}

/// Restart the enumeration and return whether a first device was found.
pub fn find_first<F>(link: &mut LinkState, pass: F) -> Result<bool>
where
    F: FnMut(&mut LinkState) -> Result<bool>,
{
    link.reset_search();
    find_next(link, pass)
}

/// Search slots for walking straight to `address` in one block.
///
/// Each of the 64 triplets is read, read-complement, then the address bit;
/// send it after a search ROM command and hand the echo to
/// [`triplets_confirm`].
pub fn presence_triplets(address: Address) -> [u8; 24] {
    let mut triplets = [0xFFu8; 24];
    for i in 0..64 {
        bit_write(&mut triplets, (i + 1) * 3 - 1, address.bit(i));
    }
    triplets
}

/// Whether the echoed triplets show `address` answering to the end.
///
/// Only the final eight triplets decide; a broken pair anywhere in them
/// means nobody was left on the bus.
pub fn triplets_confirm(triplets: &[u8; 24], address: Address) -> bool {
    let mut good_bits = 0;
    for (n, i) in (168..192).step_by(3).enumerate() {
        let read = bit_read(triplets, i);
        let complement = bit_read(triplets, i + 1);
        if read && complement {
            return false;
        }
        let expected = address.bit(56 + n);
        if (expected && read && !complement) || (!expected && !read && complement) {
            good_bits += 1;
        }
    }
    good_bits >= 8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::VirtualBus;

    fn three_devices() -> Vec<Address> {
        vec![
            Address::with_crc(0x01, [2, 3, 4, 5, 6, 7]),
            Address::with_crc(0x10, [2, 3, 4, 5, 6, 7]),
            Address::with_crc(0x01, [2, 3, 4, 5, 6, 8]),
        ]
    }

    fn enumerate(bus: &mut VirtualBus, link: &mut LinkState) -> Vec<Address> {
        let mut found = Vec::new();
        let mut more = find_first(link, |l| search_pass(bus, l)).unwrap();
        while more {
            found.push(link.address);
            more = find_next(link, |l| search_pass(bus, l)).unwrap();
        }
        found
    }

    fn sorted(mut addresses: Vec<Address>) -> Vec<Address> {
        addresses.sort();
        addresses
    }

    #[test]
    fn test_enumerates_every_device_once() {
        let devices = three_devices();
        let mut bus = VirtualBus::with_devices(&devices);
        let mut link = LinkState::new();
        let found = enumerate(&mut bus, &mut link);
        assert_eq!(found.len(), 3);
        assert_eq!(sorted(found), sorted(devices));
    }

    #[test]
    fn test_restart_reproduces_order() {
        let mut bus = VirtualBus::with_devices(&three_devices());
        let mut link = LinkState::new();
        let first = enumerate(&mut bus, &mut link);
        let second = enumerate(&mut bus, &mut link);
        assert_eq!(first, second);
    }

    #[test]
    fn test_exhausted_search_returns_false_then_restarts() {
        let mut bus = VirtualBus::with_devices(&three_devices()[..1]);
        let mut link = LinkState::new();
        assert!(find_first(&mut link, |l| search_pass(&mut bus, l)).unwrap());
        assert!(link.is_last_device);
        assert!(!find_next(&mut link, |l| search_pass(&mut bus, l)).unwrap());
        assert!(link.is_fresh_search());
        assert!(find_next(&mut link, |l| search_pass(&mut bus, l)).unwrap());
    }

    #[test]
    fn test_include_filter() {
        let mut bus = VirtualBus::with_devices(&three_devices());
        let mut link = LinkState::new();
        link.target_families(&[0x01]);
        let found = enumerate(&mut bus, &mut link);
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|a| a.family() == 0x01));
    }

    #[test]
    fn test_exclude_filter_is_complement() {
        let mut bus = VirtualBus::with_devices(&three_devices());
        let mut link = LinkState::new();
        link.exclude_families(&[0x01]);
        let found = enumerate(&mut bus, &mut link);
        assert_eq!(found, vec![Address::with_crc(0x10, [2, 3, 4, 5, 6, 7])]);
    }

    #[test]
    fn test_multiple_include_families() {
        let mut devices = three_devices();
        devices.push(Address::with_crc(0x28, [9, 9, 9, 9, 9, 9]));
        let mut bus = VirtualBus::with_devices(&devices);
        let mut link = LinkState::new();
        link.target_families(&[0x10, 0x28]);
        let found = sorted(enumerate(&mut bus, &mut link));
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|a| a.family() == 0x10 || a.family() == 0x28));
    }

    #[test]
    fn test_empty_bus() {
        let mut bus = VirtualBus::new();
        let mut link = LinkState::new();
        assert!(!find_first(&mut link, |l| search_pass(&mut bus, l)).unwrap());
        assert_eq!(link.last_discrepancy, 0);
    }

    #[test]
    fn test_alarm_search_only_returns_alarming() {
        let devices = three_devices();
        let mut bus = VirtualBus::with_devices(&devices);
        bus.set_alarming(devices[2], true);
        let mut link = LinkState::new();
        link.set_search_only_alarming();
        assert_eq!(enumerate(&mut bus, &mut link), vec![devices[2]]);
    }

    #[test]
    fn test_seeded_cursor_finds_exact_target() {
        let devices = three_devices();
        let mut bus = VirtualBus::with_devices(&devices);
        let mut probe = LinkState::new().seeded_for(devices[1]);
        assert!(search_pass(&mut bus, &mut probe).unwrap());
        assert_eq!(probe.address, devices[1]);

        let absent = Address::with_crc(0x10, [2, 3, 4, 5, 6, 9]);
        let mut probe = LinkState::new().seeded_for(absent);
        let found = search_pass(&mut bus, &mut probe).unwrap();
        assert!(!found || probe.address != absent);
    }

    #[test]
    fn test_corrupt_device_reports_invalid() {
        let mut bytes = *Address::with_crc(0x28, [1, 2, 3, 4, 5, 6]).bytes();
        bytes[7] ^= 0x01;
        let mut bus = VirtualBus::with_devices(&[Address::new(bytes)]);
        let mut link = LinkState::new();
        link.last_discrepancy = 5;
        assert!(!search_pass(&mut bus, &mut link).unwrap());
        assert_eq!(link.last_discrepancy, 0);
    }

    #[test]
    fn test_triplet_block_against_virtual_bus() {
        let devices = three_devices();
        let mut bus = VirtualBus::with_devices(&devices);
        let probe = |bus: &mut VirtualBus, address: Address| {
            bus.reset();
            bus.touch_byte(ROM_SEARCH);
            let mut triplets = presence_triplets(address);
            for byte in triplets.iter_mut() {
                *byte = bus.touch_byte(*byte);
            }
            triplets_confirm(&triplets, address)
        };
        assert!(probe(&mut bus, devices[2]));
        assert!(!probe(&mut bus, Address::with_crc(0x01, [2, 3, 4, 5, 6, 9])));
    }
}
