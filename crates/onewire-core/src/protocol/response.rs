//! Interpretation of the chip's response stream.
//!
//! Pure functions over response bytes at offsets recorded by the builder.

use super::constants::*;
use crate::address::Address;
use crate::state::link::{LinkState, ResetResult};
use crate::state::transport::TransportState;

/// Bit `index` of a little-endian bit array.
pub(crate) fn bit_read(buf: &[u8], index: usize) -> bool {
    buf[index / 8] & (1 << (index % 8)) != 0
}

pub(crate) fn bit_write(buf: &mut [u8], index: usize, value: bool) {
    if value {
        buf[index / 8] |= 1 << (index % 8);
    } else {
        buf[index / 8] &= !(1 << (index % 8));
    }
}

/// Decode a reset response, updating revision, program voltage and the
/// alarm long check.
pub fn interpret_reset(state: &mut TransportState, response: u8) -> ResetResult {
    if response & RESET_RESPONSE_MARK != RESET_RESPONSE_MARK {
        return ResetResult::NoPresence;
    }
    state.chip_revision = response & CHIP_VERSION_MASK;
    state.program_voltage_available = response & PROGRAM_VOLTAGE_MASK != 0;

    match response & RESET_MASK {
        RESET_SHORT => ResetResult::Short,
        RESET_PRESENCE => {
            state.note_presence();
            ResetResult::Presence
        }
        RESET_ALARM => {
            state.note_alarm();
            ResetResult::Alarm
        }
        _ => ResetResult::NoPresence,
    }
}

pub fn interpret_bit(response: u8) -> bool {
    response & BIT_RESPONSE_MASK == BIT_RESPONSE_MASK
}

/// Reassemble a byte from eight bit responses, least significant first.
pub fn interpret_primed_byte(responses: &[u8]) -> u8 {
    responses
        .iter()
        .take(8)
        .fold(0u8, |acc, &r| (acc >> 1) | if interpret_bit(r) { 0x80 } else { 0 })
}

/// Direction bits for the search accelerator.
///
/// Bit `2i+1` carries the direction for address bit `i`: the previous
/// address below `last_discrepancy`, a one at it, zeros above.
pub fn search_sequence(link: &LinkState) -> [u8; SEARCH_BLOCK_LEN] {
    let mut sequence = [0u8; SEARCH_BLOCK_LEN];
    let last = link.last_discrepancy as usize;
    for i in 0..64 {
        if i + 1 < last {
            bit_write(&mut sequence, i * 2 + 1, link.address.bit(i));
        } else if i + 1 == last {
            bit_write(&mut sequence, i * 2 + 1, true);
        }
    }
    sequence
}

/// Decode the 16 accelerator bytes into `link`.
///
/// Returns false (leaving `link` untouched) when the address fails its CRC,
/// has a zero family, or the pass looks incomplete.
pub fn interpret_search(link: &mut LinkState, responses: &[u8]) -> bool {
    if responses.len() < SEARCH_BLOCK_LEN {
        return false;
    }
    let mut id = [0u8; 8];
    let mut last_zero: Option<u8> = None;
    let mut family_zero = 0u8;
    for i in 0..64 {
        let chosen = bit_read(responses, i * 2 + 1);
        bit_write(&mut id, i, chosen);
        if bit_read(responses, i * 2) && !chosen {
            last_zero = Some(i as u8 + 1);
            if i < 8 {
                family_zero = i as u8 + 1;
            }
        }
    }

    let address = Address::new(id);
    if !address.is_valid() || last_zero == Some(63) {
        return false;
    }

    match last_zero {
        Some(position) if position != link.last_discrepancy => {
            link.last_discrepancy = position;
            link.is_last_device = false;
        }
        _ => {
            link.last_discrepancy = 0;
            link.is_last_device = true;
        }
    }
    link.last_family_discrepancy = family_zero;
    link.address = address;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build the accelerator response for a bus holding `devices`, walking
    /// the directions encoded in `sequence` the way the chip does.
    fn accelerate(devices: &[Address], sequence: &[u8; 16]) -> [u8; 16] {
        let mut out = [0u8; 16];
        let mut active: Vec<Address> = devices.to_vec();
        for i in 0..64 {
            let any_zero = active.iter().any(|a| !a.bit(i));
            let any_one = active.iter().any(|a| a.bit(i));
            let (flag, dir) = match (any_zero, any_one) {
                (true, true) => (true, bit_read(sequence, i * 2 + 1)),
                (true, false) => (false, false),
                (false, true) => (false, true),
                (false, false) => (true, true),
            };
            bit_write(&mut out, i * 2, flag);
            bit_write(&mut out, i * 2 + 1, dir);
            active.retain(|a| a.bit(i) == dir);
        }
        out
    }

    #[test]
    fn test_reset_decoding() {
        let mut state = TransportState::default();
        assert_eq!(interpret_reset(&mut state, 0xCD), ResetResult::Presence);
        assert_eq!(state.chip_revision, 0x0C);
        assert!(!state.program_voltage_available);

        assert_eq!(interpret_reset(&mut state, 0xEF), ResetResult::NoPresence);
        assert!(state.program_voltage_available);

        assert_eq!(interpret_reset(&mut state, 0xCC), ResetResult::Short);
        assert_eq!(interpret_reset(&mut state, 0xCE), ResetResult::Alarm);
        assert!(state.long_alarm_check);
    }

    #[test]
    fn test_malformed_reset_is_no_presence() {
        let mut state = TransportState::default();
        assert_eq!(interpret_reset(&mut state, 0x4D), ResetResult::NoPresence);
        assert_eq!(state.chip_revision, 0);
    }

    #[test]
    fn test_bit_decoding() {
        assert!(interpret_bit(0x93));
        assert!(!interpret_bit(0x90));
        assert!(!interpret_bit(0x91));
    }

    #[test]
    fn test_primed_byte() {
        let responses = [0x93, 0x90, 0x93, 0x90, 0x90, 0x90, 0x90, 0x93];
        assert_eq!(interpret_primed_byte(&responses), 0x85);
    }

    #[test]
    fn test_search_sequence_biases_toward_previous_path() {
        let link = LinkState {
            address: Address::new([0xFF, 0, 0, 0, 0, 0, 0, 0]),
            last_discrepancy: 4,
            ..LinkState::default()
        };
        let sequence = search_sequence(&link);
        // bits 0..2 replay the address, bit 3 forced to one, rest zero
        assert_eq!(sequence[0], 0b1010_1010);
        assert!(sequence[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_single_device_search_is_last() {
        let device = Address::with_crc(0x28, [0x10, 0x20, 0x30, 0x40, 0x50, 0x60]);
        let mut link = LinkState::default();
        let response = accelerate(&[device], &search_sequence(&link));
        assert!(interpret_search(&mut link, &response));
        assert_eq!(link.address, device);
        assert!(link.is_last_device);
    }

    #[test]
    fn test_accelerated_enumeration_visits_all() {
        let devices = [
            Address::with_crc(0x01, [2, 3, 4, 5, 6, 7]),
            Address::with_crc(0x10, [2, 3, 4, 5, 6, 7]),
            Address::with_crc(0x01, [2, 3, 4, 5, 6, 8]),
        ];
        let mut link = LinkState::default();
        let mut found = Vec::new();
        while !link.is_last_device {
            let response = accelerate(&devices, &search_sequence(&link));
            assert!(interpret_search(&mut link, &response));
            found.push(link.address);
        }
        found.sort();
        let mut expected = devices.to_vec();
        expected.sort();
        assert_eq!(found, expected);
    }

    #[test]
    fn test_empty_bus_search_is_invalid() {
        let mut link = LinkState::default();
        let response = accelerate(&[], &search_sequence(&link));
        assert!(!interpret_search(&mut link, &response));
        assert_eq!(link.address, Address::default());
    }

    #[test]
    fn test_corrupted_crc_is_invalid() {
        let mut bytes = *Address::with_crc(0x28, [1, 2, 3, 4, 5, 6]).bytes();
        bytes[7] ^= 0x04;
        let mut link = LinkState::default();
        let response = accelerate(&[Address::new(bytes)], &search_sequence(&link));
        assert!(!interpret_search(&mut link, &response));
    }
}
