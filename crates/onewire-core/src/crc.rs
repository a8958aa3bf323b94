//! CRC utilities used on the 1-Wire bus.
//!
//! - CRC8 (polynomial X^8 + X^5 + X^4 + 1, reflected `0x8C`) protects every
//!   64-bit device address.
//! - CRC16 (polynomial X^16 + X^15 + X^2 + 1, reflected `0xA001`) protects
//!   memory pages and doubles as the proxy challenge digest.
//!
//! Both are plain functions over byte slices; the seeded forms let callers
//! chain a digest across several buffers.

const CRC8_TABLE: [u8; 256] = build_crc8_table();
const CRC16_TABLE: [u16; 256] = build_crc16_table();

const fn build_crc8_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x01 != 0 {
                (crc >> 1) ^ 0x8C
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const fn build_crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x0001 != 0 {
                (crc >> 1) ^ 0xA001
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC8 of `data` starting from `seed`.
pub fn crc8_with_seed(data: &[u8], seed: u8) -> u8 {
    data.iter()
        .fold(seed, |crc, &byte| CRC8_TABLE[(crc ^ byte) as usize])
}

/// CRC8 of `data` starting from zero.
pub fn crc8(data: &[u8]) -> u8 {
    crc8_with_seed(data, 0)
}

/// True when the last byte of `sequence` is the CRC8 of the bytes before it.
pub fn crc8_is_valid(sequence: &[u8]) -> bool {
    !sequence.is_empty() && crc8(sequence) == 0
}

/// CRC16 of `data` starting from `seed`.
pub fn crc16_with_seed(data: &[u8], seed: u16) -> u16 {
    data.iter().fold(seed, |crc, &byte| {
        (crc >> 8) ^ CRC16_TABLE[((crc ^ byte as u16) & 0xFF) as usize]
    })
}

/// CRC16 of `data` starting from zero.
pub fn crc16(data: &[u8]) -> u16 {
    crc16_with_seed(data, 0)
}
