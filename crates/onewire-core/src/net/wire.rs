//! Primitive encodings used by the proxy protocol.
//!
//! Integers are big-endian `i32`, booleans one byte, strings a `u16`
//! big-endian length followed by UTF-8.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use super::constants::MAX_BLOCK_LEN;
use crate::crc::{crc16, crc16_with_seed};

pub trait WireRead: Read {
    fn read_i32_be(&mut self) -> io::Result<i32> {
        self.read_i32::<BigEndian>()
    }

    fn read_bool(&mut self) -> io::Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    fn read_utf(&mut self) -> io::Result<String> {
        let len = self.read_u16::<BigEndian>()? as usize;
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// A length prefix, rejected when negative or above [`MAX_BLOCK_LEN`].
    fn read_len(&mut self) -> io::Result<usize> {
        let len = self.read_i32_be()?;
        if len < 0 || len as usize > MAX_BLOCK_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("block length {len} out of range"),
            ));
        }
        Ok(len as usize)
    }

    fn read_bytes(&mut self, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl<R: Read + ?Sized> WireRead for R {}

pub trait WireWrite: Write {
    fn write_i32_be(&mut self, value: i32) -> io::Result<()> {
        self.write_i32::<BigEndian>(value)
    }

    fn write_bool(&mut self, value: bool) -> io::Result<()> {
        self.write_u8(u8::from(value))
    }

    fn write_utf(&mut self, value: &str) -> io::Result<()> {
        let bytes = value.as_bytes();
        let len = u16::try_from(bytes.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "string too long"))?;
        self.write_u16::<BigEndian>(len)?;
        self.write_all(bytes)
    }

    /// Length-prefixed byte block.
    fn write_block(&mut self, block: &[u8]) -> io::Result<()> {
        let len = i32::try_from(block.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "block too long"))?;
        self.write_i32_be(len)?;
        self.write_all(block)
    }
}

impl<W: Write + ?Sized> WireWrite for W {}

/// Answer to an authentication challenge: CRC16 of the challenge seeded
/// with the CRC16 of the shared secret.
pub fn auth_response(secret: &str, challenge: &[u8]) -> i32 {
    let seed = crc16(secret.as_bytes());
    i32::from(crc16_with_seed(challenge, seed))
}
