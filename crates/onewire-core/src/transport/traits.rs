//! Serial link abstraction.
//!
//! Defines the `SerialLink` trait the bridge adapters drive, allowing
//! different implementations (serialport, mock, chip emulators).

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No such serial port: {0}")]
    NoSuchPort(String),

    #[error("Failed to open port: {0}")]
    OpenFailed(String),

    #[error("Port not open")]
    NotOpen,

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Timeout: wanted {wanted} bytes, got {got}")]
    Timeout { wanted: usize, got: usize },

    #[error("Port control failed: {0}")]
    Control(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read deadline for `len` bytes: 20 ms per byte plus 800 ms of slack.
pub fn read_timeout_for(len: usize) -> Duration {
    Duration::from_millis(len as u64 * 20 + 800)
}

/// Abstract serial port interface.
///
/// Implementations:
/// - `SerialPortLink` for real hardware
/// - `MockLink` for scripted unit tests
/// - `Ds2480Emulator` / `Ds9097Emulator` for full-stack tests
pub trait SerialLink: Send {
    /// Name the port was opened with.
    fn port_name(&self) -> &str;

    fn open(&mut self) -> Result<(), TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    fn baud_rate(&self) -> u32;

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError>;

    /// Push out pending writes and discard anything still unread.
    fn flush(&mut self) -> Result<(), TransportError>;

    fn send_break(&mut self, duration: Duration) -> Result<(), TransportError>;

    fn set_dtr(&mut self, level: bool) -> Result<(), TransportError>;

    fn set_rts(&mut self, level: bool) -> Result<(), TransportError>;

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Read exactly `len` bytes, failing if they do not all arrive in time.
    fn read_with_timeout(&mut self, len: usize, timeout: Duration)
    -> Result<Vec<u8>, TransportError>;

    /// Read with the default per-length deadline.
    fn read_exact_default(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        self.read_with_timeout(len, read_timeout_for(len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_timeout_scales_with_length() {
        assert_eq!(read_timeout_for(0), Duration::from_millis(800));
        assert_eq!(read_timeout_for(16), Duration::from_millis(1120));
    }
}
