//! serialport-based link implementation.

use std::io::{Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, instrument};

use super::traits::{SerialLink, TransportError};

/// Initial baud rate every bridge adapter starts at.
const DEFAULT_BAUD: u32 = 9600;

/// Real serial port. Opened lazily by `open()`.
pub struct SerialPortLink {
    name: String,
    port: Option<Box<dyn SerialPort>>,
    baud: u32,
}

impl SerialPortLink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port: None,
            baud: DEFAULT_BAUD,
        }
    }

    /// Names of the serial ports present on this machine.
    pub fn available_ports() -> Result<Vec<String>, TransportError> {
        let ports = serialport::available_ports()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        self.port.as_mut().ok_or(TransportError::NotOpen)
    }
}

fn control_error(e: serialport::Error) -> TransportError {
    TransportError::Control(e.to_string())
}

impl SerialLink for SerialPortLink {
    fn port_name(&self) -> &str {
        &self.name
    }

    #[instrument(level = "debug", skip(self), fields(port = %self.name))]
    fn open(&mut self) -> Result<(), TransportError> {
        if self.port.is_some() {
            return Ok(());
        }
        let port = serialport::new(&self.name, self.baud)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => TransportError::NoSuchPort(self.name.clone()),
                _ => TransportError::OpenFailed(e.to_string()),
            })?;
        debug!("Serial port opened");
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.port = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        self.port()?.set_baud_rate(baud).map_err(control_error)?;
        self.baud = baud;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        let port = self.port()?;
        port.flush()?;
        port.clear(ClearBuffer::Input).map_err(control_error)
    }

    fn send_break(&mut self, duration: Duration) -> Result<(), TransportError> {
        let port = self.port()?;
        port.set_break().map_err(control_error)?;
        thread::sleep(duration);
        port.clear_break().map_err(control_error)
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), TransportError> {
        self.port()?
            .write_data_terminal_ready(level)
            .map_err(control_error)
    }

    fn set_rts(&mut self, level: bool) -> Result<(), TransportError> {
        self.port()?.write_request_to_send(level).map_err(control_error)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let port = self.port()?;
        port.write_all(data)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        port.flush()?;
        Ok(())
    }

    fn read_with_timeout(
        &mut self,
        len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let port = self.port()?;
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; len];
        let mut got = 0;
        while got < len {
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout { wanted: len, got });
            }
            port.set_timeout(deadline - now).map_err(control_error)?;
            match port.read(&mut buf[got..]) {
                Ok(0) => thread::sleep(Duration::from_millis(1)),
                Ok(n) => got += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(TransportError::Timeout { wanted: len, got });
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(buf)
    }
}
