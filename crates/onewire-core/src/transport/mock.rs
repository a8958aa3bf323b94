//! Mock serial link for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{SerialLink, TransportError};
use crate::sync::lock;

/// Control-line and framing activity recorded by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    Baud(u32),
    Break,
    Dtr(bool),
    Rts(bool),
    Flush,
}

/// Scripted link for unit-testing adapter logic byte by byte.
///
/// Handles are cheap clones sharing the same queues, so a test can keep one
/// while the adapter owns another.
#[derive(Clone)]
pub struct MockLink {
    /// Bytes returned by subsequent reads, in order.
    responses: Arc<Mutex<VecDeque<u8>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Captured control actions.
    actions: Arc<Mutex<Vec<LinkAction>>>,
    /// Whether the port is "plugged in".
    connected: Arc<Mutex<bool>>,
    open: bool,
    baud: u32,
}

impl MockLink {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            actions: Arc::new(Mutex::new(Vec::new())),
            connected: Arc::new(Mutex::new(true)),
            open: false,
            baud: 9600,
        }
    }

    /// Queue bytes to be returned on following reads.
    pub fn queue_response(&self, bytes: &[u8]) {
        lock(&self.responses).extend(bytes.iter().copied());
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        lock(&self.write_log).clone()
    }

    /// All writes concatenated.
    pub fn written_bytes(&self) -> Vec<u8> {
        self.get_writes().concat()
    }

    pub fn clear_writes(&self) {
        lock(&self.write_log).clear();
    }

    pub fn get_actions(&self) -> Vec<LinkAction> {
        lock(&self.actions).clone()
    }

    /// Simulate the adapter being unplugged.
    pub fn disconnect(&self) {
        *lock(&self.connected) = false;
    }

    pub fn reconnect(&self) {
        *lock(&self.connected) = true;
    }

    fn check(&self) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        if !*lock(&self.connected) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock link disconnected",
            )));
        }
        Ok(())
    }

    fn record(&self, action: LinkAction) {
        lock(&self.actions).push(action);
    }
}

impl Default for MockLink {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialLink for MockLink {
    fn port_name(&self) -> &str {
        "MOCK0"
    }

    fn open(&mut self) -> Result<(), TransportError> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        self.check()?;
        self.baud = baud;
        self.record(LinkAction::Baud(baud));
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        self.check()?;
        self.record(LinkAction::Flush);
        Ok(())
    }

    fn send_break(&mut self, _duration: Duration) -> Result<(), TransportError> {
        self.check()?;
        self.record(LinkAction::Break);
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), TransportError> {
        self.check()?;
        self.record(LinkAction::Dtr(level));
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<(), TransportError> {
        self.check()?;
        self.record(LinkAction::Rts(level));
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.check()?;
        lock(&self.write_log).push(data.to_vec());
        Ok(())
    }

    fn read_with_timeout(
        &mut self,
        len: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        self.check()?;
        let mut queue = lock(&self.responses);
        if queue.len() < len {
            let got = queue.len();
            queue.clear();
            return Err(TransportError::Timeout { wanted: len, got });
        }
        Ok(queue.drain(..len).collect())
    }
}
