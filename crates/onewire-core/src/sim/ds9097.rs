//! Passive bit-bang adapter model: every UART byte at 115200 baud is one
//! time slot on the bus.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::bus::VirtualBus;
use crate::sync::lock;
use crate::transport::{SerialLink, TransportError};

/// Echo of an untouched reset break; anything else means presence.
pub const BREAK_ECHO_IDLE: u8 = 0xF0;
pub const BREAK_ECHO_PRESENCE: u8 = 0xE0;

#[derive(Debug)]
struct State {
    open: bool,
    baud: u32,
    output: VecDeque<u8>,
    connected: bool,
}

#[derive(Clone)]
pub struct Ds9097Emulator {
    bus: Arc<Mutex<VirtualBus>>,
    state: Arc<Mutex<State>>,
}

impl Ds9097Emulator {
    pub fn new(bus: VirtualBus) -> Self {
        Self {
            bus: Arc::new(Mutex::new(bus)),
            state: Arc::new(Mutex::new(State {
                open: false,
                baud: 9600,
                output: VecDeque::new(),
                connected: true,
            })),
        }
    }

    pub fn bus(&self) -> Arc<Mutex<VirtualBus>> {
        Arc::clone(&self.bus)
    }

    /// Simulate pulling the adapter off the port: nothing echoes any more.
    pub fn unplug(&self) {
        lock(&self.state).connected = false;
    }
}

impl SerialLink for Ds9097Emulator {
    fn port_name(&self) -> &str {
        "DS9097-SIM"
    }

    fn open(&mut self) -> Result<(), TransportError> {
        lock(&self.state).open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        lock(&self.state).open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    fn baud_rate(&self) -> u32 {
        lock(&self.state).baud
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        lock(&self.state).baud = baud;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        lock(&self.state).output.clear();
        Ok(())
    }

    fn send_break(&mut self, _duration: Duration) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        if !state.connected {
            return Ok(());
        }
        let presence = lock(&self.bus).reset().is_presence();
        state.output.push_back(if presence {
            BREAK_ECHO_PRESENCE
        } else {
            BREAK_ECHO_IDLE
        });
        Ok(())
    }

    fn set_dtr(&mut self, _level: bool) -> Result<(), TransportError> {
        Ok(())
    }

    fn set_rts(&mut self, _level: bool) -> Result<(), TransportError> {
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        if !state.connected {
            return Ok(());
        }
        let mut bus = lock(&self.bus);
        for &byte in data {
            let echo = if byte == 0xFF {
                if bus.touch_bit(true) { 0xFF } else { 0xFE }
            } else {
                bus.touch_bit(false);
                byte
            };
            state.output.push_back(echo);
        }
        Ok(())
    }

    fn read_with_timeout(
        &mut self,
        len: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut state = lock(&self.state);
        if state.output.len() < len {
            let got = state.output.len();
            state.output.clear();
            return Err(TransportError::Timeout { wanted: len, got });
        }
        Ok(state.output.drain(..len).collect())
    }
}
