//! Packet builder for the bridge-chip byte protocol.
//!
//! Each primitive appends its wire bytes to the current packet and returns
//! the offset its answer will have in the concatenated response stream.
//! Packets are sealed at streaming boundaries and moved into the queue, so
//! the builder never aliases a packet that is already queued.

use super::constants::*;
use super::response::search_sequence;
use crate::state::link::LinkState;
use crate::state::transport::TransportState;

/// One write/read unit of a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    pub bytes: Vec<u8>,
    pub expected_response_len: usize,
}

impl Packet {
    /// An empty sealed packet asks the transaction to pause and flush so
    /// the chip can settle after an alarm presence.
    pub fn is_settle(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Builds the packet queue for one operation.
pub struct PacketBuilder<'a> {
    state: &'a mut TransportState,
    current: Packet,
    queue: Vec<Packet>,
    total_response_len: usize,
}

impl<'a> PacketBuilder<'a> {
    pub fn new(state: &'a mut TransportState) -> Self {
        Self {
            state,
            current: Packet::default(),
            queue: Vec::new(),
            total_response_len: 0,
        }
    }

    /// Read-only view of the chip state being built against.
    pub fn state(&self) -> &TransportState {
        self.state
    }

    pub fn total_response_len(&self) -> usize {
        self.total_response_len
    }

    /// Move the current packet into the queue and start a fresh one.
    pub fn seal(&mut self) {
        let packet = std::mem::take(&mut self.current);
        self.queue.push(packet);
    }

    /// Seal whatever is pending and hand over the queue.
    pub fn finish(mut self) -> Vec<Packet> {
        if !self.current.bytes.is_empty() {
            self.seal();
        }
        self.queue
    }

    fn expect_response(&mut self, count: usize) -> usize {
        let offset = self.total_response_len;
        self.total_response_len += count;
        self.current.expected_response_len += count;
        offset
    }

    fn seal_if_full(&mut self) {
        if self.current.bytes.len() > MAX_BYTES_STREAMED {
            self.seal();
        }
    }

    pub fn set_to_command_mode(&mut self) {
        if !self.state.in_command_mode {
            self.current.bytes.push(MODE_COMMAND);
            self.state.in_command_mode = true;
        }
    }

    pub fn set_to_data_mode(&mut self) {
        if self.state.in_command_mode {
            self.current.bytes.push(MODE_DATA);
            self.state.in_command_mode = false;
        }
    }

    /// Bus reset at the current speed.
    pub fn reset(&mut self) -> usize {
        self.set_to_command_mode();
        self.current
            .bytes
            .push(FUNCTION_RESET | self.state.speed_mode);
        let offset = self.expect_response(1);
        if !self.state.stream_resets {
            self.seal();
        }
        if self.state.long_alarm_check
            && matches!(self.state.speed_mode, USPEED_REGULAR | USPEED_FLEX)
        {
            self.seal();
        }
        offset
    }

    /// Data-mode bytes; each produces one echo byte.
    pub fn data_bytes(&mut self, bytes: &[u8]) -> usize {
        self.set_to_data_mode();
        let offset = self.total_response_len;
        for &byte in bytes {
            self.current.bytes.push(byte);
            if self.state.needs_escape(byte) {
                self.current.bytes.push(byte);
            }
            self.expect_response(1);
            if self.current.bytes.len() > MAX_BYTES_STREAMED || !self.state.stream_bytes {
                self.seal();
            }
        }
        offset
    }

    pub fn data_byte(&mut self, byte: u8) -> usize {
        self.data_bytes(&[byte])
    }

    /// A byte sent as eight bit commands, the last one priming the strong
    /// pull-up. Returns the offset of the first bit response.
    pub fn primed_data_byte(&mut self, byte: u8) -> usize {
        let mut start = 0;
        for i in 0..8 {
            let offset = self.data_bit((byte >> i) & 0x01 == 0x01, i == 7);
            if i == 0 {
                start = offset;
            }
        }
        start
    }

    /// Single time slot, optionally arming strong pull-up after it.
    pub fn data_bit(&mut self, bit: bool, strong_5v: bool) -> usize {
        self.set_to_command_mode();
        let mut command = FUNCTION_BIT | self.state.speed_mode;
        if bit {
            command |= BIT_ONE;
        }
        if strong_5v {
            command |= PRIME_5V;
        }
        self.current.bytes.push(command);
        let offset = self.expect_response(1);
        if self.current.bytes.len() > MAX_BYTES_STREAMED || !self.state.stream_bits {
            self.seal();
        }
        offset
    }

    /// Accelerated search pass continuing from `link`'s cursor.
    pub fn search(&mut self, link: &LinkState) -> usize {
        self.set_to_command_mode();
        self.current
            .bytes
            .push(FUNCTION_SEARCH_ON | self.state.speed_mode);
        self.set_to_data_mode();
        let sequence = search_sequence(link);
        for &byte in &sequence {
            self.current.bytes.push(byte);
            if self.state.needs_escape(byte) {
                self.current.bytes.push(byte);
            }
        }
        self.set_to_command_mode();
        self.current
            .bytes
            .push(FUNCTION_SEARCH_OFF | self.state.speed_mode);
        let offset = self.expect_response(SEARCH_BLOCK_LEN);
        if !self.state.stream_searches {
            self.seal();
        }
        offset
    }

    /// Push the current speed bits to the chip without a response.
    pub fn set_speed(&mut self) {
        self.set_to_command_mode();
        self.current
            .bytes
            .push(FUNCTION_SEARCH_OFF | self.state.speed_mode);
    }

    pub fn get_parameter(&mut self, parameter: u8) -> usize {
        self.set_to_command_mode();
        self.current.bytes.push(CONFIG_MASK | (parameter >> 3));
        let offset = self.expect_response(1);
        self.seal_if_full();
        offset
    }

    pub fn set_parameter(&mut self, parameter: u8, value: u8) -> usize {
        self.set_to_command_mode();
        self.current.bytes.push(CONFIG_MASK | parameter | value);
        let offset = self.expect_response(1);
        self.seal_if_full();
        offset
    }

    /// Raw command byte. The returned offset is only meaningful when
    /// `expect_response` is set.
    pub fn send_command(&mut self, command: u8, expect_response: bool) -> usize {
        self.set_to_command_mode();
        self.current.bytes.push(command);
        let offset = if expect_response {
            self.expect_response(1)
        } else {
            self.total_response_len
        };
        self.seal_if_full();
        offset
    }
}
