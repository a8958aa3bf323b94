//! Bridge-chip state shared by every session on one port.

use std::fmt;

use crate::error::{OneWireError, Result};
use crate::protocol::constants::*;
use crate::state::link::Speed;

/// UART speed between host and chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum BaudRate {
    #[default]
    B9600,
    B19200,
    B57600,
    B115200,
}

impl BaudRate {
    pub fn bps(self) -> u32 {
        match self {
            BaudRate::B9600 => 9600,
            BaudRate::B19200 => 19200,
            BaudRate::B57600 => 57600,
            BaudRate::B115200 => 115200,
        }
    }

    /// Value of the chip's baud parameter.
    pub fn code(self) -> u8 {
        match self {
            BaudRate::B9600 => 0x00,
            BaudRate::B19200 => 0x02,
            BaudRate::B57600 => 0x04,
            BaudRate::B115200 => 0x06,
        }
    }

    pub fn from_bps(bps: u32) -> Result<Self> {
        match bps {
            9600 => Ok(BaudRate::B9600),
            19200 => Ok(BaudRate::B19200),
            57600 => Ok(BaudRate::B57600),
            115200 => Ok(BaudRate::B115200),
            other => Err(OneWireError::invalid(format!(
                "unsupported baud rate {other}, expected 9600, 19200, 57600 or 115200"
            ))),
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code & 0x0E {
            0x00 => Some(BaudRate::B9600),
            0x02 => Some(BaudRate::B19200),
            0x04 => Some(BaudRate::B57600),
            0x06 => Some(BaudRate::B115200),
            _ => None,
        }
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bps())
    }
}

/// What a packet is about to do; decides the baud rate it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Byte,
    Search,
}

/// Timing parameters programmed into the chip for one bus speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeedParameters {
    pub slew_rate: u8,
    pub write1_low: u8,
    pub sample_offset: u8,
}

impl Default for SpeedParameters {
    fn default() -> Self {
        Self {
            slew_rate: SLEWRATE_1P37V,
            write1_low: WRITE1LOW_10US,
            sample_offset: SAMPLEOFFSET_8US,
        }
    }
}

/// Mode, baud and capability state of one bridge chip.
#[derive(Debug, Clone)]
pub struct TransportState {
    pub in_command_mode: bool,
    pub baud: BaudRate,
    /// Highest baud the host side is allowed to negotiate.
    pub max_baud: BaudRate,
    /// Speed bits OR-ed into every communication command.
    pub speed_mode: u8,
    pub chip_revision: u8,
    pub program_voltage_available: bool,
    pub long_alarm_check: bool,
    pub alarm_count: u32,
    pub stream_resets: bool,
    pub stream_bits: bool,
    pub stream_bytes: bool,
    pub stream_searches: bool,
    parameters: [SpeedParameters; 4],
}

impl Default for TransportState {
    fn default() -> Self {
        Self {
            in_command_mode: true,
            baud: BaudRate::B9600,
            max_baud: BaudRate::B115200,
            speed_mode: USPEED_FLEX,
            chip_revision: 0,
            program_voltage_available: false,
            long_alarm_check: false,
            alarm_count: 0,
            stream_resets: false,
            stream_bits: true,
            stream_bytes: true,
            stream_searches: true,
            parameters: [SpeedParameters::default(); 4],
        }
    }
}

impl TransportState {
    pub fn new(max_baud: BaudRate) -> Self {
        Self {
            max_baud,
            ..Self::default()
        }
    }

    pub fn parameters(&self, speed: Speed) -> SpeedParameters {
        self.parameters[speed_index(speed)]
    }

    pub fn set_parameters(&mut self, speed: Speed, params: SpeedParameters) {
        self.parameters[speed_index(speed)] = params;
    }

    /// Speed bits the chip uses for `speed`; only overdrive differs from flex.
    pub fn speed_code_for(speed: Speed) -> u8 {
        match speed {
            Speed::Overdrive => USPEED_OVERDRIVE,
            _ => USPEED_FLEX,
        }
    }

    /// Baud a packet of kind `op` at bus `speed` should run at.
    pub fn desired_baud(&self, op: Operation, speed: Speed) -> BaudRate {
        let wanted = match (op, speed) {
            (Operation::Byte, Speed::Overdrive) => BaudRate::B115200,
            (Operation::Search, Speed::Overdrive) => BaudRate::B57600,
            _ => BaudRate::B9600,
        };
        wanted.min(self.max_baud)
    }

    /// Escaping needed for `byte` while in data mode.
    pub fn needs_escape(&self, byte: u8) -> bool {
        byte == MODE_COMMAND || (byte == MODE_SPECIAL && self.chip_revision == CHIP_VERSION1)
    }

    /// An alarm presence starts the long alarm check.
    pub fn note_alarm(&mut self) {
        self.long_alarm_check = true;
        self.alarm_count = 0;
    }

    /// A plain presence counts towards dropping the long alarm check.
    pub fn note_presence(&mut self) {
        if self.long_alarm_check {
            let seen = self.alarm_count;
            self.alarm_count += 1;
            if seen > MAX_ALARM_COUNT {
                self.long_alarm_check = false;
            }
        }
    }
}

fn speed_index(speed: Speed) -> usize {
    match speed {
        Speed::Regular => 0,
        Speed::Overdrive => 1,
        Speed::Flex => 2,
        Speed::Hyperdrive => 3,
    }
}
