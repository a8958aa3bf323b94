//! Per-session bus state: search cursor, filters, speed and power level.

use std::fmt;

use crate::address::Address;
use crate::error::{OneWireError, Result};

/// Bus timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Speed {
    #[default]
    Regular,
    Flex,
    Overdrive,
    Hyperdrive,
}

impl Speed {
    /// Numeric value used on the proxy wire.
    pub fn code(self) -> i32 {
        match self {
            Speed::Regular => 0,
            Speed::Overdrive => 1,
            Speed::Flex => 2,
            Speed::Hyperdrive => 3,
        }
    }

    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(Speed::Regular),
            1 => Ok(Speed::Overdrive),
            2 => Ok(Speed::Flex),
            3 => Ok(Speed::Hyperdrive),
            other => Err(OneWireError::invalid(format!("unknown speed {other}"))),
        }
    }
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speed::Regular => write!(f, "regular"),
            Speed::Flex => write!(f, "flex"),
            Speed::Overdrive => write!(f, "overdrive"),
            Speed::Hyperdrive => write!(f, "hyperdrive"),
        }
    }
}

/// Electrical state of the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerLevel {
    #[default]
    Normal,
    PowerDelivery,
    ProgramPulse,
    Break,
}

/// Outcome of a bus reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetResult {
    NoPresence,
    Presence,
    Alarm,
    Short,
}

impl ResetResult {
    pub fn code(self) -> i32 {
        match self {
            ResetResult::NoPresence => 0,
            ResetResult::Presence => 1,
            ResetResult::Alarm => 2,
            ResetResult::Short => 3,
        }
    }

    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(ResetResult::NoPresence),
            1 => Ok(ResetResult::Presence),
            2 => Ok(ResetResult::Alarm),
            3 => Ok(ResetResult::Short),
            other => Err(OneWireError::invalid(format!("unknown reset result {other}"))),
        }
    }

    /// At least one device answered.
    pub fn is_presence(self) -> bool {
        matches!(self, ResetResult::Presence | ResetResult::Alarm)
    }
}

impl fmt::Display for ResetResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResetResult::NoPresence => write!(f, "no presence"),
            ResetResult::Presence => write!(f, "presence"),
            ResetResult::Alarm => write!(f, "alarm"),
            ResetResult::Short => write!(f, "short"),
        }
    }
}

/// How long strong pull-up or program voltage stays applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerDuration {
    HalfSecond,
    OneSecond,
    TwoSeconds,
    FourSeconds,
    SmartDone,
    #[default]
    Infinite,
    CurrentDetect,
    Eprom,
}

impl PowerDuration {
    pub fn code(self) -> i32 {
        match self {
            PowerDuration::HalfSecond => 0,
            PowerDuration::OneSecond => 1,
            PowerDuration::TwoSeconds => 2,
            PowerDuration::FourSeconds => 3,
            PowerDuration::SmartDone => 4,
            PowerDuration::Infinite => 5,
            PowerDuration::CurrentDetect => 6,
            PowerDuration::Eprom => 7,
        }
    }

    pub fn from_code(code: i32) -> Result<Self> {
        Ok(match code {
            0 => PowerDuration::HalfSecond,
            1 => PowerDuration::OneSecond,
            2 => PowerDuration::TwoSeconds,
            3 => PowerDuration::FourSeconds,
            4 => PowerDuration::SmartDone,
            5 => PowerDuration::Infinite,
            6 => PowerDuration::CurrentDetect,
            7 => PowerDuration::Eprom,
            other => {
                return Err(OneWireError::invalid(format!("unknown power duration {other}")));
            }
        })
    }
}

/// When a power level change takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerCondition {
    Now,
    AfterBit,
    AfterByte,
}

impl PowerCondition {
    pub fn code(self) -> i32 {
        match self {
            PowerCondition::Now => 0,
            PowerCondition::AfterBit => 1,
            PowerCondition::AfterByte => 2,
        }
    }

    /// Unknown codes are the "invalid power-delivery condition" setup error.
    pub fn from_code(code: i32) -> Result<Self> {
        match code {
            0 => Ok(PowerCondition::Now),
            1 => Ok(PowerCondition::AfterBit),
            2 => Ok(PowerCondition::AfterByte),
            other => Err(OneWireError::invalid(format!(
                "invalid power delivery condition {other}"
            ))),
        }
    }
}

/// Everything one session remembers between bus calls.
///
/// Treat it as opaque between search calls: editing `address` without
/// matching `last_discrepancy` leaves the next search undefined.
#[derive(Debug, Clone, Default)]
pub struct LinkState {
    /// Last device found (or the target of `is_present`).
    pub address: Address,
    /// Bit position (1..=64) of the last branch where 0 was taken; 0 = none.
    pub last_discrepancy: u8,
    /// Same as `last_discrepancy`, restricted to the family byte.
    pub last_family_discrepancy: u8,
    pub is_last_device: bool,
    pub include_families: Vec<u8>,
    pub exclude_families: Vec<u8>,
    pub search_alarm_only: bool,
    pub skip_reset_on_search: bool,
    pub speed: Speed,
    pub power_level: PowerLevel,
    /// Strong pull-up armed to start after the next bit.
    pub level_change_on_next_bit: bool,
    /// Strong pull-up armed to start after the next byte.
    pub level_change_on_next_byte: bool,
    pub power_duration: PowerDuration,
    pub program_pulse_duration: PowerDuration,
}

impl LinkState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restart enumeration from the first device.
    pub fn reset_search(&mut self) {
        self.last_discrepancy = 0;
        self.last_family_discrepancy = 0;
        self.is_last_device = false;
    }

    /// True before the first pass of an enumeration.
    pub fn is_fresh_search(&self) -> bool {
        self.last_discrepancy == 0 && !self.is_last_device
    }

    /// Cursor that makes the next pass walk exactly `target`.
    pub fn seeded_for(&self, target: Address) -> LinkState {
        LinkState {
            address: target,
            last_discrepancy: 64,
            last_family_discrepancy: 0,
            is_last_device: false,
            include_families: Vec::new(),
            exclude_families: Vec::new(),
            search_alarm_only: false,
            skip_reset_on_search: false,
            speed: self.speed,
            power_level: self.power_level,
            level_change_on_next_bit: false,
            level_change_on_next_byte: false,
            power_duration: self.power_duration,
            program_pulse_duration: self.program_pulse_duration,
        }
    }

    /// Apply the include/exclude filters to `family`.
    pub fn accepts_family(&self, family: u8) -> bool {
        if self.exclude_families.contains(&family) {
            return false;
        }
        self.include_families.is_empty() || self.include_families.contains(&family)
    }

    /// Restrict searches to `families`.
    pub fn target_families(&mut self, families: &[u8]) {
        self.include_families = families.to_vec();
    }

    /// Skip `families` in searches.
    pub fn exclude_families(&mut self, families: &[u8]) {
        self.exclude_families = families.to_vec();
    }

    /// Clear both filters.
    pub fn target_all_families(&mut self) {
        self.include_families.clear();
        self.exclude_families.clear();
    }

    pub fn set_search_only_alarming(&mut self) {
        self.search_alarm_only = true;
    }

    pub fn set_no_reset_search(&mut self) {
        self.skip_reset_on_search = true;
    }

    pub fn set_search_all(&mut self) {
        self.search_alarm_only = false;
        self.skip_reset_on_search = false;
    }

    /// Whether a strong pull-up is waiting on the next bit or byte.
    pub fn has_pending_power(&self) -> bool {
        self.level_change_on_next_bit || self.level_change_on_next_byte
    }
}
