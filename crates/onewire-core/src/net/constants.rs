//! Network proxy protocol constants.

use std::net::Ipv4Addr;

// ============================================================================
// Connection defaults
// ============================================================================

/// Bumped whenever the command set or framing changes.
pub const PROTOCOL_VERSION: i32 = 1;
pub const DEFAULT_PORT: u16 = 6161;
/// Shared secret used when none is configured.
pub const DEFAULT_SECRET: &str = "Adapter Secret Default";
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(228, 5, 6, 7);
pub const DEFAULT_MULTICAST_PORT: u16 = 6163;

/// Random bytes the server sends for the client to sign.
pub const CHALLENGE_LEN: usize = 8;
/// Last byte of a discovery reply.
pub const BEACON_SENTINEL: u8 = 0xFF;

// ============================================================================
// Status bytes
// ============================================================================

pub const RET_SUCCESS: u8 = 0xFF;
pub const RET_FAILURE: u8 = 0xF0;

/// Largest block a peer may ask for in one frame.
pub const MAX_BLOCK_LEN: usize = 1 << 16;

// ============================================================================
// Commands
// ============================================================================

/// Command byte opening every request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Close = 0x08,
    Ping = 0x09,
    Reset = 0x10,
    PutBit = 0x11,
    PutByte = 0x12,
    GetBit = 0x13,
    GetByte = 0x14,
    GetBlock = 0x15,
    DataBlock = 0x16,
    SetPowerDuration = 0x17,
    StartPowerDelivery = 0x18,
    SetProgramPulseDuration = 0x19,
    StartProgramPulse = 0x1A,
    StartBreak = 0x1B,
    SetPowerNormal = 0x1C,
    SetSpeed = 0x1D,
    GetSpeed = 0x1E,
    BeginExclusive = 0x1F,
    EndExclusive = 0x20,
    FindFirstDevice = 0x21,
    FindNextDevice = 0x22,
    GetAddress = 0x23,
    SetSearchOnlyAlarming = 0x24,
    SetNoResetSearch = 0x25,
    SetSearchAll = 0x26,
    TargetAllFamilies = 0x27,
    TargetFamily = 0x28,
    ExcludeFamily = 0x29,
    CanBreak = 0x2A,
    CanDeliverPower = 0x2B,
    CanDeliverSmartPower = 0x2C,
    CanFlex = 0x2D,
    CanHyperdrive = 0x2E,
    CanOverdrive = 0x2F,
    CanProgram = 0x30,
}

impl Command {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        use Command::*;
        Some(match code {
            0x08 => Close,
            0x09 => Ping,
            0x10 => Reset,
            0x11 => PutBit,
            0x12 => PutByte,
            0x13 => GetBit,
            0x14 => GetByte,
            0x15 => GetBlock,
            0x16 => DataBlock,
            0x17 => SetPowerDuration,
            0x18 => StartPowerDelivery,
            0x19 => SetProgramPulseDuration,
            0x1A => StartProgramPulse,
            0x1B => StartBreak,
            0x1C => SetPowerNormal,
            0x1D => SetSpeed,
            0x1E => GetSpeed,
            0x1F => BeginExclusive,
            0x20 => EndExclusive,
            0x21 => FindFirstDevice,
            0x22 => FindNextDevice,
            0x23 => GetAddress,
            0x24 => SetSearchOnlyAlarming,
            0x25 => SetNoResetSearch,
            0x26 => SetSearchAll,
            0x27 => TargetAllFamilies,
            0x28 => TargetFamily,
            0x29 => ExcludeFamily,
            0x2A => CanBreak,
            0x2B => CanDeliverPower,
            0x2C => CanDeliverSmartPower,
            0x2D => CanFlex,
            0x2E => CanHyperdrive,
            0x2F => CanOverdrive,
            0x30 => CanProgram,
            _ => return None,
        })
    }
}
