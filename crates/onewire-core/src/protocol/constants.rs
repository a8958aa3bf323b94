//! Bridge-chip byte protocol constants.
//!
//! Derived from the DS2480B serial 1-Wire line driver command set.

// ============================================================================
// Mode switching
// ============================================================================

/// Switch to data mode.
pub const MODE_DATA: u8 = 0xE1;
/// Switch to command mode (escaped by doubling while in data mode).
pub const MODE_COMMAND: u8 = 0xE3;
/// Terminate an active pulse.
pub const MODE_STOP_PULSE: u8 = 0xF1;
/// Extra sentinel that revision 1 chips also treat specially in data mode.
pub const MODE_SPECIAL: u8 = 0xF3;

// ============================================================================
// Communication commands (OR with a speed code)
// ============================================================================

pub const FUNCTION_BIT: u8 = 0x81;
pub const FUNCTION_SEARCH_ON: u8 = 0xB1;
pub const FUNCTION_SEARCH_OFF: u8 = 0xA1;
pub const FUNCTION_RESET: u8 = 0xC1;
pub const FUNCTION_5V_PULSE_NOW: u8 = 0xED;
pub const FUNCTION_12V_PULSE_NOW: u8 = 0xFD;
pub const FUNCTION_5V_PULSE_ARM: u8 = 0xEF;
pub const FUNCTION_STOP_PULSE: u8 = 0xF1;

/// Bit-command flag: write a one.
pub const BIT_ONE: u8 = 0x10;
/// Bit-command flag: arm strong pull-up after this bit.
pub const PRIME_5V: u8 = 0x02;
/// Low bit set on every configuration command.
pub const CONFIG_MASK: u8 = 0x01;

// ============================================================================
// Speed codes
// ============================================================================

pub const USPEED_REGULAR: u8 = 0x00;
pub const USPEED_FLEX: u8 = 0x04;
pub const USPEED_OVERDRIVE: u8 = 0x08;
pub const USPEED_PULSE: u8 = 0x0C;

// ============================================================================
// Configuration parameters
// ============================================================================

pub const PARAMETER_SLEW: u8 = 0x10;
pub const PARAMETER_12V_PULSE: u8 = 0x20;
pub const PARAMETER_5V_PULSE: u8 = 0x30;
pub const PARAMETER_WRITE1_LOW: u8 = 0x40;
pub const PARAMETER_SAMPLE_OFFSET: u8 = 0x50;
pub const PARAMETER_BAUD: u8 = 0x70;

/// Pulldown slew rate codes (V/µs).
pub const SLEWRATE_15V: u8 = 0x00;
pub const SLEWRATE_2P2V: u8 = 0x02;
pub const SLEWRATE_1P65V: u8 = 0x04;
pub const SLEWRATE_1P37V: u8 = 0x06;
pub const SLEWRATE_1P1V: u8 = 0x08;
pub const SLEWRATE_0P83V: u8 = 0x0A;
pub const SLEWRATE_0P7V: u8 = 0x0C;
pub const SLEWRATE_0P55V: u8 = 0x0E;

pub const WRITE1LOW_8US: u8 = 0x00;
pub const WRITE1LOW_10US: u8 = 0x04;
pub const WRITE1LOW_15US: u8 = 0x0E;

pub const SAMPLEOFFSET_3US: u8 = 0x00;
pub const SAMPLEOFFSET_8US: u8 = 0x0A;
pub const SAMPLEOFFSET_10US: u8 = 0x0E;

pub const TIME5V_INFINITE: u8 = 0x0E;
pub const TIME12V_512US: u8 = 0x08;
pub const TIME12V_INFINITE: u8 = 0x0E;

// ============================================================================
// Responses
// ============================================================================

/// Both top bits set on every valid reset response.
pub const RESET_RESPONSE_MARK: u8 = 0xC0;
pub const RESET_MASK: u8 = 0x03;
pub const RESET_SHORT: u8 = 0x00;
pub const RESET_PRESENCE: u8 = 0x01;
pub const RESET_ALARM: u8 = 0x02;
pub const RESET_NOPRESENCE: u8 = 0x03;

pub const CHIP_VERSION_MASK: u8 = 0x1C;
/// Revision that needs `MODE_SPECIAL` escaped too.
pub const CHIP_VERSION1: u8 = 0x04;
pub const PROGRAM_VOLTAGE_MASK: u8 = 0x20;

/// Bit response: both low bits set means the slot read a one.
pub const BIT_RESPONSE_MASK: u8 = 0x03;

// ============================================================================
// Limits
// ============================================================================

/// A packet is sealed once it grows past this many bytes.
pub const MAX_BYTES_STREAMED: usize = 64;
/// Resets before an alarm-presence long check is dropped.
pub const MAX_ALARM_COUNT: u32 = 3000;
/// Bytes in a search-accelerator block.
pub const SEARCH_BLOCK_LEN: usize = 16;

// ============================================================================
// 1-Wire ROM commands
// ============================================================================

pub const ROM_SEARCH: u8 = 0xF0;
pub const ROM_ALARM_SEARCH: u8 = 0xEC;
pub const ROM_MATCH: u8 = 0x55;
pub const ROM_SKIP: u8 = 0xCC;
pub const ROM_OVERDRIVE_SKIP: u8 = 0x3C;
