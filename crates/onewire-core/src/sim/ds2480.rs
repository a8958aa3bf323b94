//! Byte-level model of the DS2480B line driver on top of a [`VirtualBus`].
//!
//! Covers what the adapter relies on: command/data modes with escaping,
//! configuration parameters, bit/reset/pulse commands, the search
//! accelerator, baud switching and the calibration byte expected after a
//! break or power cycle.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::trace;

use super::bus::VirtualBus;
use crate::protocol::constants::*;
use crate::protocol::response::{bit_read, bit_write};
use crate::state::link::ResetResult;
use crate::state::transport::BaudRate;
use crate::sync::lock;
use crate::transport::{SerialLink, TransportError};

/// Failure modes a test can inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmulatorFault {
    #[default]
    None,
    /// The chip never answers.
    Dead,
    /// The chip ignores breaks and only recovers after a DTR/RTS cycle.
    NeedsPowerCycle,
}

const PARAM_12V: usize = 2;
const PARAM_5V: usize = 3;
const PARAM_BAUD: usize = 7;
const REVISION: u8 = 0x0C;

#[derive(Debug)]
struct Chip {
    open: bool,
    host_baud: u32,
    baud: BaudRate,
    command_mode: bool,
    /// An 0xE3 arrived in data mode; the next byte decides what it meant.
    pending_escape: bool,
    calibrating: bool,
    accelerator: bool,
    search_block: Vec<u8>,
    params: [u8; 8],
    dtr: bool,
    rts: bool,
    strong_pullup: bool,
    program_voltage: bool,
    fault: EmulatorFault,
    output: VecDeque<u8>,
    received: Vec<u8>,
}

impl Chip {
    fn new() -> Self {
        Self {
            open: false,
            host_baud: 9600,
            baud: BaudRate::B9600,
            command_mode: true,
            pending_escape: false,
            calibrating: true,
            accelerator: false,
            search_block: Vec::new(),
            params: Self::power_up_params(),
            dtr: true,
            rts: true,
            strong_pullup: false,
            program_voltage: false,
            fault: EmulatorFault::None,
            output: VecDeque::new(),
            received: Vec::new(),
        }
    }

    fn power_up_params() -> [u8; 8] {
        let mut params = [0u8; 8];
        params[PARAM_12V] = TIME12V_512US;
        params[PARAM_5V] = 0x08;
        params
    }

    fn power_up(&mut self) {
        self.baud = BaudRate::B9600;
        self.command_mode = true;
        self.pending_escape = false;
        self.calibrating = true;
        self.accelerator = false;
        self.search_block.clear();
        self.params = Self::power_up_params();
        self.strong_pullup = false;
    }

    fn powered(&self) -> bool {
        self.dtr || self.rts
    }

    fn feed(&mut self, bus: &mut VirtualBus, byte: u8) {
        if self.calibrating {
            trace!(byte = %format!("0x{byte:02X}"), "Emulator calibrated");
            self.calibrating = false;
            return;
        }
        if self.command_mode {
            self.command(bus, byte);
            return;
        }
        if self.pending_escape {
            self.pending_escape = false;
            if byte == MODE_COMMAND {
                self.data(bus, MODE_COMMAND);
            } else {
                self.command_mode = true;
                self.command(bus, byte);
            }
            return;
        }
        if byte == MODE_COMMAND {
            self.pending_escape = true;
            return;
        }
        self.data(bus, byte);
    }

    fn data(&mut self, bus: &mut VirtualBus, byte: u8) {
        if !self.accelerator {
            let echo = bus.touch_byte(byte);
            self.output.push_back(echo);
            return;
        }
        self.search_block.push(byte);
        if self.search_block.len() == SEARCH_BLOCK_LEN {
            let directions = std::mem::take(&mut self.search_block);
            let response = accelerated_search(bus, &directions);
            self.output.extend(response);
        }
    }

    fn command(&mut self, bus: &mut VirtualBus, byte: u8) {
        match byte {
            MODE_DATA => self.command_mode = false,
            MODE_COMMAND => {}
            FUNCTION_STOP_PULSE => {
                self.strong_pullup = false;
                self.output.push_back(byte & 0xFE);
            }
            b if b & 0x80 == 0 => self.configure(b),
            b => match (b >> 5) & 0x03 {
                0 => {
                    let value = b & BIT_ONE != 0;
                    let read = bus.touch_bit(value);
                    self.output
                        .push_back((b & 0xFC) | if read { BIT_RESPONSE_MASK } else { 0 });
                    if b & PRIME_5V != 0 {
                        self.strong_pullup = true;
                    }
                }
                1 => self.accelerator = b & 0x10 != 0,
                2 => {
                    let code = match bus.reset() {
                        ResetResult::Short => RESET_SHORT,
                        ResetResult::Presence => RESET_PRESENCE,
                        ResetResult::Alarm => RESET_ALARM,
                        ResetResult::NoPresence => RESET_NOPRESENCE,
                    };
                    let voltage = if self.program_voltage {
                        PROGRAM_VOLTAGE_MASK
                    } else {
                        0
                    };
                    self.output
                        .push_back(RESET_RESPONSE_MARK | voltage | REVISION | code);
                }
                _ => self.pulse(b),
            },
        }
    }

    fn configure(&mut self, byte: u8) {
        let parameter = ((byte >> 4) & 0x07) as usize;
        if parameter == 0 {
            let read = ((byte >> 1) & 0x07) as usize;
            self.output.push_back(self.params[read] & 0x0E);
            return;
        }
        let value = byte & 0x0E;
        self.params[parameter] = value;
        self.output.push_back(byte & 0x7E);
        if parameter == PARAM_BAUD
            && let Some(baud) = BaudRate::from_code(value)
        {
            self.baud = baud;
        }
    }

    fn pulse(&mut self, byte: u8) {
        if byte & PRIME_5V != 0 {
            // armed; the pulse starts with a later primed bit
            return;
        }
        let parameter = if byte & 0x10 != 0 { PARAM_12V } else { PARAM_5V };
        if self.params[parameter] == TIME5V_INFINITE {
            self.strong_pullup = true;
        } else {
            self.output.push_back(byte & 0xFC);
        }
    }
}

/// Run the accelerator over 64 bit pairs, taking the host's direction only
/// where the devices disagree.
fn accelerated_search(bus: &mut VirtualBus, directions: &[u8]) -> Vec<u8> {
    let mut response = vec![0u8; SEARCH_BLOCK_LEN];
    for i in 0..64 {
        let bit = bus.touch_bit(true);
        let complement = bus.touch_bit(true);
        let (flag, direction) = match (bit, complement) {
            (false, false) => (true, bit_read(directions, 2 * i + 1)),
            (true, false) => (false, true),
            (false, true) => (false, false),
            (true, true) => (true, true),
        };
        bus.touch_bit(direction);
        bit_write(&mut response, 2 * i, flag);
        bit_write(&mut response, 2 * i + 1, direction);
    }
    response
}

/// Serial link that answers like a DS2480B wired to a virtual bus.
///
/// Clones share the chip and bus, so tests can keep a handle while an
/// adapter owns another.
#[derive(Clone)]
pub struct Ds2480Emulator {
    name: String,
    bus: Arc<Mutex<VirtualBus>>,
    chip: Arc<Mutex<Chip>>,
}

impl Ds2480Emulator {
    pub fn new(bus: VirtualBus) -> Self {
        Self::with_shared_bus(Arc::new(Mutex::new(bus)))
    }

    pub fn with_shared_bus(bus: Arc<Mutex<VirtualBus>>) -> Self {
        Self {
            name: "DS2480-SIM".to_string(),
            bus,
            chip: Arc::new(Mutex::new(Chip::new())),
        }
    }

    pub fn bus(&self) -> Arc<Mutex<VirtualBus>> {
        Arc::clone(&self.bus)
    }

    pub fn set_fault(&self, fault: EmulatorFault) {
        lock(&self.chip).fault = fault;
    }

    pub fn set_program_voltage(&self, available: bool) {
        lock(&self.chip).program_voltage = available;
    }

    /// Baud the chip itself is running at.
    pub fn chip_baud(&self) -> BaudRate {
        lock(&self.chip).baud
    }

    /// Whether a strong pull-up is currently applied.
    pub fn strong_pullup(&self) -> bool {
        lock(&self.chip).strong_pullup
    }

    /// Every byte the chip accepted, in order.
    pub fn received(&self) -> Vec<u8> {
        lock(&self.chip).received.clone()
    }
}

impl SerialLink for Ds2480Emulator {
    fn port_name(&self) -> &str {
        &self.name
    }

    fn open(&mut self) -> Result<(), TransportError> {
        lock(&self.chip).open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        lock(&self.chip).open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        lock(&self.chip).open
    }

    fn baud_rate(&self) -> u32 {
        lock(&self.chip).host_baud
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        lock(&self.chip).host_baud = baud;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TransportError> {
        lock(&self.chip).output.clear();
        Ok(())
    }

    fn send_break(&mut self, _duration: Duration) -> Result<(), TransportError> {
        let mut chip = lock(&self.chip);
        if !chip.open {
            return Err(TransportError::NotOpen);
        }
        if chip.fault == EmulatorFault::None && chip.powered() {
            chip.power_up();
        }
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), TransportError> {
        let mut chip = lock(&self.chip);
        let was_powered = chip.powered();
        chip.dtr = level;
        if !was_powered && chip.powered() {
            chip.power_up();
            if chip.fault == EmulatorFault::NeedsPowerCycle {
                chip.fault = EmulatorFault::None;
            }
        }
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<(), TransportError> {
        let mut chip = lock(&self.chip);
        let was_powered = chip.powered();
        chip.rts = level;
        if !was_powered && chip.powered() {
            chip.power_up();
            if chip.fault == EmulatorFault::NeedsPowerCycle {
                chip.fault = EmulatorFault::None;
            }
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut chip = lock(&self.chip);
        if !chip.open {
            return Err(TransportError::NotOpen);
        }
        if chip.fault != EmulatorFault::None
            || !chip.powered()
            || chip.host_baud != chip.baud.bps()
        {
            return Ok(());
        }
        let mut bus = lock(&self.bus);
        for &byte in data {
            chip.received.push(byte);
            chip.feed(&mut bus, byte);
        }
        Ok(())
    }

    fn read_with_timeout(
        &mut self,
        len: usize,
        _timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let mut chip = lock(&self.chip);
        if !chip.open {
            return Err(TransportError::NotOpen);
        }
        if chip.output.len() < len {
            return Err(TransportError::Timeout {
                wanted: len,
                got: chip.output.len(),
            });
        }
        Ok(chip.output.drain(..len).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    fn calibrated(bus: VirtualBus) -> Ds2480Emulator {
        let mut link = Ds2480Emulator::new(bus);
        link.open().unwrap();
        link.write(&[FUNCTION_RESET]).unwrap();
        link
    }

    #[test]
    fn test_first_byte_is_swallowed_for_calibration() {
        let mut link = Ds2480Emulator::new(VirtualBus::new());
        link.open().unwrap();
        link.write(&[FUNCTION_RESET]).unwrap();
        assert!(link.read_with_timeout(1, Duration::ZERO).is_err());
        link.write(&[FUNCTION_RESET | USPEED_FLEX]).unwrap();
        assert_eq!(link.read_with_timeout(1, Duration::ZERO).unwrap(), vec![0xCF]);
    }

    #[test]
    fn test_reset_reports_presence() {
        let device = Address::with_crc(0x28, [1, 2, 3, 4, 5, 6]);
        let mut link = calibrated(VirtualBus::with_devices(&[device]));
        link.write(&[FUNCTION_RESET | USPEED_FLEX]).unwrap();
        assert_eq!(link.read_with_timeout(1, Duration::ZERO).unwrap(), vec![0xCD]);
    }

    #[test]
    fn test_parameter_write_and_read() {
        let mut link = calibrated(VirtualBus::new());
        link.write(&[CONFIG_MASK | PARAMETER_SLEW | SLEWRATE_1P37V, 0x03])
            .unwrap();
        assert_eq!(link.read_with_timeout(2, Duration::ZERO).unwrap(), vec![
            PARAMETER_SLEW | SLEWRATE_1P37V,
            SLEWRATE_1P37V
        ]);
    }

    #[test]
    fn test_bit_response_echoes_speed() {
        let mut link = calibrated(VirtualBus::new());
        link.write(&[FUNCTION_BIT | USPEED_FLEX | BIT_ONE]).unwrap();
        assert_eq!(link.read_with_timeout(1, Duration::ZERO).unwrap(), vec![0x97]);
    }

    #[test]
    fn test_data_mode_escape() {
        let mut link = calibrated(VirtualBus::new());
        link.write(&[MODE_DATA, MODE_COMMAND, MODE_COMMAND, 0x55, MODE_COMMAND])
            .unwrap();
        assert_eq!(link.read_with_timeout(2, Duration::ZERO).unwrap(), vec![
            MODE_COMMAND,
            0x55
        ]);
        // the lone 0xE3 switches back once the next byte arrives
        link.write(&[FUNCTION_BIT | USPEED_FLEX]).unwrap();
        assert_eq!(link.read_with_timeout(1, Duration::ZERO).unwrap(), vec![0x84]);
    }

    #[test]
    fn test_baud_mismatch_drops_bytes() {
        let mut link = calibrated(VirtualBus::new());
        link.write(&[CONFIG_MASK | PARAMETER_BAUD | BaudRate::B115200.code()])
            .unwrap();
        link.flush().unwrap();
        assert_eq!(link.chip_baud(), BaudRate::B115200);

        link.write(&[FUNCTION_RESET]).unwrap();
        assert!(link.read_with_timeout(1, Duration::ZERO).is_err());

        link.set_baud_rate(115200).unwrap();
        link.write(&[FUNCTION_RESET]).unwrap();
        assert_eq!(link.read_with_timeout(1, Duration::ZERO).unwrap().len(), 1);
    }

    #[test]
    fn test_break_restores_defaults() {
        let mut link = calibrated(VirtualBus::new());
        link.write(&[CONFIG_MASK | PARAMETER_BAUD | BaudRate::B57600.code()])
            .unwrap();
        link.send_break(Duration::ZERO).unwrap();
        assert_eq!(link.chip_baud(), BaudRate::B9600);
    }

    #[test]
    fn test_power_cycle_clears_fault() {
        let mut link = calibrated(VirtualBus::new());
        link.set_fault(EmulatorFault::NeedsPowerCycle);
        link.send_break(Duration::ZERO).unwrap();
        link.write(&[0xC1, 0xC1]).unwrap();
        assert!(link.read_with_timeout(1, Duration::ZERO).is_err());

        link.set_dtr(false).unwrap();
        link.set_rts(false).unwrap();
        link.set_dtr(true).unwrap();
        link.set_rts(true).unwrap();
        link.write(&[0xC1, 0xC1]).unwrap();
        assert_eq!(link.read_with_timeout(1, Duration::ZERO).unwrap().len(), 1);
    }

    #[test]
    fn test_infinite_pulse_has_no_response() {
        let mut link = calibrated(VirtualBus::new());
        link.write(&[
            CONFIG_MASK | PARAMETER_5V_PULSE | TIME5V_INFINITE,
            FUNCTION_5V_PULSE_NOW,
        ])
        .unwrap();
        assert_eq!(link.read_with_timeout(1, Duration::ZERO).unwrap().len(), 1);
        assert!(link.read_with_timeout(1, Duration::ZERO).is_err());
        assert!(link.strong_pullup());

        link.write(&[FUNCTION_STOP_PULSE]).unwrap();
        assert_eq!(link.read_with_timeout(1, Duration::ZERO).unwrap(), vec![0xF0]);
        assert!(!link.strong_pullup());
    }
}
