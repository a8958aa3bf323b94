//! Adapter for DS2480B-based serial bridges (DS9097U and friends).
//!
//! Every operation runs inside an [`Op`]: the session's local exclusive
//! plus the chip and link locks. The op checks adapter presence (running
//! the retry ladder when needed), normalizes pending power levels, picks
//! the baud rate for the operation, builds packets and interprets the
//! response stream.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace, warn};

use super::{Capability, PortAdapter};
use crate::address::Address;
use crate::error::{OneWireError, Result};
use crate::events::{BusEvent, BusObserver, PacketDirection, TracingObserver};
use crate::protocol::constants::*;
use crate::protocol::{
    Packet, PacketBuilder, interpret_bit, interpret_primed_byte, interpret_reset,
    interpret_search,
};
use crate::search;
use crate::state::link::{LinkState, PowerCondition, PowerDuration, PowerLevel, ResetResult, Speed};
use crate::state::machine::{LadderPolicy, LadderStep, PresenceLadder, PresenceState};
use crate::state::transport::{BaudRate, Operation, TransportState};
use crate::sync::lock;
use crate::transport::{
    LeasePolicy, LocalExclusive, SerialLink, SessionId, TransportError, TransportSession,
};

const ADAPTER_NAME: &str = "DS9097U";

/// Fixed waits around chip resets, power cycles and baud changes (ms).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ds2480Timing {
    pub break_ms: u64,
    pub post_break_ms: u64,
    pub power_off_ms: u64,
    pub power_on_ms: u64,
    pub baud_settle_ms: u64,
    pub baud_confirm_ms: u64,
    /// Pause requested by a settle packet after an alarm presence.
    pub alarm_settle_ms: u64,
    /// Time for the bus to drop when starting a break.
    pub break_level_ms: u64,
    /// Time for the chip to power up again after a break.
    pub power_restore_ms: u64,
}

impl Default for Ds2480Timing {
    fn default() -> Self {
        Self {
            break_ms: 10,
            post_break_ms: 5,
            power_off_ms: 300,
            power_on_ms: 1,
            baud_settle_ms: 5,
            baud_confirm_ms: 150,
            alarm_settle_ms: 6,
            break_level_ms: 200,
            power_restore_ms: 300,
        }
    }
}

impl Ds2480Timing {
    /// No waits at all, for emulated chips.
    pub fn instant() -> Self {
        Self {
            break_ms: 0,
            post_break_ms: 0,
            power_off_ms: 0,
            power_on_ms: 0,
            baud_settle_ms: 0,
            baud_confirm_ms: 0,
            alarm_settle_ms: 0,
            break_level_ms: 0,
            power_restore_ms: 0,
        }
    }
}

/// Which operations may share a packet with what follows them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingFlags {
    pub resets: bool,
    pub bits: bool,
    pub bytes: bool,
    pub searches: bool,
}

impl Default for StreamingFlags {
    fn default() -> Self {
        Self {
            resets: false,
            bits: true,
            bytes: true,
            searches: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ds2480Options {
    /// Highest host baud used for overdrive traffic.
    pub max_baud: BaudRate,
    pub streaming: StreamingFlags,
    pub lease: LeasePolicy,
    pub ladder: LadderPolicy,
    pub timing: Ds2480Timing,
}

impl Default for Ds2480Options {
    fn default() -> Self {
        Self {
            max_baud: BaudRate::B115200,
            streaming: StreamingFlags::default(),
            lease: LeasePolicy::default(),
            ladder: LadderPolicy::default(),
            timing: Ds2480Timing::default(),
        }
    }
}

fn pause(ms: u64) {
    if ms > 0 {
        thread::sleep(Duration::from_millis(ms));
    }
}

#[derive(Debug)]
struct ChipState {
    transport: TransportState,
    adapter_present: bool,
}

/// Everything shared by the sessions on one port.
struct Ds2480Port {
    session: TransportSession,
    chip: Mutex<ChipState>,
    ladder: LadderPolicy,
    timing: Ds2480Timing,
    observer: Arc<dyn BusObserver>,
}

impl Ds2480Port {
    fn enter(&self, session: SessionId) -> Result<Op<'_>> {
        let exclusive = self.session.local_exclusive(session)?;
        Ok(Op {
            port: self,
            chip: lock(&self.chip),
            link: self.session.link(),
            _exclusive: exclusive,
        })
    }

    fn emit(&self, event: BusEvent) {
        self.observer.on_event(&event);
    }
}

/// One operation's hold on the port. Fields drop in order, so the locks
/// go before the lease.
struct Op<'a> {
    port: &'a Ds2480Port,
    chip: MutexGuard<'a, ChipState>,
    link: MutexGuard<'a, Box<dyn SerialLink>>,
    _exclusive: LocalExclusive<'a>,
}

impl Op<'_> {
    fn port_name(&self) -> String {
        self.port.session.port_name().to_string()
    }

    fn invalidate(&mut self, reason: &str) {
        if self.chip.adapter_present {
            self.chip.adapter_present = false;
            self.port.emit(BusEvent::AdapterLost {
                port: self.port_name(),
                reason: reason.to_string(),
            });
        }
    }

    /// Send each packet and read exactly its expected response.
    fn transact(&mut self, packets: Vec<Packet>) -> Result<Vec<u8>> {
        let mut response = Vec::new();
        for packet in packets {
            match self.exchange(&packet) {
                Ok(bytes) => response.extend(bytes),
                Err(e) => {
                    self.invalidate(&e.to_string());
                    return Err(e.into());
                }
            }
        }
        Ok(response)
    }

    fn exchange(&mut self, packet: &Packet) -> std::result::Result<Vec<u8>, TransportError> {
        if packet.is_settle() {
            pause(self.port.timing.alarm_settle_ms);
            self.link.flush()?;
            return Ok(Vec::new());
        }
        self.port.emit(BusEvent::Packet {
            direction: PacketDirection::Tx,
            length: packet.bytes.len(),
            data: Some(packet.bytes.clone()),
        });
        self.link.write(&packet.bytes)?;
        if packet.expected_response_len == 0 {
            return Ok(Vec::new());
        }
        let bytes = self.link.read_exact_default(packet.expected_response_len)?;
        self.port.emit(BusEvent::Packet {
            direction: PacketDirection::Rx,
            length: bytes.len(),
            data: Some(bytes.clone()),
        });
        Ok(bytes)
    }

    /// Run the presence ladder unless the adapter is already known good.
    #[instrument(skip(self), fields(port = %self.port.session.port_name()))]
    fn ensure_present(&mut self, speed: Speed) -> Result<()> {
        if self.chip.adapter_present {
            return Ok(());
        }
        let mut ladder = PresenceLadder::new(self.port.ladder);
        while let Some(step) = ladder.advance() {
            self.port.emit(BusEvent::LadderStep {
                port: self.port_name(),
                step,
            });
            match step {
                LadderStep::MasterReset => self.master_reset(),
                LadderStep::PowerReset => self.power_reset(),
            }
            let ok = self.verify(speed);
            if ladder.verified(ok) {
                break;
            }
        }
        if ladder.state() != PresenceState::Present {
            warn!("Adapter did not answer any reset step");
            return Err(OneWireError::AdapterNotDetected {
                port: self.port_name(),
            });
        }
        self.chip.adapter_present = true;
        self.port.emit(BusEvent::AdapterDetected {
            port: self.port_name(),
            adapter: ADAPTER_NAME.to_string(),
        });
        Ok(())
    }

    fn reset_chip_state(&mut self) {
        let transport = &mut self.chip.transport;
        transport.baud = BaudRate::B9600;
        transport.speed_mode = USPEED_FLEX;
        transport.in_command_mode = true;
    }

    fn master_reset(&mut self) {
        self.reset_chip_state();
        let timing = self.port.timing;
        if let Err(e) = master_reset_io(self.link.as_mut(), &timing) {
            debug!(error = %e, "Master reset I/O failed");
        }
    }

    fn power_reset(&mut self) {
        self.reset_chip_state();
        let timing = self.port.timing;
        let result = master_reset_io(self.link.as_mut(), &timing).and_then(|_| {
            let link = self.link.as_mut();
            link.set_dtr(false)?;
            link.set_rts(false)?;
            pause(timing.power_off_ms);
            link.set_dtr(true)?;
            link.set_rts(true)?;
            pause(timing.power_on_ms);
            link.flush()?;
            link.write(&[FUNCTION_RESET])?;
            link.flush()
        });
        if let Err(e) = result {
            debug!(error = %e, "Power reset I/O failed");
        }
    }

    /// Program the speed parameters and check the chip echoes the expected
    /// baud and speed bits.
    fn verify(&mut self, speed: Speed) -> bool {
        match self.try_verify(speed) {
            Ok(ok) => ok,
            Err(e) => {
                debug!(error = %e, "Adapter verify failed");
                false
            }
        }
    }

    fn try_verify(&mut self, speed: Speed) -> Result<bool> {
        self.link.flush()?;
        let params = self.chip.transport.parameters(speed);
        let expected_baud = self.chip.transport.baud.code();
        let expected_mode = self.chip.transport.speed_mode;

        let mut builder = PacketBuilder::new(&mut self.chip.transport);
        builder.set_parameter(PARAMETER_SLEW, params.slew_rate);
        builder.set_parameter(PARAMETER_WRITE1_LOW, params.write1_low);
        builder.set_parameter(PARAMETER_SAMPLE_OFFSET, params.sample_offset);
        builder.set_parameter(PARAMETER_5V_PULSE, TIME5V_INFINITE);
        let baud_offset = builder.get_parameter(PARAMETER_BAUD);
        let bit_offset = builder.data_bit(true, false);
        let packets = builder.finish();
        let response = self.transact(packets)?;

        Ok(response.len() == bit_offset + 1
            && response[baud_offset] & 0xF1 == 0
            && response[baud_offset] & 0x0E == expected_baud
            && response[bit_offset] & 0xF0 == 0x90
            && response[bit_offset] & 0x0C == expected_mode)
    }

    /// Presence, pending power and speed bits, in that order.
    fn prepare(&mut self, link: &mut LinkState) -> Result<()> {
        self.ensure_present(link.speed)?;
        if link.power_level != PowerLevel::Normal {
            self.power_normal(link)?;
        }
        self.chip.transport.speed_mode = TransportState::speed_code_for(link.speed);
        Ok(())
    }

    /// Move host and chip to the baud `op` wants at `speed`.
    fn streaming_speed(&mut self, op: Operation, speed: Speed) -> Result<()> {
        let desired = self.chip.transport.desired_baud(op, speed);
        if desired == self.chip.transport.baud {
            return Ok(());
        }
        debug!(from = %self.chip.transport.baud, to = %desired, "Changing baud");
        self.chip.adapter_present = false;

        let mut builder = PacketBuilder::new(&mut self.chip.transport);
        builder.set_parameter(PARAMETER_BAUD, desired.code());
        let packets = builder.finish();
        self.link.flush()?;
        for packet in &packets {
            self.link.write(&packet.bytes)?;
        }
        pause(self.port.timing.baud_settle_ms);
        self.link.flush()?;
        pause(self.port.timing.baud_settle_ms);
        self.link.set_baud_rate(desired.bps())?;
        self.chip.transport.baud = desired;
        self.port.emit(BusEvent::BaudChanged {
            port: self.port_name(),
            baud: desired,
        });
        pause(self.port.timing.baud_settle_ms);

        let mut builder = PacketBuilder::new(&mut self.chip.transport);
        let offset = builder.get_parameter(PARAMETER_BAUD);
        builder.set_speed();
        let packets = builder.finish();
        self.link.flush()?;
        let response = self.transact(packets)?;
        if response.len() == 1
            && response[offset] & 0xF1 == 0
            && response[offset] & 0x0E == desired.code()
        {
            self.chip.adapter_present = true;
            pause(self.port.timing.baud_confirm_ms);
            self.link.flush()?;
            return Ok(());
        }
        Err(OneWireError::comm(format!(
            "adapter did not confirm baud {desired}"
        )))
    }

    fn reset_bus(&mut self, link: &mut LinkState) -> Result<ResetResult> {
        self.prepare(link)?;
        self.link.flush()?;
        let mut builder = PacketBuilder::new(&mut self.chip.transport);
        let offset = builder.reset();
        let packets = builder.finish();
        let response = self.transact(packets)?;
        let byte = response
            .get(offset)
            .copied()
            .ok_or_else(|| OneWireError::comm("no response to 1-Wire reset"))?;
        Ok(interpret_reset(&mut self.chip.transport, byte))
    }

    fn touch_bit(&mut self, link: &mut LinkState, value: bool) -> Result<bool> {
        self.prepare(link)?;
        self.link.flush()?;
        let prime = link.level_change_on_next_bit;
        let mut builder = PacketBuilder::new(&mut self.chip.transport);
        let offset = builder.data_bit(value, prime);
        let packets = builder.finish();
        if prime {
            link.level_change_on_next_bit = false;
            link.power_level = PowerLevel::PowerDelivery;
        }
        let response = self.transact(packets)?;
        let byte = response
            .get(offset)
            .copied()
            .ok_or_else(|| OneWireError::comm("no response to bit command"))?;
        Ok(interpret_bit(byte))
    }

    fn block(&mut self, link: &mut LinkState, block: &mut [u8]) -> Result<()> {
        if block.is_empty() {
            return Ok(());
        }
        self.prepare(link)?;
        self.streaming_speed(Operation::Byte, link.speed)?;
        self.link.flush()?;

        if block.len() == 1 && link.level_change_on_next_byte {
            let mut builder = PacketBuilder::new(&mut self.chip.transport);
            let offset = builder.primed_data_byte(block[0]);
            link.level_change_on_next_byte = false;
            let packets = builder.finish();
            let response = self.transact(packets)?;
            link.power_level = PowerLevel::PowerDelivery;
            if response.len() < offset + 8 {
                return Err(OneWireError::comm("short response to primed byte"));
            }
            block[0] = interpret_primed_byte(&response[offset..]);
            return Ok(());
        }

        let mut builder = PacketBuilder::new(&mut self.chip.transport);
        let offset = builder.data_bytes(block);
        let packets = builder.finish();
        let response = self.transact(packets)?;
        let echo = response
            .get(offset..offset + block.len())
            .ok_or_else(|| OneWireError::comm("short response to data block"))?;
        block.copy_from_slice(echo);
        Ok(())
    }

    /// One accelerated search pass from `link`'s cursor.
    fn search(&mut self, link: &mut LinkState) -> Result<bool> {
        self.prepare(link)?;
        self.streaming_speed(Operation::Search, link.speed)?;
        self.link.flush()?;

        let mut builder = PacketBuilder::new(&mut self.chip.transport);
        let reset_offset = (!link.skip_reset_on_search).then(|| builder.reset());
        builder.data_byte(if link.search_alarm_only {
            ROM_ALARM_SEARCH
        } else {
            ROM_SEARCH
        });
        let search_offset = builder.search(link);
        let packets = builder.finish();
        let response = self.transact(packets)?;

        if let Some(offset) = reset_offset
            && let Some(&byte) = response.get(offset)
        {
            interpret_reset(&mut self.chip.transport, byte);
        }
        match response.get(search_offset..search_offset + SEARCH_BLOCK_LEN) {
            Some(block) => Ok(interpret_search(link, block)),
            None => Err(OneWireError::comm("short response to search")),
        }
    }

    /// Search triplets sent as a plain block, for speeds where the
    /// accelerator cannot keep up.
    fn block_is_present(
        &mut self,
        link: &mut LinkState,
        address: Address,
        alarm_only: bool,
    ) -> Result<bool> {
        self.reset_bus(link)?;
        let command = if alarm_only {
            ROM_ALARM_SEARCH
        } else {
            ROM_SEARCH
        };
        let mut echo = [command];
        self.block(link, &mut echo)?;
        if echo[0] != command {
            return Err(OneWireError::EchoMismatch {
                sent: command,
                received: echo[0],
            });
        }

        let mut triplets = search::presence_triplets(address);
        self.block(link, &mut triplets)?;
        Ok(search::triplets_confirm(&triplets, address))
    }

    fn is_present(&mut self, link: &mut LinkState, address: Address, alarm_only: bool) -> Result<bool> {
        self.prepare(link)?;
        if link.speed == Speed::Overdrive {
            return self.block_is_present(link, address, alarm_only);
        }
        let mut probe = link.seeded_for(address);
        probe.search_alarm_only = alarm_only;
        Ok(self.search(&mut probe)? && probe.address == address)
    }

    fn power_normal(&mut self, link: &mut LinkState) -> Result<()> {
        match link.power_level {
            PowerLevel::PowerDelivery => {
                self.ensure_present(link.speed)?;
                self.link.flush()?;
                let mut builder = PacketBuilder::new(&mut self.chip.transport);
                builder.send_command(FUNCTION_STOP_PULSE, true);
                builder.send_command(FUNCTION_5V_PULSE_NOW, false);
                let offset = builder.send_command(FUNCTION_STOP_PULSE, true);
                let packets = builder.finish();
                let response = self.transact(packets)?;
                if response.len() != offset + 1 {
                    return Err(OneWireError::comm(
                        "no response to stop power delivery",
                    ));
                }
                link.power_level = PowerLevel::Normal;
            }
            PowerLevel::Break => {
                self.link.set_dtr(true)?;
                self.link.set_rts(true)?;
                pause(self.port.timing.power_restore_ms);
                link.power_level = PowerLevel::Normal;
                self.chip.adapter_present = false;
                self.ensure_present(link.speed)?;
            }
            PowerLevel::ProgramPulse => link.power_level = PowerLevel::Normal,
            PowerLevel::Normal => {}
        }
        Ok(())
    }

    fn power_delivery_now(&mut self, link: &mut LinkState) -> Result<bool> {
        self.prepare(link)?;
        self.link.flush()?;
        let mut builder = PacketBuilder::new(&mut self.chip.transport);
        let offset = builder.set_parameter(PARAMETER_5V_PULSE, TIME5V_INFINITE);
        builder.send_command(FUNCTION_5V_PULSE_NOW, false);
        let packets = builder.finish();
        let response = self.transact(packets)?;
        if response.len() == offset + 1 {
            link.power_level = PowerLevel::PowerDelivery;
            return Ok(true);
        }
        Ok(false)
    }

    fn program_pulse(&mut self, link: &mut LinkState) -> Result<bool> {
        self.prepare(link)?;
        self.link.flush()?;
        let mut builder = PacketBuilder::new(&mut self.chip.transport);
        builder.set_parameter(PARAMETER_12V_PULSE, TIME12V_512US);
        builder.send_command(FUNCTION_12V_PULSE_NOW, true);
        let packets = builder.finish();
        self.transact(packets)?;
        Ok(true)
    }

    /// Reset once if the chip revision has not been seen yet.
    fn chip_revision(&mut self, link: &mut LinkState) -> Result<u8> {
        self.ensure_present(link.speed)?;
        if self.chip.transport.chip_revision == 0 {
            self.reset_bus(link)?;
        }
        Ok(self.chip.transport.chip_revision)
    }
}

fn master_reset_io(
    link: &mut dyn SerialLink,
    timing: &Ds2480Timing,
) -> std::result::Result<(), TransportError> {
    link.set_baud_rate(BaudRate::B9600.bps())?;
    link.send_break(Duration::from_millis(timing.break_ms))?;
    pause(timing.post_break_ms);
    link.flush()?;
    link.write(&[FUNCTION_RESET])?;
    link.flush()
}

/// One session on a DS2480B serial adapter.
pub struct Ds2480Adapter {
    port: Arc<Ds2480Port>,
    session: SessionId,
    link: LinkState,
}

impl Ds2480Adapter {
    pub fn open(link: Box<dyn SerialLink>, options: Ds2480Options) -> Result<Self> {
        Self::open_with_observer(link, options, Arc::new(TracingObserver))
    }

    pub fn open_with_observer(
        link: Box<dyn SerialLink>,
        options: Ds2480Options,
        observer: Arc<dyn BusObserver>,
    ) -> Result<Self> {
        let mut transport = TransportState::new(options.max_baud);
        transport.stream_resets = options.streaming.resets;
        transport.stream_bits = options.streaming.bits;
        transport.stream_bytes = options.streaming.bytes;
        transport.stream_searches = options.streaming.searches;

        let port = Arc::new(Ds2480Port {
            session: TransportSession::new(link, options.lease),
            chip: Mutex::new(ChipState {
                transport,
                adapter_present: false,
            }),
            ladder: options.ladder,
            timing: options.timing,
            observer,
        });
        Self::attach(port)
    }

    fn attach(port: Arc<Ds2480Port>) -> Result<Self> {
        let session = SessionId::next();
        port.session.attach(session)?;
        debug!(port = %port.session.port_name(), session = %session, "Session attached");
        Ok(Self {
            port,
            session,
            link: LinkState::new(),
        })
    }

    fn with_op<T>(
        &mut self,
        f: impl FnOnce(&mut Op<'_>, &mut LinkState) -> Result<T>,
    ) -> Result<T> {
        let port = Arc::clone(&self.port);
        let mut op = port.enter(self.session)?;
        f(&mut op, &mut self.link)
    }

    fn unsupported(operation: &'static str) -> OneWireError {
        OneWireError::Unsupported {
            adapter: ADAPTER_NAME,
            operation,
        }
    }
}

impl Drop for Ds2480Adapter {
    fn drop(&mut self) {
        self.port.session.detach(self.session);
    }
}

impl PortAdapter for Ds2480Adapter {
    fn adapter_name(&self) -> &str {
        ADAPTER_NAME
    }

    fn port_name(&self) -> &str {
        self.port.session.port_name()
    }

    fn session_id(&self) -> SessionId {
        self.session
    }

    fn new_session(&self) -> Result<Box<dyn PortAdapter>> {
        Ok(Box::new(Self::attach(Arc::clone(&self.port))?))
    }

    fn adapter_detected(&mut self) -> Result<bool> {
        self.with_op(|op, link| {
            if op.ensure_present(link.speed).is_err() {
                return Ok(false);
            }
            Ok(op.verify(link.speed))
        })
    }

    fn adapter_version(&mut self) -> Result<String> {
        self.with_op(|op, link| {
            let revision = op.chip_revision(link)?;
            Ok(format!("DS2480 based adapter, version {}", revision >> 2))
        })
    }

    fn has_capability(&mut self, capability: Capability) -> Result<bool> {
        match capability {
            Capability::Overdrive
            | Capability::Flex
            | Capability::DeliverPower
            | Capability::Break => Ok(true),
            Capability::Hyperdrive | Capability::DeliverSmartPower => Ok(false),
            Capability::Program => self.with_op(|op, link| {
                op.chip_revision(link)?;
                Ok(op.chip.transport.program_voltage_available)
            }),
        }
    }

    fn begin_exclusive(&mut self, blocking: bool) -> Result<bool> {
        Ok(self.port.session.begin_exclusive(self.session, blocking))
    }

    fn end_exclusive(&mut self) -> Result<()> {
        self.port.session.end_exclusive(self.session);
        Ok(())
    }

    fn find_first_device(&mut self) -> Result<bool> {
        let found = self.with_op(|op, link| search::find_first(link, |l| op.search(l)))?;
        if found {
            self.port.emit(BusEvent::DeviceFound {
                address: self.link.address,
            });
        }
        Ok(found)
    }

    fn find_next_device(&mut self) -> Result<bool> {
        let found = self.with_op(|op, link| search::find_next(link, |l| op.search(l)))?;
        if found {
            self.port.emit(BusEvent::DeviceFound {
                address: self.link.address,
            });
        }
        Ok(found)
    }

    fn address(&mut self) -> Result<Address> {
        Ok(self.link.address)
    }

    fn is_present(&mut self, address: Address) -> Result<bool> {
        self.with_op(|op, link| op.is_present(link, address, false))
    }

    fn is_alarming(&mut self, address: Address) -> Result<bool> {
        self.with_op(|op, link| op.is_present(link, address, true))
    }

    fn set_search_only_alarming(&mut self) -> Result<()> {
        self.link.set_search_only_alarming();
        Ok(())
    }

    fn set_no_reset_search(&mut self) -> Result<()> {
        self.link.set_no_reset_search();
        Ok(())
    }

    fn set_search_all(&mut self) -> Result<()> {
        self.link.set_search_all();
        Ok(())
    }

    fn target_all_families(&mut self) -> Result<()> {
        self.link.target_all_families();
        Ok(())
    }

    fn target_families(&mut self, families: &[u8]) -> Result<()> {
        self.link.target_families(families);
        Ok(())
    }

    fn exclude_families(&mut self, families: &[u8]) -> Result<()> {
        self.link.exclude_families(families);
        Ok(())
    }

    fn reset(&mut self) -> Result<ResetResult> {
        self.with_op(|op, link| op.reset_bus(link))
    }

    fn put_bit(&mut self, bit: bool) -> Result<()> {
        let echo = self.with_op(|op, link| op.touch_bit(link, bit))?;
        if echo != bit {
            return Err(OneWireError::comm("1-Wire bit echo was incorrect"));
        }
        Ok(())
    }

    fn get_bit(&mut self) -> Result<bool> {
        self.with_op(|op, link| op.touch_bit(link, true))
    }

    fn data_block(&mut self, block: &mut [u8]) -> Result<()> {
        trace!(len = block.len(), "Data block");
        self.with_op(|op, link| op.block(link, block))
    }

    fn set_power_duration(&mut self, duration: PowerDuration) -> Result<()> {
        if duration != PowerDuration::Infinite {
            return Err(Self::unsupported("finite power delivery duration"));
        }
        self.link.power_duration = duration;
        Ok(())
    }

    fn start_power_delivery(&mut self, condition: PowerCondition) -> Result<bool> {
        match condition {
            PowerCondition::AfterBit => {
                self.link.level_change_on_next_bit = true;
                Ok(false)
            }
            PowerCondition::AfterByte => {
                self.link.level_change_on_next_byte = true;
                Ok(false)
            }
            PowerCondition::Now => self.with_op(|op, link| op.power_delivery_now(link)),
        }
    }

    fn set_program_pulse_duration(&mut self, duration: PowerDuration) -> Result<()> {
        if duration != PowerDuration::Eprom {
            return Err(Self::unsupported("program pulse duration other than EPROM"));
        }
        self.link.program_pulse_duration = duration;
        Ok(())
    }

    fn start_program_pulse(&mut self, condition: PowerCondition) -> Result<bool> {
        if !lock(&self.port.chip).transport.program_voltage_available {
            return Err(Self::unsupported("program pulse without program voltage"));
        }
        if condition != PowerCondition::Now {
            return Err(Self::unsupported("deferred program pulse"));
        }
        self.with_op(|op, link| op.program_pulse(link))
    }

    fn start_break(&mut self) -> Result<()> {
        self.with_op(|op, link| {
            op.link.set_dtr(false)?;
            op.link.set_rts(false)?;
            pause(op.port.timing.break_level_ms);
            link.power_level = PowerLevel::Break;
            Ok(())
        })
    }

    fn set_power_normal(&mut self) -> Result<()> {
        self.with_op(|op, link| op.power_normal(link))
    }

    fn set_speed(&mut self, speed: Speed) -> Result<()> {
        if speed == Speed::Hyperdrive {
            return Err(Self::unsupported("hyperdrive"));
        }
        self.link.speed = speed;
        Ok(())
    }

    fn speed(&self) -> Speed {
        self.link.speed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::enumerate;
    use crate::error::ErrorKind;
    use crate::events::tests::RecordingObserver;
    use crate::sim::{Ds2480Emulator, EmulatorFault, VirtualBus};
    use crate::transport::{LinkAction, MockLink};
    use std::time::Instant;

    fn devices() -> Vec<Address> {
        vec![
            Address::with_crc(0x01, [2, 3, 4, 5, 6, 7]),
            Address::with_crc(0x10, [2, 3, 4, 5, 6, 7]),
            Address::with_crc(0x01, [2, 3, 4, 5, 6, 8]),
        ]
    }

    fn options() -> Ds2480Options {
        Ds2480Options {
            timing: Ds2480Timing::instant(),
            ..Ds2480Options::default()
        }
    }

    fn emulated(addresses: &[Address]) -> (Ds2480Adapter, Ds2480Emulator) {
        let emulator = Ds2480Emulator::new(VirtualBus::with_devices(addresses));
        let adapter = Ds2480Adapter::open(Box::new(emulator.clone()), options()).unwrap();
        (adapter, emulator)
    }

    fn sorted(mut addresses: Vec<Address>) -> Vec<Address> {
        addresses.sort();
        addresses
    }

    #[test]
    fn test_master_reset_sequence() {
        let mock = MockLink::new();
        let mut adapter = Ds2480Adapter::open(Box::new(mock.clone()), options()).unwrap();
        assert!(!adapter.adapter_detected().unwrap());

        let actions = mock.get_actions();
        assert_eq!(&actions[..3], &[
            LinkAction::Baud(9600),
            LinkAction::Break,
            LinkAction::Flush
        ]);
        assert_eq!(mock.get_writes()[0], vec![FUNCTION_RESET]);
        assert!(actions.contains(&LinkAction::Dtr(false)));
        assert!(actions.contains(&LinkAction::Rts(true)));
    }

    #[test]
    fn test_verify_accepts_scripted_echo() {
        let mock = MockLink::new();
        // four parameter echoes, baud read-back 9600, bit echo at flex speed
        mock.queue_response(&[0x16, 0x44, 0x5A, 0x3E, 0x00, 0x97]);
        mock.queue_response(&[0xCD]);
        let mut adapter = Ds2480Adapter::open(Box::new(mock.clone()), options()).unwrap();
        assert_eq!(adapter.reset().unwrap(), ResetResult::Presence);
        assert_eq!(mock.get_writes()[1], vec![0x17, 0x45, 0x5B, 0x3F, 0x0F, 0x95]);
    }

    #[test]
    fn test_alarm_presence_settles_before_next_read() {
        let mock = MockLink::new();
        mock.queue_response(&[0x16, 0x44, 0x5A, 0x3E, 0x00, 0x97]);
        mock.queue_response(&[0xCE]);
        let options = Ds2480Options {
            timing: Ds2480Timing {
                alarm_settle_ms: 30,
                ..Ds2480Timing::instant()
            },
            ..Ds2480Options::default()
        };
        let mut adapter = Ds2480Adapter::open(Box::new(mock.clone()), options).unwrap();
        assert_eq!(adapter.reset().unwrap(), ResetResult::Alarm);

        let flushes = |mock: &MockLink| {
            mock.get_actions()
                .iter()
                .filter(|a| **a == LinkAction::Flush)
                .count()
        };
        let flushes_before = flushes(&mock);
        let writes_before = mock.get_writes().len();

        mock.queue_response(&[0xCD, 0x94]);
        let started = Instant::now();
        assert_eq!(adapter.reset().unwrap(), ResetResult::Presence);
        assert!(started.elapsed() >= Duration::from_millis(30));

        // One flush ahead of the reset, one after the settle pause.
        assert_eq!(flushes(&mock) - flushes_before, 2);
        let writes = mock.get_writes();
        assert_eq!(&writes[writes_before..], &[vec![FUNCTION_RESET | USPEED_FLEX]]);

        // The settle read nothing, so the bit gets its own answer.
        assert!(!adapter.get_bit().unwrap());
        assert_eq!(mock.get_writes().len(), writes_before + 2);
    }

    #[test]
    fn test_reset_presence_and_empty_bus() {
        let (mut adapter, _) = emulated(&devices());
        assert_eq!(adapter.reset().unwrap(), ResetResult::Presence);

        let (mut empty, _) = emulated(&[]);
        assert_eq!(empty.reset().unwrap(), ResetResult::NoPresence);
    }

    #[test]
    fn test_enumeration_through_accelerator() {
        let (mut adapter, _) = emulated(&devices());
        let first = enumerate(&mut adapter).unwrap();
        assert_eq!(sorted(first.clone()), sorted(devices()));
        assert_eq!(enumerate(&mut adapter).unwrap(), first);
    }

    #[test]
    fn test_family_filters() {
        let (mut adapter, _) = emulated(&devices());
        adapter.target_families(&[0x01]).unwrap();
        let found = enumerate(&mut adapter).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|a| a.family() == 0x01));

        adapter.target_all_families().unwrap();
        adapter.exclude_families(&[0x01]).unwrap();
        assert_eq!(enumerate(&mut adapter).unwrap(), vec![devices()[1]]);
    }

    #[test]
    fn test_data_block_echoes_idle_bus() {
        let (mut adapter, _) = emulated(&devices());
        adapter.reset().unwrap();
        adapter.put_byte(ROM_SKIP).unwrap();
        let block = adapter.get_block(200).unwrap();
        assert_eq!(block, vec![0xFF; 200]);
        assert_eq!(adapter.get_byte().unwrap(), 0xFF);
    }

    #[test]
    fn test_escaped_bytes_round_trip() {
        let (mut adapter, _) = emulated(&devices());
        let mut block = [MODE_COMMAND, 0x00, MODE_COMMAND, MODE_SPECIAL];
        adapter.data_block(&mut block).unwrap();
        assert_eq!(block, [MODE_COMMAND, 0x00, MODE_COMMAND, MODE_SPECIAL]);
    }

    #[test]
    fn test_is_present_and_alarming() {
        let all = devices();
        let (mut adapter, emulator) = emulated(&all);
        emulator.bus().lock().unwrap().set_alarming(all[2], true);

        assert!(adapter.is_present(all[1]).unwrap());
        assert!(!adapter.is_present(Address::with_crc(0x28, [1, 1, 1, 1, 1, 1])).unwrap());
        assert!(adapter.is_alarming(all[2]).unwrap());
        assert!(!adapter.is_alarming(all[0]).unwrap());
    }

    #[test]
    fn test_overdrive_negotiates_baud_and_uses_block_presence() {
        let all = devices();
        let (mut adapter, emulator) = emulated(&all);
        adapter.set_speed(Speed::Overdrive).unwrap();

        adapter.get_byte().unwrap();
        assert_eq!(emulator.chip_baud(), BaudRate::B115200);

        assert!(adapter.is_present(all[0]).unwrap());
        assert!(!adapter.is_present(Address::with_crc(0x28, [1, 1, 1, 1, 1, 1])).unwrap());

        let found = enumerate(&mut adapter).unwrap();
        assert_eq!(emulator.chip_baud(), BaudRate::B57600);
        assert_eq!(found.len(), 3);
    }

    #[test]
    fn test_hyperdrive_is_rejected() {
        let (mut adapter, _) = emulated(&[]);
        let err = adapter.set_speed(Speed::Hyperdrive).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Setup);
        assert_eq!(adapter.speed(), Speed::Regular);
    }

    #[test]
    fn test_dead_adapter_is_unreachable() {
        let emulator = Ds2480Emulator::new(VirtualBus::new());
        emulator.set_fault(EmulatorFault::Dead);
        let mut adapter = Ds2480Adapter::open(Box::new(emulator), options()).unwrap();
        let err = adapter.reset().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AdapterUnreachable);
        assert!(!adapter.adapter_detected().unwrap());
    }

    #[test]
    fn test_power_cycle_rung_recovers() {
        let emulator = Ds2480Emulator::new(VirtualBus::with_devices(&devices()));
        emulator.set_fault(EmulatorFault::NeedsPowerCycle);
        let observer = Arc::new(RecordingObserver::default());
        let mut adapter =
            Ds2480Adapter::open_with_observer(Box::new(emulator), options(), observer.clone())
                .unwrap();
        assert_eq!(adapter.reset().unwrap(), ResetResult::Presence);

        let steps: Vec<LadderStep> = observer
            .events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                BusEvent::LadderStep { step, .. } => Some(*step),
                _ => None,
            })
            .collect();
        assert_eq!(steps, vec![
            LadderStep::MasterReset,
            LadderStep::MasterReset,
            LadderStep::PowerReset
        ]);
    }

    #[test]
    fn test_lost_adapter_reruns_ladder() {
        let (mut adapter, emulator) = emulated(&devices());
        adapter.reset().unwrap();

        emulator.set_fault(EmulatorFault::Dead);
        assert_eq!(adapter.reset().unwrap_err().kind(), ErrorKind::Communication);

        emulator.set_fault(EmulatorFault::None);
        assert_eq!(adapter.reset().unwrap(), ResetResult::Presence);
    }

    #[test]
    fn test_power_delivery_now_and_normal() {
        let (mut adapter, emulator) = emulated(&devices());
        assert!(adapter.start_power_delivery(PowerCondition::Now).unwrap());
        assert!(emulator.strong_pullup());
        adapter.set_power_normal().unwrap();
        assert!(!emulator.strong_pullup());
    }

    #[test]
    fn test_power_after_byte_primes_last_bit() {
        let (mut adapter, emulator) = emulated(&devices());
        assert!(!adapter.start_power_delivery(PowerCondition::AfterByte).unwrap());
        assert_eq!(adapter.get_byte().unwrap(), 0xFF);
        assert!(emulator.strong_pullup());
        // next operation drops the pull-up first
        adapter.reset().unwrap();
        assert!(!emulator.strong_pullup());
    }

    #[test]
    fn test_power_after_bit() {
        let (mut adapter, emulator) = emulated(&devices());
        adapter.start_power_delivery(PowerCondition::AfterBit).unwrap();
        adapter.put_bit(true).unwrap();
        assert!(emulator.strong_pullup());
        adapter.set_power_normal().unwrap();
        assert!(!emulator.strong_pullup());
    }

    #[test]
    fn test_program_pulse_requires_voltage() {
        let (mut adapter, emulator) = emulated(&devices());
        assert!(!adapter.has_capability(Capability::Program).unwrap());
        assert!(adapter.start_program_pulse(PowerCondition::Now).is_err());

        emulator.set_program_voltage(true);
        adapter.reset().unwrap();
        assert!(adapter.has_capability(Capability::Program).unwrap());
        assert!(adapter.start_program_pulse(PowerCondition::Now).unwrap());
        assert!(adapter.start_program_pulse(PowerCondition::AfterBit).is_err());
    }

    #[test]
    fn test_break_and_restore() {
        let (mut adapter, _) = emulated(&devices());
        adapter.reset().unwrap();
        adapter.start_break().unwrap();
        adapter.set_power_normal().unwrap();
        assert_eq!(adapter.reset().unwrap(), ResetResult::Presence);
    }

    #[test]
    fn test_duration_limits() {
        let (mut adapter, _) = emulated(&[]);
        assert!(adapter.set_power_duration(PowerDuration::Infinite).is_ok());
        assert!(adapter.set_power_duration(PowerDuration::OneSecond).is_err());
        assert!(adapter.set_program_pulse_duration(PowerDuration::Eprom).is_ok());
        assert!(adapter.set_program_pulse_duration(PowerDuration::Infinite).is_err());
    }

    #[test]
    fn test_version_string() {
        let (mut adapter, _) = emulated(&devices());
        assert_eq!(
            adapter.adapter_version().unwrap(),
            "DS2480 based adapter, version 3"
        );
    }

    #[test]
    fn test_sessions_share_the_lease() {
        let (mut first, _) = emulated(&devices());
        let mut second = first.new_session().unwrap();
        assert_ne!(first.session_id(), second.session_id());

        assert!(first.begin_exclusive(false).unwrap());
        assert!(!second.begin_exclusive(false).unwrap());
        first.end_exclusive().unwrap();
        assert!(second.begin_exclusive(false).unwrap());
        second.end_exclusive().unwrap();
    }

    #[test]
    fn test_sessions_keep_separate_cursors() {
        let (mut first, _) = emulated(&devices());
        let mut second = first.new_session().unwrap();
        second.target_families(&[0x10]).unwrap();

        assert!(first.find_first_device().unwrap());
        assert!(second.find_first_device().unwrap());
        assert_eq!(second.address().unwrap().family(), 0x10);
        assert!(!second.find_next_device().unwrap());
        assert!(first.find_next_device().unwrap());
    }
}
