//! Server-side command dispatch.
//!
//! One call to [`handle_request`] reads a command byte and its arguments,
//! runs it against the session's adapter and writes the response frame.
//! Adapter failures become a failure frame and keep the connection open;
//! stream errors are returned for the caller to tear the connection down.

use std::io::{self, Read, Write};

use byteorder::{ReadBytesExt, WriteBytesExt};
use tracing::{debug, trace};

use super::constants::{Command, RET_FAILURE, RET_SUCCESS};
use super::wire::{WireRead, WireWrite};
use crate::adapter::{Capability, PortAdapter};
use crate::error::{OneWireError, Result};
use crate::state::link::{PowerCondition, PowerDuration, Speed};

/// What the connection loop should do after a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleResult {
    Continue,
    /// Client sent CLOSE.
    Close,
}

/// Streams and adapter for one proxied session.
pub struct HandlerContext<'a, R: Read, W: Write> {
    pub input: &'a mut R,
    pub output: &'a mut W,
    pub adapter: &'a mut dyn PortAdapter,
}

/// Serve one request from `ctx.input`.
pub fn handle_request<R: Read, W: Write>(ctx: &mut HandlerContext<'_, R, W>) -> io::Result<HandleResult> {
    let code = ctx.input.read_u8()?;
    let Some(command) = Command::from_code(code) else {
        debug!(code = %format!("0x{code:02X}"), "Unknown proxy command");
        respond(ctx.output, Err(OneWireError::invalid(format!("unknown command 0x{code:02X}"))))?;
        return Ok(HandleResult::Continue);
    };
    trace!(?command, "Proxy command");

    let input = &mut *ctx.input;
    let adapter = &mut *ctx.adapter;
    let reply = match command {
        Command::Close => return Ok(HandleResult::Close),
        Command::Ping => Ok(Vec::new()),

        // ---- data ----
        Command::Reset => adapter.reset().and_then(|r| int_payload(r.code())),
        Command::PutBit => {
            let bit = input.read_bool()?;
            adapter.put_bit(bit).map(|()| Vec::new())
        }
        Command::PutByte => {
            let byte = input.read_u8()?;
            adapter.put_byte(byte).map(|()| Vec::new())
        }
        Command::GetBit => adapter.get_bit().and_then(bool_payload),
        Command::GetByte => adapter.get_byte().map(|b| vec![b]),
        Command::GetBlock => {
            let len = input.read_len()?;
            adapter.get_block(len)
        }
        Command::DataBlock => {
            let len = input.read_len()?;
            let mut block = input.read_bytes(len)?;
            adapter.data_block(&mut block).map(|()| block)
        }

        // ---- power ----
        Command::SetPowerDuration => {
            let code = input.read_i32_be()?;
            PowerDuration::from_code(code)
                .and_then(|d| adapter.set_power_duration(d))
                .map(|()| Vec::new())
        }
        Command::StartPowerDelivery => {
            let code = input.read_i32_be()?;
            PowerCondition::from_code(code)
                .and_then(|c| adapter.start_power_delivery(c))
                .and_then(bool_payload)
        }
        Command::SetProgramPulseDuration => {
            let code = input.read_i32_be()?;
            PowerDuration::from_code(code)
                .and_then(|d| adapter.set_program_pulse_duration(d))
                .map(|()| Vec::new())
        }
        Command::StartProgramPulse => {
            let code = input.read_i32_be()?;
            PowerCondition::from_code(code)
                .and_then(|c| adapter.start_program_pulse(c))
                .and_then(bool_payload)
        }
        Command::StartBreak => adapter.start_break().map(|()| Vec::new()),
        Command::SetPowerNormal => adapter.set_power_normal().map(|()| Vec::new()),

        // ---- speed ----
        Command::SetSpeed => {
            let code = input.read_i32_be()?;
            Speed::from_code(code)
                .and_then(|s| adapter.set_speed(s))
                .map(|()| Vec::new())
        }
        Command::GetSpeed => int_payload(adapter.speed().code()),

        // ---- exclusive ----
        Command::BeginExclusive => {
            let blocking = input.read_bool()?;
            adapter.begin_exclusive(blocking).and_then(bool_payload)
        }
        Command::EndExclusive => adapter.end_exclusive().map(|()| Vec::new()),

        // ---- search ----
        Command::FindFirstDevice => adapter.find_first_device().and_then(bool_payload),
        Command::FindNextDevice => adapter.find_next_device().and_then(bool_payload),
        Command::GetAddress => adapter.address().map(|a| a.bytes().to_vec()),
        Command::SetSearchOnlyAlarming => adapter.set_search_only_alarming().map(|()| Vec::new()),
        Command::SetNoResetSearch => adapter.set_no_reset_search().map(|()| Vec::new()),
        Command::SetSearchAll => adapter.set_search_all().map(|()| Vec::new()),
        Command::TargetAllFamilies => adapter.target_all_families().map(|()| Vec::new()),
        Command::TargetFamily => {
            let len = input.read_len()?;
            let families = input.read_bytes(len)?;
            adapter.target_families(&families).map(|()| Vec::new())
        }
        Command::ExcludeFamily => {
            let len = input.read_len()?;
            let families = input.read_bytes(len)?;
            adapter.exclude_families(&families).map(|()| Vec::new())
        }

        // ---- capabilities ----
        Command::CanBreak => capability(adapter, Capability::Break),
        Command::CanDeliverPower => capability(adapter, Capability::DeliverPower),
        Command::CanDeliverSmartPower => capability(adapter, Capability::DeliverSmartPower),
        Command::CanFlex => capability(adapter, Capability::Flex),
        Command::CanHyperdrive => capability(adapter, Capability::Hyperdrive),
        Command::CanOverdrive => capability(adapter, Capability::Overdrive),
        Command::CanProgram => capability(adapter, Capability::Program),
    };

    respond(ctx.output, reply)?;
    Ok(HandleResult::Continue)
}

fn capability(adapter: &mut dyn PortAdapter, capability: Capability) -> Result<Vec<u8>> {
    adapter.has_capability(capability).and_then(bool_payload)
}

fn bool_payload(value: bool) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(1);
    payload.write_bool(value)?;
    Ok(payload)
}

fn int_payload(value: i32) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(4);
    payload.write_i32_be(value)?;
    Ok(payload)
}

/// Status byte plus payload, or failure byte plus message.
fn respond<W: Write>(output: &mut W, reply: Result<Vec<u8>>) -> io::Result<()> {
    match reply {
        Ok(payload) => {
            output.write_u8(RET_SUCCESS)?;
            output.write_all(&payload)?;
        }
        Err(err) => {
            debug!(error = %err, "Proxy command failed");
            output.write_u8(RET_FAILURE)?;
            output.write_utf(&err.to_string())?;
        }
    }
    output.flush()
}
