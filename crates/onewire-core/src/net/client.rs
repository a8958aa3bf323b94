//! Remote adapter reached through a proxy server.

use std::io::{BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

use byteorder::{ReadBytesExt, WriteBytesExt};
use tracing::{debug, instrument, warn};

use super::constants::{CHALLENGE_LEN, Command, PROTOCOL_VERSION, RET_FAILURE, RET_SUCCESS};
use super::wire::{WireRead, WireWrite, auth_response};
use crate::adapter::{Capability, PortAdapter};
use crate::address::Address;
use crate::error::{OneWireError, Result};
use crate::protocol::constants::{ROM_ALARM_SEARCH, ROM_SEARCH};
use crate::search;
use crate::state::link::{PowerCondition, PowerDuration, ResetResult, Speed};
use crate::transport::SessionId;

const ADAPTER_NAME: &str = "NetAdapter";

/// [`PortAdapter`] that forwards every call to a proxy server.
///
/// Each instance holds one TCP connection, which the server maps to its own
/// adapter session. The speed is mirrored locally so [`PortAdapter::speed`]
/// needs no round trip.
pub struct NetAdapter {
    addr: SocketAddr,
    secret: String,
    port_name: String,
    session: SessionId,
    input: BufReader<TcpStream>,
    output: BufWriter<TcpStream>,
    speed: Speed,
    /// This handle holds the remote lease through `begin_exclusive`.
    exclusive: bool,
}

impl NetAdapter {
    /// Connect and authenticate with `secret`.
    #[instrument(skip_all)]
    pub fn connect(addr: impl ToSocketAddrs, secret: &str) -> Result<Self> {
        let stream = addr
            .to_socket_addrs()?
            .find_map(|candidate| TcpStream::connect(candidate).ok())
            .ok_or_else(|| OneWireError::comm("no reachable proxy address"))?;
        stream.set_nodelay(true)?;
        let addr = stream.peer_addr()?;

        let mut input = BufReader::new(stream.try_clone()?);
        let mut output = BufWriter::new(stream);
        handshake(&mut input, &mut output, secret)?;
        debug!(addr = %addr, "Connected to proxy");

        Ok(Self {
            addr,
            secret: secret.to_string(),
            port_name: addr.to_string(),
            session: SessionId::next(),
            input,
            output,
            speed: Speed::Regular,
            exclusive: false,
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Keep-alive round trip.
    pub fn ping(&mut self) -> Result<()> {
        self.request(Command::Ping, &[])
    }

    /// Ask the server for this session's speed instead of the local mirror.
    pub fn remote_speed(&mut self) -> Result<Speed> {
        self.request(Command::GetSpeed, &[])?;
        let speed = Speed::from_code(self.input.read_i32_be()?)?;
        self.speed = speed;
        Ok(speed)
    }

    /// Send one command frame and read its status.
    fn request(&mut self, command: Command, args: &[u8]) -> Result<()> {
        self.output.write_u8(command.code())?;
        self.output.write_all(args)?;
        self.output.flush()?;
        match self.input.read_u8()? {
            RET_SUCCESS => Ok(()),
            RET_FAILURE => Err(OneWireError::Remote(self.input.read_utf()?)),
            other => Err(OneWireError::comm(format!(
                "unexpected status 0x{other:02X} from proxy"
            ))),
        }
    }

    fn request_bool(&mut self, command: Command, args: &[u8]) -> Result<bool> {
        self.request(command, args)?;
        Ok(self.input.read_bool()?)
    }

    fn request_with_int(&mut self, command: Command, value: i32) -> Result<()> {
        self.request(command, &value.to_be_bytes())
    }

    fn request_with_block(&mut self, command: Command, block: &[u8]) -> Result<()> {
        let mut args = Vec::with_capacity(4 + block.len());
        args.write_block(block)?;
        self.request(command, &args)
    }

    fn presence_probe(&mut self, address: Address, alarm_only: bool) -> Result<bool> {
        if !self.reset()?.is_presence() {
            return Ok(false);
        }
        self.put_byte(if alarm_only { ROM_ALARM_SEARCH } else { ROM_SEARCH })?;
        let mut triplets = search::presence_triplets(address);
        self.data_block(&mut triplets)?;
        Ok(search::triplets_confirm(&triplets, address))
    }

    /// Hold the remote lease across a multi-frame operation.
    fn with_exclusive<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let acquired = !self.exclusive;
        if acquired && !self.begin_exclusive(true)? {
            return Err(OneWireError::comm("remote adapter busy"));
        }
        let result = f(self);
        if acquired && let Err(e) = self.end_exclusive() {
            warn!(error = %e, "Releasing remote lease failed");
            self.exclusive = false;
        }
        result
    }
}

/// Client side of the version exchange and challenge/response.
fn handshake<R: Read, W: Write>(input: &mut R, output: &mut W, secret: &str) -> Result<()> {
    let version = input.read_i32_be()?;
    if version != PROTOCOL_VERSION {
        output.write_u8(RET_FAILURE)?;
        output.flush()?;
        return Err(OneWireError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: version,
        });
    }
    output.write_u8(RET_SUCCESS)?;
    output.flush()?;

    let mut challenge = [0u8; CHALLENGE_LEN];
    input.read_exact(&mut challenge)?;
    output.write_i32_be(auth_response(secret, &challenge))?;
    output.flush()?;

    match input.read_u8()? {
        RET_SUCCESS => Ok(()),
        _ => Err(OneWireError::AuthenticationFailed(input.read_utf()?)),
    }
}

impl Drop for NetAdapter {
    fn drop(&mut self) {
        let _ = self.output.write_u8(Command::Close.code());
        let _ = self.output.flush();
    }
}

impl PortAdapter for NetAdapter {
    fn adapter_name(&self) -> &str {
        ADAPTER_NAME
    }

    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn session_id(&self) -> SessionId {
        self.session
    }

    fn new_session(&self) -> Result<Box<dyn PortAdapter>> {
        Ok(Box::new(Self::connect(self.addr, &self.secret)?))
    }

    fn adapter_detected(&mut self) -> Result<bool> {
        Ok(self.ping().is_ok())
    }

    fn adapter_version(&mut self) -> Result<String> {
        Ok(format!("{ADAPTER_NAME}, version {PROTOCOL_VERSION}"))
    }

    fn has_capability(&mut self, capability: Capability) -> Result<bool> {
        let command = match capability {
            Capability::Overdrive => Command::CanOverdrive,
            Capability::Hyperdrive => Command::CanHyperdrive,
            Capability::Flex => Command::CanFlex,
            Capability::Program => Command::CanProgram,
            Capability::DeliverPower => Command::CanDeliverPower,
            Capability::DeliverSmartPower => Command::CanDeliverSmartPower,
            Capability::Break => Command::CanBreak,
        };
        self.request_bool(command, &[])
    }

    fn begin_exclusive(&mut self, blocking: bool) -> Result<bool> {
        let granted = self.request_bool(Command::BeginExclusive, &[u8::from(blocking)])?;
        self.exclusive |= granted;
        Ok(granted)
    }

    fn end_exclusive(&mut self) -> Result<()> {
        self.request(Command::EndExclusive, &[])?;
        self.exclusive = false;
        Ok(())
    }

    fn find_first_device(&mut self) -> Result<bool> {
        self.request_bool(Command::FindFirstDevice, &[])
    }

    fn find_next_device(&mut self) -> Result<bool> {
        self.request_bool(Command::FindNextDevice, &[])
    }

    fn address(&mut self) -> Result<Address> {
        self.request(Command::GetAddress, &[])?;
        let mut bytes = [0u8; 8];
        self.input.read_exact(&mut bytes)?;
        Ok(Address::new(bytes))
    }

    fn is_present(&mut self, address: Address) -> Result<bool> {
        self.with_exclusive(|this| this.presence_probe(address, false))
    }

    fn is_alarming(&mut self, address: Address) -> Result<bool> {
        self.with_exclusive(|this| this.presence_probe(address, true))
    }

    fn set_search_only_alarming(&mut self) -> Result<()> {
        self.request(Command::SetSearchOnlyAlarming, &[])
    }

    fn set_no_reset_search(&mut self) -> Result<()> {
        self.request(Command::SetNoResetSearch, &[])
    }

    fn set_search_all(&mut self) -> Result<()> {
        self.request(Command::SetSearchAll, &[])
    }

    fn target_all_families(&mut self) -> Result<()> {
        self.request(Command::TargetAllFamilies, &[])
    }

    fn target_families(&mut self, families: &[u8]) -> Result<()> {
        self.request_with_block(Command::TargetFamily, families)
    }

    fn exclude_families(&mut self, families: &[u8]) -> Result<()> {
        self.request_with_block(Command::ExcludeFamily, families)
    }

    fn reset(&mut self) -> Result<ResetResult> {
        self.request(Command::Reset, &[])?;
        ResetResult::from_code(self.input.read_i32_be()?)
    }

    fn put_bit(&mut self, bit: bool) -> Result<()> {
        self.request(Command::PutBit, &[u8::from(bit)])
    }

    fn get_bit(&mut self) -> Result<bool> {
        self.request_bool(Command::GetBit, &[])
    }

    fn data_block(&mut self, block: &mut [u8]) -> Result<()> {
        self.request_with_block(Command::DataBlock, block)?;
        self.input.read_exact(block)?;
        Ok(())
    }

    fn put_byte(&mut self, byte: u8) -> Result<()> {
        self.request(Command::PutByte, &[byte])
    }

    fn get_byte(&mut self) -> Result<u8> {
        self.request(Command::GetByte, &[])?;
        Ok(self.input.read_u8()?)
    }

    fn get_block(&mut self, len: usize) -> Result<Vec<u8>> {
        let wire_len = i32::try_from(len).map_err(|_| OneWireError::invalid("block too long"))?;
        self.request_with_int(Command::GetBlock, wire_len)?;
        Ok(self.input.read_bytes(len)?)
    }

    fn set_power_duration(&mut self, duration: PowerDuration) -> Result<()> {
        self.request_with_int(Command::SetPowerDuration, duration.code())
    }

    fn start_power_delivery(&mut self, condition: PowerCondition) -> Result<bool> {
        self.request_bool(Command::StartPowerDelivery, &condition.code().to_be_bytes())
    }

    fn set_program_pulse_duration(&mut self, duration: PowerDuration) -> Result<()> {
        self.request_with_int(Command::SetProgramPulseDuration, duration.code())
    }

    fn start_program_pulse(&mut self, condition: PowerCondition) -> Result<bool> {
        self.request_bool(Command::StartProgramPulse, &condition.code().to_be_bytes())
    }

    fn start_break(&mut self) -> Result<()> {
        self.request(Command::StartBreak, &[])
    }

    fn set_power_normal(&mut self) -> Result<()> {
        self.request(Command::SetPowerNormal, &[])
    }

    fn set_speed(&mut self, speed: Speed) -> Result<()> {
        self.request_with_int(Command::SetSpeed, speed.code())?;
        self.speed = speed;
        Ok(())
    }

    fn speed(&self) -> Speed {
        self.speed
    }
}
