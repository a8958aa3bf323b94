//! Bus-master facade and its implementations.
//!
//! Every transport (bridge chip, bit-bang serial, simulated bus, network
//! proxy client) implements [`PortAdapter`]; [`AnyAdapter`] selects one at
//! construction time from configuration.

pub mod any;
pub mod ds2480;
pub mod ds9097;
pub mod sim;

use std::fmt;

pub use any::AnyAdapter;
pub use ds2480::{Ds2480Adapter, Ds2480Options, Ds2480Timing, StreamingFlags};
pub use ds9097::Ds9097Adapter;
pub use sim::SimAdapter;

use crate::address::Address;
use crate::error::{OneWireError, Result};
use crate::state::link::{PowerCondition, PowerDuration, ResetResult, Speed};
use crate::transport::SessionId;

/// Optional adapter features a caller can query before relying on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Overdrive,
    Hyperdrive,
    Flex,
    /// 12 V program pulse for EPROM devices.
    Program,
    /// Strong pull-up for parasitically powered devices.
    DeliverPower,
    /// Strong pull-up that ends when the device stops drawing current.
    DeliverSmartPower,
    Break,
}

impl Capability {
    pub const ALL: [Capability; 7] = [
        Capability::Overdrive,
        Capability::Hyperdrive,
        Capability::Flex,
        Capability::Program,
        Capability::DeliverPower,
        Capability::DeliverSmartPower,
        Capability::Break,
    ];
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Overdrive => write!(f, "overdrive"),
            Capability::Hyperdrive => write!(f, "hyperdrive"),
            Capability::Flex => write!(f, "flex"),
            Capability::Program => write!(f, "program"),
            Capability::DeliverPower => write!(f, "deliver power"),
            Capability::DeliverSmartPower => write!(f, "deliver smart power"),
            Capability::Break => write!(f, "break"),
        }
    }
}

/// Public bus-master API.
///
/// Each handle is one session: it owns its search cursor, filters, speed
/// and power level, and shares the physical adapter (and its exclusive
/// lease) with every other handle created through [`new_session`].
///
/// [`new_session`]: PortAdapter::new_session
pub trait PortAdapter: Send {
    fn adapter_name(&self) -> &str;

    fn port_name(&self) -> &str;

    fn session_id(&self) -> SessionId;

    /// Another handle on the same physical adapter with its own session.
    fn new_session(&self) -> Result<Box<dyn PortAdapter>>;

    // ---- adapter detection ----

    fn adapter_detected(&mut self) -> Result<bool>;

    fn adapter_version(&mut self) -> Result<String>;

    fn has_capability(&mut self, capability: Capability) -> Result<bool>;

    // ---- exclusive access ----

    /// Claim the adapter for this session. Re-entrant; with `blocking` set,
    /// waits up to the lease policy's bound.
    fn begin_exclusive(&mut self, blocking: bool) -> Result<bool>;

    /// Give up the claim. A no-op unless this session holds it.
    fn end_exclusive(&mut self) -> Result<()>;

    // ---- search ----

    fn find_first_device(&mut self) -> Result<bool>;

    fn find_next_device(&mut self) -> Result<bool>;

    /// Device found by the last successful search.
    fn address(&mut self) -> Result<Address>;

    fn is_present(&mut self, address: Address) -> Result<bool>;

    fn is_alarming(&mut self, address: Address) -> Result<bool>;

    fn set_search_only_alarming(&mut self) -> Result<()>;

    fn set_no_reset_search(&mut self) -> Result<()>;

    fn set_search_all(&mut self) -> Result<()>;

    fn target_all_families(&mut self) -> Result<()>;

    fn target_families(&mut self, families: &[u8]) -> Result<()>;

    fn exclude_families(&mut self, families: &[u8]) -> Result<()>;

    // ---- data ----

    fn reset(&mut self) -> Result<ResetResult>;

    fn put_bit(&mut self, bit: bool) -> Result<()>;

    fn get_bit(&mut self) -> Result<bool>;

    /// Exchange `block` with the bus in place: each byte is written and
    /// replaced by what was read back.
    fn data_block(&mut self, block: &mut [u8]) -> Result<()>;

    /// Write one byte; a differing echo means the bus is shorted.
    fn put_byte(&mut self, byte: u8) -> Result<()> {
        let mut block = [byte];
        self.data_block(&mut block)?;
        if block[0] != byte {
            return Err(OneWireError::EchoMismatch {
                sent: byte,
                received: block[0],
            });
        }
        Ok(())
    }

    fn get_byte(&mut self) -> Result<u8> {
        let mut block = [0xFF];
        self.data_block(&mut block)?;
        Ok(block[0])
    }

    fn get_block(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut block = vec![0xFF; len];
        self.data_block(&mut block)?;
        Ok(block)
    }

    // ---- power ----

    fn set_power_duration(&mut self, duration: PowerDuration) -> Result<()>;

    /// True once the strong pull-up is actually on; arming it for the next
    /// bit or byte returns false.
    fn start_power_delivery(&mut self, condition: PowerCondition) -> Result<bool>;

    fn set_program_pulse_duration(&mut self, duration: PowerDuration) -> Result<()>;

    fn start_program_pulse(&mut self, condition: PowerCondition) -> Result<bool>;

    /// Hold the bus low until [`set_power_normal`](PortAdapter::set_power_normal).
    fn start_break(&mut self) -> Result<()>;

    fn set_power_normal(&mut self) -> Result<()>;

    // ---- speed ----

    fn set_speed(&mut self, speed: Speed) -> Result<()>;

    fn speed(&self) -> Speed;
}

/// Every device on the bus, in search order, leaving the cursor exhausted.
pub fn enumerate(adapter: &mut dyn PortAdapter) -> Result<Vec<Address>> {
    let mut found = Vec::new();
    let mut more = adapter.find_first_device()?;
    while more {
        found.push(adapter.address()?);
        more = adapter.find_next_device()?;
    }
    Ok(found)
}
