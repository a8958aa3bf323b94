//! Protocol module - bridge-chip packet protocol.

pub mod constants;
pub mod packet;
pub mod response;

pub use packet::{Packet, PacketBuilder};
pub use response::{
    interpret_bit, interpret_primed_byte, interpret_reset, interpret_search, search_sequence,
};
