//! Session, chip and adapter-presence state.

pub mod link;
pub mod machine;
pub mod transport;

pub use link::{LinkState, PowerCondition, PowerDuration, PowerLevel, ResetResult, Speed};
pub use machine::{LadderPolicy, LadderStep, PresenceLadder, PresenceState};
pub use transport::{BaudRate, Operation, SpeedParameters, TransportState};
