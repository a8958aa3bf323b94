//! Transport layer module.

pub mod lease;
pub mod mock;
pub mod serial;
pub mod session;
pub mod traits;

pub use lease::{ExclusiveLease, LeasePolicy, LocalExclusive, SessionId};
pub use mock::{LinkAction, MockLink};
pub use serial::SerialPortLink;
pub use session::TransportSession;
pub use traits::{SerialLink, TransportError, read_timeout_for};
