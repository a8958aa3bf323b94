//! onewire-core: 1-Wire bus master in Rust.
//!
//! This crate drives a 1-Wire bus through a DS2480-based serial bridge or a
//! passive DS9097-style adapter, and can share an adapter over TCP.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Search**: Discrepancy search and family filtering over any bus
//! - **Protocol**: Bridge-chip constants, packet builder and response decoding
//! - **Transport**: Serial link abstraction (serialport, mock), sessions and
//!   the exclusive lease
//! - **State**: Per-session link state, chip state and the presence ladder
//! - **Adapter**: The `PortAdapter` facade and its implementations
//! - **Net**: Proxy server, remote client and discovery beacon
//! - **Events**: Observer pattern for UI decoupling
//! - **Sim**: Virtual bus and chip emulators for tests and demos
//!
//! # Example
//!
//! ```no_run
//! use onewire_core::adapter::{AnyAdapter, PortAdapter, enumerate};
//! use onewire_core::config::BridgeConfig;
//!
//! let mut config = BridgeConfig::default();
//! config.adapter.port = Some("/dev/ttyUSB0".to_string());
//!
//! let mut adapter = AnyAdapter::from_config(&config).expect("open adapter");
//! for address in enumerate(&mut adapter).expect("search failed") {
//!     println!("{address}");
//! }
//! ```

pub mod adapter;
pub mod address;
pub mod config;
pub mod crc;
pub mod error;
pub mod events;
pub mod net;
pub mod protocol;
pub mod search;
pub mod sim;
pub mod state;
pub mod transport;

mod sync;

// Re-exports for convenience
pub use adapter::{AnyAdapter, Capability, PortAdapter, enumerate};
pub use address::Address;
pub use config::BridgeConfig;
pub use error::{ErrorKind, OneWireError, Result};
pub use events::{BusEvent, BusObserver, LogLevel, NullObserver, TracingObserver};
pub use net::{DiscoveryBeacon, NetAdapter, ProxyServer, ServerHandle, ServerOptions, discover};
pub use state::{PowerCondition, PowerDuration, ResetResult, Speed};
pub use transport::{SerialLink, SerialPortLink, SessionId, TransportError};
