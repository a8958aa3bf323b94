//! Network proxy: expose a local adapter over TCP and reach it remotely.
//!
//! - [`ProxyServer`] hosts an adapter, one session per client connection.
//! - [`NetAdapter`] is the client side, itself a [`PortAdapter`].
//! - [`DiscoveryBeacon`] and [`discover`] find servers on the local network.
//!
//! [`PortAdapter`]: crate::adapter::PortAdapter

pub mod beacon;
pub mod client;
pub mod constants;
pub mod handlers;
pub mod server;
pub mod wire;

pub use beacon::{DiscoveryBeacon, discover};
pub use client::NetAdapter;
pub use constants::Command;
pub use server::{ProxyServer, ServerHandle, ServerOptions};
