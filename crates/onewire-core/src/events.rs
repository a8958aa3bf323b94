//! Event system for consumer decoupling.
//!
//! Lets the CLI (or any embedding application) follow adapter and proxy
//! activity without tight coupling to the core logic.

use std::fmt;
use std::net::SocketAddr;

use crate::address::Address;
use crate::state::machine::LadderStep;
use crate::state::transport::BaudRate;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Serial packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // host -> adapter
    Rx, // adapter -> host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted by adapters and the network proxy.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// Presence ladder confirmed the adapter.
    AdapterDetected { port: String, adapter: String },
    /// Adapter stopped answering; the ladder will run on next use.
    AdapterLost { port: String, reason: String },
    /// One recovery step of the presence ladder.
    LadderStep { port: String, step: LadderStep },
    /// Host/adapter UART speed changed.
    BaudChanged { port: String, baud: BaudRate },
    /// Bytes sent to or received from the adapter.
    Packet {
        direction: PacketDirection,
        length: usize,
        data: Option<Vec<u8>>,
    },
    /// A search returned a device.
    DeviceFound { address: Address },
    /// Proxy accepted a TCP connection.
    ClientConnected { peer: SocketAddr },
    /// Proxy rejected a client's challenge answer.
    AuthenticationFailed { peer: SocketAddr },
    ClientDisconnected { peer: SocketAddr },
    /// Proxy accept loop exited.
    ServerStopped,
    /// Free-form log message.
    Log { level: LogLevel, message: String },
}

/// Observer trait for receiving bus events.
///
/// Implement this trait in the application layer to receive updates.
pub trait BusObserver: Send + Sync {
    fn on_event(&self, event: &BusEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl BusObserver for NullObserver {
    fn on_event(&self, _event: &BusEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl BusObserver for TracingObserver {
    fn on_event(&self, event: &BusEvent) {
        match event {
            BusEvent::AdapterDetected { port, adapter } => {
                tracing::info!(port = %port, adapter = %adapter, "Adapter detected");
            }
            BusEvent::AdapterLost { port, reason } => {
                tracing::warn!(port = %port, reason = %reason, "Adapter lost");
            }
            BusEvent::LadderStep { port, step } => {
                tracing::debug!(port = %port, step = %step, "Presence ladder step");
            }
            BusEvent::BaudChanged { port, baud } => {
                tracing::debug!(port = %port, baud = %baud, "Baud changed");
            }
            BusEvent::Packet {
                direction,
                length,
                data,
            } => match data {
                Some(bytes) => {
                    tracing::trace!(dir = %direction, len = length, data = ?bytes, "Serial packet");
                }
                None => tracing::trace!(dir = %direction, len = length, "Serial packet"),
            },
            BusEvent::DeviceFound { address } => {
                tracing::debug!(address = %address, "Device found");
            }
            BusEvent::ClientConnected { peer } => {
                tracing::info!(peer = %peer, "Client connected");
            }
            BusEvent::AuthenticationFailed { peer } => {
                tracing::warn!(peer = %peer, "Client authentication failed");
            }
            BusEvent::ClientDisconnected { peer } => {
                tracing::info!(peer = %peer, "Client disconnected");
            }
            BusEvent::ServerStopped => {
                tracing::info!("Proxy server stopped");
            }
            BusEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
        }
    }
}
