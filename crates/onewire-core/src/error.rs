//! Error taxonomy for bus-master operations.

use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportError;

pub type Result<T> = std::result::Result<T, OneWireError>;

/// Coarse classification callers can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad arguments or configuration. Never retried.
    Setup,
    /// The presence ladder ran out of steps.
    AdapterUnreachable,
    /// Transport I/O failed mid-operation; presence is re-checked next time.
    Communication,
}

#[derive(Error, Debug)]
pub enum OneWireError {
    #[error("Port not selected")]
    PortNotSelected,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{operation} not supported by {adapter}")]
    Unsupported {
        adapter: &'static str,
        operation: &'static str,
    },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: i32, actual: i32 },

    #[error("Adapter not detected on {port}")]
    AdapterNotDetected { port: String },

    #[error("Communication failure: {0}")]
    Communication(String),

    #[error("Echo mismatch: sent 0x{sent:02X}, got 0x{received:02X}")]
    EchoMismatch { sent: u8, received: u8 },

    #[error("Exclusive access not granted within {0:?}")]
    ExclusiveTimeout(Duration),

    #[error("Remote adapter error: {0}")]
    Remote(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),
}

impl OneWireError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OneWireError::PortNotSelected
            | OneWireError::InvalidArgument(_)
            | OneWireError::Unsupported { .. }
            | OneWireError::AuthenticationFailed(_)
            | OneWireError::VersionMismatch { .. } => ErrorKind::Setup,
            OneWireError::AdapterNotDetected { .. } => ErrorKind::AdapterUnreachable,
            OneWireError::Communication(_)
            | OneWireError::EchoMismatch { .. }
            | OneWireError::ExclusiveTimeout(_)
            | OneWireError::Remote(_)
            | OneWireError::Transport(_)
            | OneWireError::Network(_) => ErrorKind::Communication,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        OneWireError::InvalidArgument(message.into())
    }

    pub(crate) fn comm(message: impl Into<String>) -> Self {
        OneWireError::Communication(message.into())
    }
}
