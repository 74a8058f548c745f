/// Steward Error Types
///
/// Error handling shared by the broker and the client/worker endpoints.
use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::endpoint::EndpointError;

/// Main error type for fabric operations
#[derive(Error, Debug)]
pub enum StewardError {
    /// IO error during socket operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or inconsistent frame sequence
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid or unsupported endpoint address
    #[error("Endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    /// A request received no reply within the configured window
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The transport was closed underneath us
    #[error("Socket closed")]
    SocketClosed,

    /// The endpoint was closed locally
    #[error("Endpoint closed")]
    Closed,
}

/// Result type alias for fabric operations
pub type Result<T> = std::result::Result<T, StewardError>;

impl StewardError {
    /// Create a protocol error with a message
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Check if this error is a request timeout
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Check if this is a transport-level failure
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_) | Self::SocketClosed)
    }

    /// Check if this error is recoverable by reconnecting
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io(e) => !matches!(
                e.kind(),
                io::ErrorKind::AddrInUse | io::ErrorKind::PermissionDenied
            ),
            Self::SocketClosed | Self::Timeout(_) => true,
            Self::Protocol(_) | Self::Endpoint(_) | Self::Closed => false,
        }
    }
}
