//! Steward Core
//!
//! This crate contains the transport-agnostic building blocks of the
//! steward service fabric:
//! - Multipart message builder (`message`)
//! - Endpoint parsing for TCP and IPC transports (`endpoint`)
//! - Fabric-wide timing and queue configuration (`config`)
//! - Reconnection backoff tracking (`reconnect`)
//! - Error types (`error`)
//! - Low-level TCP/IPC socket helpers (`tcp`, `ipc`)

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod endpoint;
pub mod error;
pub mod ipc;
pub mod message;
pub mod reconnect;
pub mod tcp;

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::config::FabricConfig;
    pub use crate::endpoint::{Endpoint, EndpointError};
    pub use crate::error::{Result, StewardError};
    pub use crate::message::Message;
    pub use crate::reconnect::ReconnectState;
}
