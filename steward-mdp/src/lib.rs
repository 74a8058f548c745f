//! # Steward MDP
//!
//! **Internal protocol and endpoint implementation crate for Steward.**
//!
//! ⚠️ **This is an internal implementation detail. Use the `steward` crate for the public API.**
//!
//! This crate implements the Majordomo service-request protocol on top of a
//! length-prefixed multipart stream framing:
//!
//! - **Broker**: single point of contact; routes client requests to workers,
//!   queues when no worker is idle, runs the heartbeat/expiry loop and the
//!   reserved `mmi.` management namespace
//! - **Worker**: registers under a service name, receives requests, replies
//!   with partial/final chunks, heartbeats and reconnects
//! - **Client**: sends requests addressed to a service name and awaits
//!   correlated replies, with bounded retry
//!
//! ## Features
//!
//! - **Zero-copy**: Frames use `Bytes` for efficient sharing
//! - **`io_uring`**: High-performance async I/O via `compio`
//! - **Single-threaded confinement**: all broker routing state lives on one
//!   event loop; no locks

// Allow some pedantic lints
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)] // Style preference

mod connection;

// Wire protocol
pub mod codec;
pub mod command;

// Roles
pub mod broker;
pub mod client;
pub mod worker;

// Re-export the main types for clean API
pub use broker::{Broker, StopHandle};
pub use client::{Client, Reply, ReplyStream};
pub use worker::{CloseHandle, ReplyHandle, Worker};

/// Prelude module for convenient imports
///
/// ```rust
/// use steward_mdp::prelude::*;
/// ```
pub mod prelude {
    pub use super::{Broker, Client, CloseHandle, Reply, ReplyHandle, StopHandle, Worker};
    pub use bytes::Bytes;
    pub use steward_core::config::FabricConfig;
}
