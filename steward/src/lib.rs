//! # Steward
//!
//! A reliable service-request broker fabric in the Majordomo pattern:
//! many clients address requests to named services, a pool of workers
//! serves them, and a single broker in the middle routes, queues,
//! heartbeats and evicts.
//!
//! ## Roles
//!
//! - [`Broker`]: binds one endpoint, owns all routing state, answers the
//!   reserved `mmi.` management namespace internally
//! - [`Worker`]: registers under a service name and turns requests into
//!   replies, reconnecting with back-off when the broker vanishes
//! - [`Client`]: sends a request and awaits the correlated reply (or a
//!   stream of partial chunks), retrying on broker silence
//!
//! ## Example
//!
//! ```rust,no_run
//! use steward::{Broker, Client, FabricConfig, Worker};
//! use bytes::Bytes;
//!
//! #[compio::main]
//! async fn main() -> steward::Result<()> {
//!     let broker = Broker::bind("tcp://127.0.0.1:5555", FabricConfig::default()).await?;
//!     compio::runtime::spawn(broker.run()).detach();
//!
//!     let mut worker =
//!         Worker::connect("tcp://127.0.0.1:5555", "svc.echo", FabricConfig::default()).await?;
//!     compio::runtime::spawn(async move {
//!         while let Ok((body, reply)) = worker.recv().await {
//!             let _ = worker.send_final(&reply, body).await;
//!         }
//!     })
//!     .detach();
//!
//!     let mut client = Client::connect("tcp://127.0.0.1:5555", FabricConfig::default()).await?;
//!     let reply = client
//!         .request("svc.echo", vec![Bytes::from_static(b"hello")])
//!         .await?;
//!     assert_eq!(reply, vec![Bytes::from_static(b"hello")]);
//!     Ok(())
//! }
//! ```

pub mod dev_tracing;

pub use steward_core::config::FabricConfig;
pub use steward_core::endpoint::{Endpoint, EndpointError};
pub use steward_core::error::{Result, StewardError};
pub use steward_core::message::Message;

pub use steward_mdp::{
    Broker, Client, CloseHandle, Reply, ReplyHandle, ReplyStream, StopHandle, Worker,
};

// Re-export for downstream convenience
pub use bytes;
