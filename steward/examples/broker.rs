//! Broker daemon.
//!
//! Binds the fabric endpoint and routes until killed.
//!
//! ```sh
//! cargo run --example broker [tcp://127.0.0.1:5555]
//! ```

use steward::{Broker, FabricConfig};
use tracing::info;

#[compio::main]
async fn main() -> steward::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let endpoint = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "tcp://127.0.0.1:5555".to_string());

    let broker = Broker::bind(&endpoint, FabricConfig::default()).await?;
    info!("Broker up on {}", broker.endpoint());
    broker.run().await
}
