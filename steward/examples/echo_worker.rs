//! Echo worker.
//!
//! Registers under `svc.echo` and returns every request body unchanged.
//!
//! ```sh
//! cargo run --example echo_worker [tcp://127.0.0.1:5555]
//! ```

use steward::{FabricConfig, Worker};
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

    let mut worker = Worker::connect(&endpoint, "svc.echo", FabricConfig::default()).await?;
    info!("Echoing on {}", worker.service());

    let mut served = 0u64;
    loop {
        let (body, reply) = worker.recv().await?;
        served += 1;
        info!("Request #{} ({} frames)", served, body.len());
        worker.send_final(&reply, body).await?;
    }
}
