//! Complete fabric demo in one process.
//!
//! Architecture:
//! ```text
//! Clients  →  Broker (tcp://127.0.0.1:5555)  →  Workers
//!                 ↕ heartbeats / eviction
//! ```
//!
//! Demonstrates:
//! - Worker registration with READY + heartbeats
//! - Queueing while no worker is available
//! - Worker crash, eviction and client retry
//! - Management namespace probes

use std::time::Duration;
use steward::bytes::Bytes;
use steward::{Broker, Client, FabricConfig, Worker};
use tracing::{error, info};

const ENDPOINT: &str = "tcp://127.0.0.1:5555";

fn config() -> FabricConfig {
    FabricConfig::default()
        .with_heartbeat_interval(Duration::from_millis(1000))
        .with_request_timeout(Duration::from_millis(2500))
}

/// Worker that echoes, optionally crashing after a number of requests.
async fn worker(id: u32, crash_after: Option<u32>) -> steward::Result<()> {
    let mut worker = Worker::connect(ENDPOINT, "svc.echo", config()).await?;
    info!("[worker-{}] registered", id);

    let mut count = 0u32;
    loop {
        let (body, reply) = worker.recv().await?;
        count += 1;

        if crash_after.is_some_and(|n| count >= n) {
            error!("[worker-{}] simulated crash before reply #{}", id, count);
            // Drop the transport without replying; the broker evicts us and
            // the client's retry lands on a surviving worker.
            return Ok(());
        }

        info!("[worker-{}] request #{}", id, count);
        let mut out = vec![Bytes::from(format!("worker-{}:", id))];
        out.extend(body);
        worker.send_final(&reply, out).await?;
    }
}

async fn client(requests: u32) -> steward::Result<()> {
    // Give the broker and workers a moment to come up.
    compio::time::sleep(Duration::from_millis(300)).await;
    let mut client = Client::connect(ENDPOINT, config()).await?;

    for i in 1..=requests {
        let body = vec![Bytes::from(format!("request-{}", i))];
        match client.request("svc.echo", body).await {
            Ok(reply) => {
                for frame in &reply {
                    info!("[client] reply {}: {}", i, String::from_utf8_lossy(frame));
                }
            }
            Err(e) => error!("[client] request {} failed: {}", i, e),
        }
        compio::time::sleep(Duration::from_millis(400)).await;
    }

    // Census after the flaky worker died.
    let census = client.request("mmi.workers", vec![Bytes::from_static(b"svc.echo")]).await?;
    info!(
        "[client] mmi.workers svc.echo -> {}",
        String::from_utf8_lossy(&census[0])
    );

    client.close();
    Ok(())
}

#[compio::main]
async fn main() -> steward::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let broker = Broker::bind(ENDPOINT, config()).await?;
    let stop = broker.stop_handle();
    compio::runtime::spawn(broker.run()).detach();

    compio::runtime::spawn(async {
        if let Err(e) = worker(1, None).await {
            error!("[worker-1] {}", e);
        }
    })
    .detach();
    compio::runtime::spawn(async {
        if let Err(e) = worker(2, Some(2)).await {
            error!("[worker-2] {}", e);
        }
    })
    .detach();

    client(6).await?;

    stop.stop();
    compio::time::sleep(Duration::from_millis(200)).await;
    info!("Demo complete");
    Ok(())
}
