//! Management probe.
//!
//! Queries the broker's reserved `mmi.` namespace: service availability,
//! worker census and broker metadata.
//!
//! ```sh
//! cargo run --example mmi_probe -- svc.echo
//! ```

use steward::bytes::Bytes;
use steward::{Client, FabricConfig};
use tracing::info;

#[compio::main]
async fn main() -> steward::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let service = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "svc.echo".to_string());
    let name = Bytes::from(service.clone().into_bytes());

    let mut client = Client::connect("tcp://127.0.0.1:5555", FabricConfig::default()).await?;

    let status = client.request("mmi.service", vec![name.clone()]).await?;
    info!(
        "mmi.service {} -> {}",
        service,
        String::from_utf8_lossy(&status[0])
    );

    let census = client.request("mmi.workers", vec![name]).await?;
    info!(
        "mmi.workers {} -> {}",
        service,
        String::from_utf8_lossy(&census[0])
    );

    let meta = client.request("mmi.broker", vec![]).await?;
    if meta.len() == 3 {
        info!(
            "broker version={} uptime={}s services={}",
            String::from_utf8_lossy(&meta[0]),
            String::from_utf8_lossy(&meta[1]),
            String::from_utf8_lossy(&meta[2]),
        );
    }

    client.close();
    Ok(())
}
