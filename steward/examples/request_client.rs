//! Request client.
//!
//! Sends its command-line arguments to `svc.echo` and prints the reply.
//!
//! ```sh
//! cargo run --example request_client -- "hello there"
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

    let body: Vec<Bytes> = std::env::args()
        .skip(1)
        .map(|arg| Bytes::from(arg.into_bytes()))
        .collect();
    let body = if body.is_empty() {
        vec![Bytes::from_static(b"hello")]
    } else {
        body
    };

    let mut client = Client::connect("tcp://127.0.0.1:5555", FabricConfig::default()).await?;
    let reply = client.request("svc.echo", body).await?;

    for frame in &reply {
        info!("{}", String::from_utf8_lossy(frame));
    }
    client.close();
    Ok(())
}
