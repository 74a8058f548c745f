//! Broker: the single point of contact for the fabric.
//!
//! The broker accepts every peer on one endpoint and tells clients and
//! workers apart by the protocol-identifier frame, not by address. Each
//! accepted socket gets a peer actor task; all routing state lives in
//! [`state::BrokerState`], driven by one hub loop that multiplexes peer
//! events with the heartbeat tick.

mod mmi;
pub(crate) mod peer;
pub(crate) mod state;

use compio::io::{AsyncRead, AsyncWrite};
use compio::net::TcpListener;
use flume::{Receiver, Sender};
use futures::FutureExt;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::broker::peer::PeerEvent;
use crate::broker::state::BrokerState;
use steward_core::config::FabricConfig;
use steward_core::endpoint::Endpoint;
use steward_core::error::Result;

/// The broker endpoint.
///
/// # Example
///
/// ```rust,no_run
/// use steward_mdp::Broker;
/// use steward_core::config::FabricConfig;
///
/// #[compio::main]
/// async fn main() -> steward_core::error::Result<()> {
///     let broker = Broker::bind("tcp://127.0.0.1:5555", FabricConfig::default()).await?;
///     let stop = broker.stop_handle();
///     // stop.stop() from a signal handler or another task ends run()
///     broker.run().await
/// }
/// ```
pub struct Broker {
    listener: Listener,
    endpoint: Endpoint,
    config: FabricConfig,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
}

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(compio::net::UnixListener),
}

/// Clonable handle that requests orderly broker shutdown.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Sender<()>,
}

impl StopHandle {
    /// Ask the broker to shut down. Safe to call from any thread; calling
    /// more than once is harmless.
    pub fn stop(&self) {
        let _ = self.tx.send(());
    }
}

impl Broker {
    /// Bind the broker to a transport endpoint.
    ///
    /// This is the only fatal failure point: everything after a successful
    /// bind is logged and survived.
    pub async fn bind(endpoint: &str, config: FabricConfig) -> Result<Self> {
        let endpoint = Endpoint::parse(endpoint)?;
        let listener = match &endpoint {
            Endpoint::Tcp(addr) => Listener::Tcp(TcpListener::bind(addr).await?),
            #[cfg(unix)]
            Endpoint::Ipc(path) => Listener::Unix(steward_core::ipc::bind(path).await?),
        };
        let (stop_tx, stop_rx) = flume::unbounded();
        info!("[BROKER] Listening on {}", endpoint);
        Ok(Self {
            listener,
            endpoint,
            config,
            stop_tx,
            stop_rx,
        })
    }

    /// Get a handle for requesting shutdown from elsewhere.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    /// The endpoint this broker is bound to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Run the event loop until a stop is requested.
    ///
    /// On shutdown every known worker receives a DISCONNECT and all peer
    /// connections are closed.
    pub async fn run(self) -> Result<()> {
        let (events_tx, events_rx) = flume::unbounded();

        // Accept loop owns the listener; dropping its task on exit stops
        // new connections.
        let accept_task = compio::runtime::spawn(accept_loop(
            self.listener,
            self.config.clone(),
            events_tx,
        ));

        let mut state = BrokerState::new(self.config.clone());
        let interval = self.config.heartbeat_interval;
        let mut next_tick = Instant::now() + interval;

        loop {
            let wait = next_tick.saturating_duration_since(Instant::now());
            let tick = compio::time::sleep(wait).fuse();
            futures::pin_mut!(tick);

            futures::select! {
                event = events_rx.recv_async().fuse() => match event {
                    Ok(event) => state.handle_event(event, Instant::now()),
                    Err(_) => break, // accept loop gone
                },
                _ = self.stop_rx.recv_async().fuse() => {
                    info!("[BROKER] Stop requested");
                    break;
                }
                _ = tick => {
                    state.tick(Instant::now());
                    next_tick = Instant::now() + interval;
                }
            }
        }

        drop(accept_task);
        state.shutdown();
        // Peer actors drain their close commands before run() returns.
        compio::time::sleep(Duration::from_millis(50)).await;
        info!("[BROKER] Stopped");
        Ok(())
    }
}

async fn accept_loop(listener: Listener, config: FabricConfig, events: Sender<PeerEvent>) {
    loop {
        match &listener {
            Listener::Tcp(listener) => match listener.accept().await {
                Ok((stream, addr)) => {
                    if let Err(e) = steward_core::tcp::enable_tcp_nodelay(&stream) {
                        debug!("[BROKER] TCP_NODELAY failed for {}: {}", addr, e);
                    }
                    debug!("[BROKER] Accepted connection from {}", addr);
                    spawn_peer(stream, &config, &events);
                }
                Err(e) => {
                    error!("[BROKER] Accept error: {}", e);
                }
            },
            #[cfg(unix)]
            Listener::Unix(listener) => match listener.accept().await {
                Ok((stream, _addr)) => {
                    debug!("[BROKER] Accepted IPC connection");
                    spawn_peer(stream, &config, &events);
                }
                Err(e) => {
                    error!("[BROKER] Accept error: {}", e);
                }
            },
        }
    }
}

fn spawn_peer<S>(stream: S, config: &FabricConfig, events: &Sender<PeerEvent>)
where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
{
    let identity = peer::next_identity();
    let (cmd_tx, cmd_rx) = flume::unbounded();

    // Register before the actor can emit messages, so the hub always knows
    // the identity by the time traffic arrives on the shared event channel.
    let _ = events.send(PeerEvent::Up {
        identity: identity.clone(),
        tx: cmd_tx,
    });
    compio::runtime::spawn(peer::run_peer(
        identity,
        stream,
        config.clone(),
        events.clone(),
        cmd_rx,
    ))
    .detach();
}
