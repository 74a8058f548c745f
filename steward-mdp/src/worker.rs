//! Worker endpoint.
//!
//! Presents a local "receive a request, produce a reply" handle while hiding
//! reconnection, heartbeating and protocol framing. The worker is in one of
//! three states: *disconnected*, *idle* (registered, waiting for a request)
//! or *busy* (between a received request and its final reply). Any transport
//! loss or broker silence beyond the liveness window drops it back to
//! disconnected, from where it re-dials with exponential back-off and sends
//! a fresh READY.

use bytes::Bytes;
use compio::io::{AsyncRead, AsyncWrite};
use compio::net::TcpStream;
use flume::{Receiver, Sender};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::command::{BrokerToWorker, WorkerToBroker};
use crate::connection::{Connection, Redial};
use steward_core::config::FabricConfig;
use steward_core::endpoint::Endpoint;
use steward_core::error::{Result, StewardError};
use steward_core::reconnect::ReconnectState;

/// Upper bound on one blocking poll inside `recv()`, so close requests and
/// expired timers are noticed quickly.
const CLOSE_POLL: Duration = Duration::from_millis(100);

/// Opaque return address for one received request.
///
/// Workers never inspect the client identity; they hand it back with each
/// reply chunk.
#[derive(Debug, Clone)]
pub struct ReplyHandle {
    client: Bytes,
}

/// Clonable handle that makes a blocked [`Worker::recv`] return
/// [`StewardError::Closed`] promptly.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    tx: Sender<()>,
}

impl CloseHandle {
    pub fn close(&self) {
        let _ = self.tx.send(());
    }
}

/// A service worker.
///
/// # Example
///
/// ```rust,no_run
/// use steward_mdp::Worker;
/// use steward_core::config::FabricConfig;
///
/// #[compio::main]
/// async fn main() -> steward_core::error::Result<()> {
///     let mut worker =
///         Worker::connect("tcp://127.0.0.1:5555", "svc.echo", FabricConfig::default()).await?;
///     loop {
///         let (body, reply) = worker.recv().await?;
///         worker.send_final(&reply, body).await?;
///     }
/// }
/// ```
pub struct Worker<S = TcpStream>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn: Option<Connection<S>>,
    endpoint: Endpoint,
    service: String,
    config: FabricConfig,
    reconnect: ReconnectState,
    /// Broker presumed dead past this instant
    deadline: Instant,
    /// Next heartbeat due
    heartbeat_at: Instant,
    closed: bool,
    close_tx: Sender<()>,
    close_rx: Receiver<()>,
}

impl Worker<TcpStream> {
    /// Connect to a broker over TCP and register for `service`.
    pub async fn connect(endpoint: &str, service: &str, config: FabricConfig) -> Result<Self> {
        Self::connect_endpoint(Endpoint::parse(endpoint)?, service, config).await
    }
}

#[cfg(unix)]
impl Worker<compio::net::UnixStream> {
    /// Connect to a broker over IPC and register for `service`.
    pub async fn connect_ipc(endpoint: &str, service: &str, config: FabricConfig) -> Result<Self> {
        Self::connect_endpoint(Endpoint::parse(endpoint)?, service, config).await
    }
}

impl<S> Worker<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Redial,
{
    async fn connect_endpoint(
        endpoint: Endpoint,
        service: &str,
        config: FabricConfig,
    ) -> Result<Self> {
        let (close_tx, close_rx) = flume::unbounded();
        let reconnect = ReconnectState::new(&config);
        let now = Instant::now();
        let mut worker = Self {
            conn: None,
            endpoint,
            service: service.to_owned(),
            reconnect,
            deadline: config.expiry_deadline(now),
            heartbeat_at: now + config.heartbeat_interval,
            config,
            closed: false,
            close_tx,
            close_rx,
        };
        // Fail fast if the broker is unreachable at construction time;
        // later losses are handled by the reconnect loop in recv().
        worker.establish().await?;
        Ok(worker)
    }

    /// Dial the broker, send READY and reset the liveness timers.
    async fn establish(&mut self) -> Result<()> {
        let stream = S::dial(&self.endpoint).await?;
        let mut conn = Connection::new(stream, &self.config);
        conn.send(
            &WorkerToBroker::Ready {
                service: Bytes::copy_from_slice(self.service.as_bytes()),
            }
            .into_frames(),
        )
        .await?;

        let now = Instant::now();
        self.deadline = self.config.expiry_deadline(now);
        self.heartbeat_at = now + self.config.heartbeat_interval;
        self.conn = Some(conn);
        self.reconnect.reset();
        info!(
            "[WORKER] Registered for {} at {}",
            self.service, self.endpoint
        );
        Ok(())
    }

    /// Wait for the next request.
    ///
    /// Suspends until the broker hands over work, transparently sending
    /// heartbeats and reconnecting when the broker goes quiet. Returns
    /// [`StewardError::Closed`] once the worker is closed.
    pub async fn recv(&mut self) -> Result<(Vec<Bytes>, ReplyHandle)> {
        loop {
            if self.closed || self.close_rx.try_recv().is_ok() {
                self.goodbye().await;
                return Err(StewardError::Closed);
            }

            if self.conn.as_ref().map_or(true, |c| !c.is_connected()) {
                if let Err(e) = self.establish().await {
                    let delay = self.reconnect.next_delay();
                    warn!(
                        "[WORKER] Connect to {} failed ({}), retrying in {:?}",
                        self.endpoint, e, delay
                    );
                    // Stay responsive to close() while backing off.
                    if let Ok(Ok(())) =
                        compio::time::timeout(delay, self.close_rx.recv_async()).await
                    {
                        self.closed = true;
                    }
                }
                continue;
            }

            let now = Instant::now();
            if now >= self.deadline {
                warn!(
                    "[WORKER] Broker silent for {:?}, reconnecting",
                    self.config.liveness_window()
                );
                self.conn = None;
                continue;
            }
            if now >= self.heartbeat_at {
                let beat = WorkerToBroker::Heartbeat.into_frames();
                if let Some(conn) = self.conn.as_mut() {
                    if let Err(e) = conn.send(&beat).await {
                        debug!("[WORKER] Heartbeat failed: {}", e);
                        self.conn = None;
                        continue;
                    }
                }
                self.heartbeat_at = now + self.config.heartbeat_interval;
            }

            // Sleep until whichever timer fires first, or traffic arrives.
            // The wait is capped so a close() from another task is observed
            // promptly even on a quiet connection.
            let wake = self.heartbeat_at.min(self.deadline);
            let wait = wake
                .saturating_duration_since(now)
                .max(Duration::from_millis(1))
                .min(CLOSE_POLL);
            let Some(conn) = self.conn.as_mut() else {
                continue;
            };
            match conn.recv_timeout(wait).await {
                Ok(Some(frames)) => {
                    // Any inbound frame is a liveness signal.
                    self.deadline = self.config.expiry_deadline(Instant::now());
                    match BrokerToWorker::parse(&frames) {
                        Ok(BrokerToWorker::Request { client, body }) => {
                            debug!("[WORKER] Request for {} from {:?}", self.service, client);
                            return Ok((body, ReplyHandle { client }));
                        }
                        Ok(BrokerToWorker::Heartbeat) => {}
                        Ok(BrokerToWorker::Disconnect) => {
                            info!("[WORKER] Broker requested disconnect, re-registering");
                            self.conn = None;
                        }
                        Err(e) => {
                            warn!("[WORKER] Dropping invalid broker message: {}", e);
                        }
                    }
                }
                Ok(None) => {
                    debug!("[WORKER] Broker closed the connection");
                    self.conn = None;
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    debug!("[WORKER] Transport error: {}", e);
                    self.conn = None;
                }
            }
        }
    }

    /// Emit one non-terminal response chunk.
    pub async fn send_partial(&mut self, handle: &ReplyHandle, body: Vec<Bytes>) -> Result<()> {
        self.send_reply(handle, body, false).await
    }

    /// Emit the terminal response chunk; the worker returns to idle.
    pub async fn send_final(&mut self, handle: &ReplyHandle, body: Vec<Bytes>) -> Result<()> {
        self.send_reply(handle, body, true).await
    }

    async fn send_reply(&mut self, handle: &ReplyHandle, body: Vec<Bytes>, last: bool) -> Result<()> {
        if self.closed {
            // In-flight replies after close() are no-ops.
            return Ok(());
        }
        let Some(conn) = self.conn.as_mut() else {
            return Err(StewardError::SocketClosed);
        };
        let cmd = if last {
            WorkerToBroker::Final {
                client: handle.client.clone(),
                body,
            }
        } else {
            WorkerToBroker::Partial {
                client: handle.client.clone(),
                body,
            }
        };
        match conn.send(&cmd.into_frames()).await {
            Ok(()) => {
                // Replies count as outbound traffic; push the heartbeat out.
                self.heartbeat_at = Instant::now() + self.config.heartbeat_interval;
                Ok(())
            }
            Err(e) => {
                self.conn = None;
                Err(e.into())
            }
        }
    }

    /// Send DISCONNECT and release resources.
    ///
    /// After close, `recv()` returns [`StewardError::Closed`] and replies
    /// become no-ops.
    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.goodbye().await;
        }
    }

    /// Get a handle that can close this worker from another task.
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            tx: self.close_tx.clone(),
        }
    }

    /// The service this worker registered under.
    pub fn service(&self) -> &str {
        &self.service
    }

    async fn goodbye(&mut self) {
        self.closed = true;
        if let Some(conn) = self.conn.as_mut() {
            let _ = conn.send(&WorkerToBroker::Disconnect.into_frames()).await;
        }
        self.conn = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compio::net::TcpListener;

    async fn listener_endpoint() -> (TcpListener, String) {
        let port = portpicker::pick_unused_port().expect("free port");
        let addr = format!("127.0.0.1:{}", port);
        let listener = TcpListener::bind(&addr).await.unwrap();
        (listener, format!("tcp://{}", addr))
    }

    #[compio::test]
    async fn test_connect_sends_ready() {
        let (listener, endpoint) = listener_endpoint().await;

        let accept = compio::runtime::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream, &FabricConfig::default());
            conn.recv_timeout(Duration::from_secs(2)).await.unwrap().unwrap()
        });

        let _worker = Worker::connect(&endpoint, "svc.echo", FabricConfig::default())
            .await
            .unwrap();

        let frames = accept.await;
        assert_eq!(
            WorkerToBroker::parse(&frames).unwrap(),
            WorkerToBroker::Ready {
                service: Bytes::from_static(b"svc.echo"),
            }
        );
    }

    #[compio::test]
    async fn test_close_handle_interrupts_recv() {
        let (listener, endpoint) = listener_endpoint().await;

        let accept = compio::runtime::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Hold the socket open without answering.
            compio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let mut worker = Worker::connect(&endpoint, "svc.echo", FabricConfig::default())
            .await
            .unwrap();
        let close = worker.close_handle();

        compio::runtime::spawn(async move {
            compio::time::sleep(Duration::from_millis(50)).await;
            close.close();
        })
        .detach();

        let result = worker.recv().await;
        assert!(matches!(result, Err(StewardError::Closed)));

        // Replies after close are no-ops.
        let handle = ReplyHandle {
            client: Bytes::from_static(b"peer-1"),
        };
        assert!(worker.send_final(&handle, vec![]).await.is_ok());

        drop(accept);
    }

    #[compio::test]
    async fn test_connect_refused_fails_fast() {
        let port = portpicker::pick_unused_port().expect("free port");
        let endpoint = format!("tcp://127.0.0.1:{}", port);
        let result = Worker::connect(&endpoint, "svc.echo", FabricConfig::default()).await;
        assert!(matches!(result, Err(StewardError::Io(_))));
    }
}
