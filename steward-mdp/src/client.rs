//! Client endpoint.
//!
//! Issues requests addressed to a service name and awaits correlated
//! replies. A reply is either a single FINAL or a run of PARTIAL chunks
//! terminated by one FINAL. On broker silence the client re-sends the same
//! request a bounded number of times over a fresh connection, then fails
//! with a timeout.

use bytes::Bytes;
use compio::io::{AsyncRead, AsyncWrite};
use compio::net::TcpStream;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::command::{BrokerToClient, ClientToBroker};
use crate::connection::{Connection, Redial};
use steward_core::config::FabricConfig;
use steward_core::endpoint::Endpoint;
use steward_core::error::{Result, StewardError};

/// One reply chunk from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Service that produced the reply
    pub service: Bytes,
    /// Body frames
    pub body: Vec<Bytes>,
    /// True for the terminal chunk of a reply
    pub last: bool,
}

/// A requester.
///
/// Not thread-safe; concurrent callers must serialize externally.
///
/// # Example
///
/// ```rust,no_run
/// use steward_mdp::Client;
/// use steward_core::config::FabricConfig;
/// use bytes::Bytes;
///
/// #[compio::main]
/// async fn main() -> steward_core::error::Result<()> {
///     let mut client = Client::connect("tcp://127.0.0.1:5555", FabricConfig::default()).await?;
///     let reply = client
///         .request("svc.echo", vec![Bytes::from_static(b"hello")])
///         .await?;
///     println!("{:?}", reply);
///     Ok(())
/// }
/// ```
pub struct Client<S = TcpStream>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn: Option<Connection<S>>,
    endpoint: Endpoint,
    config: FabricConfig,
}

impl Client<TcpStream> {
    /// Connect to a broker over TCP.
    pub async fn connect(endpoint: &str, config: FabricConfig) -> Result<Self> {
        Self::connect_endpoint(Endpoint::parse(endpoint)?, config).await
    }
}

#[cfg(unix)]
impl Client<compio::net::UnixStream> {
    /// Connect to a broker over IPC.
    pub async fn connect_ipc(endpoint: &str, config: FabricConfig) -> Result<Self> {
        Self::connect_endpoint(Endpoint::parse(endpoint)?, config).await
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Redial,
{
    async fn connect_endpoint(endpoint: Endpoint, config: FabricConfig) -> Result<Self> {
        let mut client = Self {
            conn: None,
            endpoint,
            config,
        };
        client.ensure_connected().await?;
        Ok(client)
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.conn.as_ref().map_or(false, |c| c.is_connected()) {
            return Ok(());
        }
        let stream = S::dial(&self.endpoint).await?;
        self.conn = Some(Connection::new(stream, &self.config));
        debug!("[CLIENT] Connected to {}", self.endpoint);
        Ok(())
    }

    /// Enqueue one request for transmission to `service`.
    pub async fn send(&mut self, service: &str, body: Vec<Bytes>) -> Result<()> {
        self.ensure_connected().await?;
        let frames = ClientToBroker::Request {
            service: Bytes::copy_from_slice(service.as_bytes()),
            body,
        }
        .into_frames();
        let Some(conn) = self.conn.as_mut() else {
            return Err(StewardError::SocketClosed);
        };
        match conn.send(&frames).await {
            Ok(()) => {
                trace!("[CLIENT] Sent request to {}", service);
                Ok(())
            }
            Err(e) => {
                self.conn = None;
                Err(e.into())
            }
        }
    }

    /// Wait up to `timeout` for the next reply chunk.
    ///
    /// Inbound messages that fail validation (wrong revision tag, unknown
    /// command) are dropped; a request whose reply was malformed surfaces
    /// as a timeout, exactly like a lost one.
    pub async fn recv(&mut self, timeout: Duration) -> Result<Reply> {
        let deadline = Instant::now() + timeout;
        loop {
            let Some(conn) = self.conn.as_mut() else {
                return Err(StewardError::SocketClosed);
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StewardError::Timeout(timeout));
            }
            match conn.recv_timeout(remaining).await {
                Ok(Some(frames)) => match BrokerToClient::parse(&frames) {
                    Ok(BrokerToClient::Partial { service, body }) => {
                        return Ok(Reply {
                            service,
                            body,
                            last: false,
                        });
                    }
                    Ok(BrokerToClient::Final { service, body }) => {
                        return Ok(Reply {
                            service,
                            body,
                            last: true,
                        });
                    }
                    Err(e) => {
                        warn!("[CLIENT] Dropping invalid broker message: {}", e);
                    }
                },
                Ok(None) => {
                    self.conn = None;
                    return Err(StewardError::SocketClosed);
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(StewardError::Timeout(timeout));
                }
                Err(e) => {
                    self.conn = None;
                    return Err(e.into());
                }
            }
        }
    }

    /// Send a request and wait for its FINAL reply, with bounded retry.
    ///
    /// On each timeout the request is re-sent over a fresh connection (so
    /// stale replies from an earlier attempt cannot be mistaken for the
    /// retry's); after `request_retries` re-sends the call fails with
    /// [`StewardError::Timeout`]. Partial chunks are not surfaced here; use
    /// [`Client::stream`] for chunked replies.
    pub async fn request(&mut self, service: &str, body: Vec<Bytes>) -> Result<Vec<Bytes>> {
        let timeout = self.config.request_timeout;
        let attempts = self.config.request_retries + 1;

        for attempt in 1..=attempts {
            if attempt > 1 {
                info!(
                    "[CLIENT] No reply from {}, retrying ({}/{})",
                    service, attempt, attempts
                );
                // A fresh connection discards replies addressed to the
                // previous attempt's identity.
                self.conn = None;
            }
            self.send(service, body.clone()).await?;

            let deadline = Instant::now() + timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break; // next attempt
                }
                match self.recv(remaining).await {
                    Ok(reply) if reply.service == service.as_bytes() => {
                        if reply.last {
                            return Ok(reply.body);
                        }
                        trace!("[CLIENT] Ignoring partial chunk in request()");
                    }
                    Ok(reply) => {
                        debug!(
                            "[CLIENT] Ignoring reply for unrelated service {:?}",
                            reply.service
                        );
                    }
                    Err(StewardError::Timeout(_)) => break, // next attempt
                    Err(StewardError::SocketClosed) => {
                        // Transport dropped mid-wait; retry over a new dial.
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Err(StewardError::Timeout(timeout))
    }

    /// Send a request and return its reply as a lazy, finite stream of body
    /// chunks. The stream yields each PARTIAL in arrival order, then the
    /// FINAL, then ends. It is not restartable.
    pub async fn stream(&mut self, service: &str, body: Vec<Bytes>) -> Result<ReplyStream<'_, S>> {
        self.send(service, body).await?;
        Ok(ReplyStream {
            client: self,
            done: false,
        })
    }

    /// Release the transport.
    pub fn close(&mut self) {
        self.conn = None;
    }
}

/// Lazy reply sequence produced by [`Client::stream`].
pub struct ReplyStream<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    client: &'a mut Client<S>,
    done: bool,
}

impl<S> ReplyStream<'_, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Redial,
{
    /// Next chunk of body frames, or `None` once the FINAL has been yielded.
    pub async fn next(&mut self) -> Result<Option<Vec<Bytes>>> {
        if self.done {
            return Ok(None);
        }
        let timeout = self.client.config.request_timeout;
        let reply = self.client.recv(timeout).await?;
        if reply.last {
            self.done = true;
        }
        Ok(Some(reply.body))
    }

    /// Whether the FINAL chunk has been yielded.
    pub fn is_done(&self) -> bool {
        self.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ClientToBroker;
    use compio::net::TcpListener;

    async fn listener_endpoint() -> (TcpListener, String) {
        let port = portpicker::pick_unused_port().expect("free port");
        let addr = format!("127.0.0.1:{}", port);
        let listener = TcpListener::bind(&addr).await.unwrap();
        (listener, format!("tcp://{}", addr))
    }

    #[compio::test]
    async fn test_send_produces_request_frames() {
        let (listener, endpoint) = listener_endpoint().await;

        let accept = compio::runtime::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = Connection::new(stream, &FabricConfig::default());
            conn.recv_timeout(Duration::from_secs(2)).await.unwrap().unwrap()
        });

        let mut client = Client::connect(&endpoint, FabricConfig::default())
            .await
            .unwrap();
        client
            .send("svc.echo", vec![Bytes::from_static(b"ping")])
            .await
            .unwrap();

        let frames = accept.await;
        assert_eq!(
            ClientToBroker::parse(&frames).unwrap(),
            ClientToBroker::Request {
                service: Bytes::from_static(b"svc.echo"),
                body: vec![Bytes::from_static(b"ping")],
            }
        );
    }

    #[compio::test]
    async fn test_recv_times_out_on_silence() {
        let (listener, endpoint) = listener_endpoint().await;

        let accept = compio::runtime::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            compio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let mut client = Client::connect(&endpoint, FabricConfig::default())
            .await
            .unwrap();

        let t0 = Instant::now();
        let result = client.recv(Duration::from_millis(100)).await;
        assert!(matches!(result, Err(StewardError::Timeout(_))));
        assert!(t0.elapsed() >= Duration::from_millis(100));

        drop(accept);
    }

    #[compio::test]
    async fn test_request_retries_then_times_out() {
        let (listener, endpoint) = listener_endpoint().await;

        // A "broker" that accepts every connection and counts the requests
        // it swallows without replying.
        let (count_tx, count_rx) = flume::unbounded();
        let silent_broker = compio::runtime::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let count_tx = count_tx.clone();
                compio::runtime::spawn(async move {
                    let mut conn = Connection::new(stream, &FabricConfig::default());
                    while let Ok(Some(_)) = conn.recv_timeout(Duration::from_secs(5)).await {
                        let _ = count_tx.send(());
                    }
                })
                .detach();
            }
        });

        let config = FabricConfig::default()
            .with_request_timeout(Duration::from_millis(100))
            .with_request_retries(2);
        let mut client = Client::connect(&endpoint, config).await.unwrap();

        let result = client.request("svc.void", vec![]).await;
        assert!(matches!(result, Err(StewardError::Timeout(_))));

        // Original send plus two retries.
        assert_eq!(count_rx.len(), 3);

        drop(silent_broker);
    }
}
