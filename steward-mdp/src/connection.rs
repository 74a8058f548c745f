//! Framed multipart connection.
//!
//! `Connection<S>` owns one stream and moves whole multipart messages in and
//! out of it: reads accumulate into a buffer that the incremental decoder
//! drains, writes encode into a reusable buffer flushed in one operation.
//! One connection == one peer; the broker holds one per accepted socket,
//! endpoints hold one per dial.

use bytes::{Bytes, BytesMut};
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use std::io;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::codec::{encode_message, MessageDecoder};
use steward_core::config::FabricConfig;

pub(crate) struct Connection<S> {
    /// Underlying stream - None once the peer is gone
    stream: Option<S>,
    decoder: MessageDecoder,
    recv_buf: BytesMut,
    write_buf: BytesMut,
    read_buffer_size: usize,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(stream: S, config: &FabricConfig) -> Self {
        Self {
            stream: Some(stream),
            decoder: MessageDecoder::new(),
            recv_buf: BytesMut::with_capacity(config.read_buffer_size),
            write_buf: BytesMut::with_capacity(config.write_buffer_size),
            read_buffer_size: config.read_buffer_size,
        }
    }

    #[inline]
    pub(crate) const fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Send one multipart message, flushing in a single write.
    ///
    /// On write failure the stream is marked disconnected.
    pub(crate) async fn send(&mut self, frames: &[Bytes]) -> io::Result<()> {
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;

        self.write_buf.clear();
        encode_message(frames, &mut self.write_buf);
        trace!(
            "[CONN] Sending {} frames ({} bytes)",
            frames.len(),
            self.write_buf.len()
        );

        let data = self.write_buf.split().to_vec();
        let BufResult(result, _) = stream.write_all(data).await;

        if result.is_err() {
            self.stream = None;
        }
        result?;
        Ok(())
    }

    /// Receive with a deadline.
    ///
    /// Returns `Err(TimedOut)` if no complete message arrived within `dur`,
    /// `Ok(None)` if the peer closed the connection.
    pub(crate) async fn recv_timeout(&mut self, dur: Duration) -> io::Result<Option<Vec<Bytes>>> {
        let deadline = Instant::now() + dur;
        loop {
            if let Some(frames) = self.decoder.decode(&mut self.recv_buf)? {
                trace!("[CONN] Received {} frames", frames.len());
                return Ok(Some(frames));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "receive timed out",
                ));
            }
            if self.read_raw(remaining).await? == 0 {
                return Ok(None);
            }
        }
    }

    /// Read raw bytes from the stream into the receive buffer.
    ///
    /// Returns the number of bytes read; 0 means EOF. On EOF or error the
    /// stream is marked disconnected.
    async fn read_raw(&mut self, timeout: Duration) -> io::Result<usize> {
        let stream = self.stream.as_mut().ok_or_else(not_connected)?;

        let buf = Vec::with_capacity(self.read_buffer_size);
        let BufResult(result, buf) =
            match compio::time::timeout(timeout, AsyncRead::read(stream, buf)).await {
                Ok(result) => result,
                Err(_elapsed) => {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "receive timed out",
                    ));
                }
            };

        match result {
            Ok(0) => {
                trace!("[CONN] Connection closed (EOF)");
                self.stream = None;
                Ok(0)
            }
            Ok(n) => {
                self.recv_buf.extend_from_slice(&buf);
                Ok(n)
            }
            Err(e) => {
                self.stream = None;
                Err(e)
            }
        }
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "Socket not connected")
}

/// Transport types an endpoint can (re)dial from an [`Endpoint`] address.
///
/// This is the seam that lets the worker and client reconnection logic stay
/// generic over TCP and IPC streams.
pub(crate) trait Redial: Sized {
    async fn dial(endpoint: &steward_core::endpoint::Endpoint) -> io::Result<Self>;
}

impl Redial for compio::net::TcpStream {
    async fn dial(endpoint: &steward_core::endpoint::Endpoint) -> io::Result<Self> {
        match endpoint {
            steward_core::endpoint::Endpoint::Tcp(addr) => {
                let stream = Self::connect(addr).await?;
                steward_core::tcp::enable_tcp_nodelay(&stream)?;
                Ok(stream)
            }
            #[cfg(unix)]
            steward_core::endpoint::Endpoint::Ipc(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "IPC endpoint requires a Unix stream transport",
            )),
        }
    }
}

#[cfg(unix)]
impl Redial for compio::net::UnixStream {
    async fn dial(endpoint: &steward_core::endpoint::Endpoint) -> io::Result<Self> {
        match endpoint {
            steward_core::endpoint::Endpoint::Ipc(path) => {
                steward_core::ipc::connect(path).await
            }
            steward_core::endpoint::Endpoint::Tcp(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "TCP endpoint requires a TCP stream transport",
            )),
        }
    }
}
