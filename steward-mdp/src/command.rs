//! Majordomo command layer.
//!
//! Both sub-protocols share the broker: the first application frame is a
//! protocol identifier, the second a single-byte command, followed by
//! command-specific frames. Messages are decoded into tagged variants once
//! at the boundary; all validation lives here and fails closed.
//!
//! Client sub-protocol (`MDPC01`):
//!
//! | command | byte | frames after command |
//! |---|---|---|
//! | REQUEST (c→b) | 0x01 | service-name, body… |
//! | PARTIAL (b→c) | 0x02 | service-name, body… |
//! | FINAL (b→c)   | 0x03 | service-name, body… |
//!
//! Worker sub-protocol (`MDPW01`):
//!
//! | command | byte | frames after command |
//! |---|---|---|
//! | READY (w→b)      | 0x01 | service-name |
//! | REQUEST (b→w)    | 0x02 | client-identity, empty, body… |
//! | PARTIAL (w→b)    | 0x03 | client-identity, empty, body… |
//! | FINAL (w→b)      | 0x04 | client-identity, empty, body… |
//! | HEARTBEAT (both) | 0x05 | — |
//! | DISCONNECT (both)| 0x06 | — |
//!
//! The empty delimiter after the client identity lets workers treat the
//! identity as an opaque return address.

use bytes::Bytes;
use thiserror::Error;

/// Client sub-protocol identifier (canonical revision).
pub const CLIENT_PROTO: &[u8] = b"MDPC01";
/// Worker sub-protocol identifier (canonical revision).
pub const WORKER_PROTO: &[u8] = b"MDPW01";

/// Reserved service-name prefix handled inside the broker.
pub const MANAGEMENT_PREFIX: &str = "mmi.";

// Client command bytes
pub const C_REQUEST: u8 = 0x01;
pub const C_PARTIAL: u8 = 0x02;
pub const C_FINAL: u8 = 0x03;

// Worker command bytes
pub const W_READY: u8 = 0x01;
pub const W_REQUEST: u8 = 0x02;
pub const W_PARTIAL: u8 = 0x03;
pub const W_FINAL: u8 = 0x04;
pub const W_HEARTBEAT: u8 = 0x05;
pub const W_DISCONNECT: u8 = 0x06;

/// Command-level protocol violations
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Protocol identifier mismatch")]
    BadProtocol,

    #[error("Message too short for command 0x{command:02x}: {frames} frames")]
    ShortMessage { command: u8, frames: usize },

    #[error("Unknown command byte 0x{0:02x}")]
    UnknownCommand(u8),

    #[error("Missing empty delimiter after client identity")]
    MissingDelimiter,

    #[error("Command frame must be exactly one byte")]
    BadCommandFrame,
}

/// Result type alias for command parsing
pub type Result<T> = std::result::Result<T, CommandError>;

/// Peek the sender's role from the protocol-identifier frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Worker,
}

/// Identify the sub-protocol of an inbound message, if any.
#[must_use]
pub fn peek_role(frames: &[Bytes]) -> Option<Role> {
    match frames.first().map(AsRef::as_ref) {
        Some(p) if p == CLIENT_PROTO => Some(Role::Client),
        Some(p) if p == WORKER_PROTO => Some(Role::Worker),
        _ => None,
    }
}

fn command_byte(frames: &[Bytes]) -> Result<u8> {
    let cmd = frames.get(1).ok_or(CommandError::ShortMessage {
        command: 0,
        frames: frames.len(),
    })?;
    if cmd.len() != 1 {
        return Err(CommandError::BadCommandFrame);
    }
    Ok(cmd[0])
}

/// Split `[client-identity, empty, body…]` out of a worker-envelope message.
fn split_envelope(command: u8, frames: &[Bytes]) -> Result<(Bytes, Vec<Bytes>)> {
    if frames.len() < 4 {
        return Err(CommandError::ShortMessage {
            command,
            frames: frames.len(),
        });
    }
    if !frames[3].is_empty() {
        return Err(CommandError::MissingDelimiter);
    }
    Ok((frames[2].clone(), frames[4..].to_vec()))
}

/// Messages a client sends to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientToBroker {
    Request { service: Bytes, body: Vec<Bytes> },
}

impl ClientToBroker {
    /// Parse and validate a client-role message.
    pub fn parse(frames: &[Bytes]) -> Result<Self> {
        if peek_role(frames) != Some(Role::Client) {
            return Err(CommandError::BadProtocol);
        }
        match command_byte(frames)? {
            C_REQUEST => {
                if frames.len() < 3 {
                    return Err(CommandError::ShortMessage {
                        command: C_REQUEST,
                        frames: frames.len(),
                    });
                }
                Ok(Self::Request {
                    service: frames[2].clone(),
                    body: frames[3..].to_vec(),
                })
            }
            other => Err(CommandError::UnknownCommand(other)),
        }
    }

    /// Encode to wire frames.
    #[must_use]
    pub fn into_frames(self) -> Vec<Bytes> {
        match self {
            Self::Request { service, body } => {
                let mut frames = Vec::with_capacity(3 + body.len());
                frames.push(Bytes::from_static(CLIENT_PROTO));
                frames.push(Bytes::from_static(&[C_REQUEST]));
                frames.push(service);
                frames.extend(body);
                frames
            }
        }
    }
}

/// Messages the broker sends to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerToClient {
    Partial { service: Bytes, body: Vec<Bytes> },
    Final { service: Bytes, body: Vec<Bytes> },
}

impl BrokerToClient {
    /// Parse and validate a broker-role message arriving at a client.
    pub fn parse(frames: &[Bytes]) -> Result<Self> {
        if peek_role(frames) != Some(Role::Client) {
            return Err(CommandError::BadProtocol);
        }
        let command = command_byte(frames)?;
        if frames.len() < 3 {
            return Err(CommandError::ShortMessage {
                command,
                frames: frames.len(),
            });
        }
        let service = frames[2].clone();
        let body = frames[3..].to_vec();
        match command {
            C_PARTIAL => Ok(Self::Partial { service, body }),
            C_FINAL => Ok(Self::Final { service, body }),
            other => Err(CommandError::UnknownCommand(other)),
        }
    }

    /// Encode to wire frames.
    #[must_use]
    pub fn into_frames(self) -> Vec<Bytes> {
        let (command, service, body) = match self {
            Self::Partial { service, body } => (C_PARTIAL, service, body),
            Self::Final { service, body } => (C_FINAL, service, body),
        };
        let mut frames = Vec::with_capacity(3 + body.len());
        frames.push(Bytes::from_static(CLIENT_PROTO));
        frames.push(Bytes::copy_from_slice(&[command]));
        frames.push(service);
        frames.extend(body);
        frames
    }

    /// True for the terminal chunk of a reply.
    #[must_use]
    pub const fn is_final(&self) -> bool {
        matches!(self, Self::Final { .. })
    }
}

/// Messages a worker sends to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerToBroker {
    Ready { service: Bytes },
    Partial { client: Bytes, body: Vec<Bytes> },
    Final { client: Bytes, body: Vec<Bytes> },
    Heartbeat,
    Disconnect,
}

impl WorkerToBroker {
    /// Parse and validate a worker-role message.
    pub fn parse(frames: &[Bytes]) -> Result<Self> {
        if peek_role(frames) != Some(Role::Worker) {
            return Err(CommandError::BadProtocol);
        }
        match command_byte(frames)? {
            W_READY => {
                if frames.len() < 3 {
                    return Err(CommandError::ShortMessage {
                        command: W_READY,
                        frames: frames.len(),
                    });
                }
                Ok(Self::Ready {
                    service: frames[2].clone(),
                })
            }
            W_PARTIAL => {
                let (client, body) = split_envelope(W_PARTIAL, frames)?;
                Ok(Self::Partial { client, body })
            }
            W_FINAL => {
                let (client, body) = split_envelope(W_FINAL, frames)?;
                Ok(Self::Final { client, body })
            }
            W_HEARTBEAT => Ok(Self::Heartbeat),
            W_DISCONNECT => Ok(Self::Disconnect),
            other => Err(CommandError::UnknownCommand(other)),
        }
    }

    /// Encode to wire frames.
    #[must_use]
    pub fn into_frames(self) -> Vec<Bytes> {
        match self {
            Self::Ready { service } => vec![
                Bytes::from_static(WORKER_PROTO),
                Bytes::from_static(&[W_READY]),
                service,
            ],
            Self::Partial { client, body } => envelope_frames(W_PARTIAL, client, body),
            Self::Final { client, body } => envelope_frames(W_FINAL, client, body),
            Self::Heartbeat => vec![
                Bytes::from_static(WORKER_PROTO),
                Bytes::from_static(&[W_HEARTBEAT]),
            ],
            Self::Disconnect => vec![
                Bytes::from_static(WORKER_PROTO),
                Bytes::from_static(&[W_DISCONNECT]),
            ],
        }
    }
}

/// Messages the broker sends to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerToWorker {
    Request { client: Bytes, body: Vec<Bytes> },
    Heartbeat,
    Disconnect,
}

impl BrokerToWorker {
    /// Parse and validate a broker-role message arriving at a worker.
    pub fn parse(frames: &[Bytes]) -> Result<Self> {
        if peek_role(frames) != Some(Role::Worker) {
            return Err(CommandError::BadProtocol);
        }
        match command_byte(frames)? {
            W_REQUEST => {
                let (client, body) = split_envelope(W_REQUEST, frames)?;
                Ok(Self::Request { client, body })
            }
            W_HEARTBEAT => Ok(Self::Heartbeat),
            W_DISCONNECT => Ok(Self::Disconnect),
            other => Err(CommandError::UnknownCommand(other)),
        }
    }

    /// Encode to wire frames.
    #[must_use]
    pub fn into_frames(self) -> Vec<Bytes> {
        match self {
            Self::Request { client, body } => envelope_frames(W_REQUEST, client, body),
            Self::Heartbeat => vec![
                Bytes::from_static(WORKER_PROTO),
                Bytes::from_static(&[W_HEARTBEAT]),
            ],
            Self::Disconnect => vec![
                Bytes::from_static(WORKER_PROTO),
                Bytes::from_static(&[W_DISCONNECT]),
            ],
        }
    }
}

fn envelope_frames(command: u8, client: Bytes, body: Vec<Bytes>) -> Vec<Bytes> {
    let mut frames = Vec::with_capacity(4 + body.len());
    frames.push(Bytes::from_static(WORKER_PROTO));
    frames.push(Bytes::copy_from_slice(&[command]));
    frames.push(client);
    frames.push(Bytes::new());
    frames.extend(body);
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &'static [u8]) -> Bytes {
        Bytes::from_static(s)
    }

    #[test]
    fn test_client_request_roundtrip() {
        let cmd = ClientToBroker::Request {
            service: b(b"svc.echo"),
            body: vec![b(b"hello"), b(b"world")],
        };
        let frames = cmd.clone().into_frames();
        assert_eq!(frames[0], CLIENT_PROTO);
        assert_eq!(frames[1], [C_REQUEST][..]);
        assert_eq!(ClientToBroker::parse(&frames).unwrap(), cmd);
    }

    #[test]
    fn test_client_request_empty_body() {
        let frames = ClientToBroker::Request {
            service: b(b"mmi.heartbeat"),
            body: vec![],
        }
        .into_frames();
        assert_eq!(frames.len(), 3);
        assert!(ClientToBroker::parse(&frames).is_ok());
    }

    #[test]
    fn test_broker_to_client_roundtrip() {
        for cmd in [
            BrokerToClient::Partial {
                service: b(b"svc.stream"),
                body: vec![b(b"chunk")],
            },
            BrokerToClient::Final {
                service: b(b"svc.stream"),
                body: vec![b(b"done")],
            },
        ] {
            let frames = cmd.clone().into_frames();
            assert_eq!(BrokerToClient::parse(&frames).unwrap(), cmd);
        }
    }

    #[test]
    fn test_worker_roundtrip() {
        for cmd in [
            WorkerToBroker::Ready {
                service: b(b"svc.echo"),
            },
            WorkerToBroker::Partial {
                client: b(b"peer-3"),
                body: vec![b(b"a")],
            },
            WorkerToBroker::Final {
                client: b(b"peer-3"),
                body: vec![b(b"z")],
            },
            WorkerToBroker::Heartbeat,
            WorkerToBroker::Disconnect,
        ] {
            let frames = cmd.clone().into_frames();
            assert_eq!(frames[0], WORKER_PROTO);
            assert_eq!(WorkerToBroker::parse(&frames).unwrap(), cmd);
        }
    }

    #[test]
    fn test_broker_to_worker_request_envelope() {
        let frames = BrokerToWorker::Request {
            client: b(b"peer-9"),
            body: vec![b(b"payload")],
        }
        .into_frames();

        // [proto, command, client-identity, empty, body]
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[2], b(b"peer-9"));
        assert!(frames[3].is_empty());
        assert_eq!(
            BrokerToWorker::parse(&frames).unwrap(),
            BrokerToWorker::Request {
                client: b(b"peer-9"),
                body: vec![b(b"payload")],
            }
        );
    }

    #[test]
    fn test_role_peek() {
        let client = ClientToBroker::Request {
            service: b(b"x"),
            body: vec![],
        }
        .into_frames();
        assert_eq!(peek_role(&client), Some(Role::Client));

        let worker = WorkerToBroker::Heartbeat.into_frames();
        assert_eq!(peek_role(&worker), Some(Role::Worker));

        assert_eq!(peek_role(&[b(b"MDPC02"), b(b"\x01")]), None);
        assert_eq!(peek_role(&[]), None);
    }

    #[test]
    fn test_wrong_proto_rejected() {
        let mut frames = WorkerToBroker::Heartbeat.into_frames();
        frames[0] = b(b"MDPW02");
        assert!(matches!(
            WorkerToBroker::parse(&frames),
            Err(CommandError::BadProtocol)
        ));
    }

    #[test]
    fn test_short_message_rejected() {
        let frames = vec![b(b"MDPW01"), b(b"\x01")];
        assert!(matches!(
            WorkerToBroker::parse(&frames),
            Err(CommandError::ShortMessage { .. })
        ));
    }

    #[test]
    fn test_unknown_command_rejected() {
        let frames = vec![b(b"MDPC01"), b(b"\x7f"), b(b"svc")];
        assert!(matches!(
            ClientToBroker::parse(&frames),
            Err(CommandError::UnknownCommand(0x7f))
        ));
    }

    #[test]
    fn test_missing_delimiter_rejected() {
        let frames = vec![
            b(b"MDPW01"),
            b(b"\x03"),
            b(b"peer-1"),
            b(b"not-empty"),
            b(b"body"),
        ];
        assert!(matches!(
            WorkerToBroker::parse(&frames),
            Err(CommandError::MissingDelimiter)
        ));
    }

    #[test]
    fn test_multibyte_command_frame_rejected() {
        let frames = vec![b(b"MDPC01"), b(b"\x01\x01"), b(b"svc")];
        assert!(matches!(
            ClientToBroker::parse(&frames),
            Err(CommandError::BadCommandFrame)
        ));
    }
}
