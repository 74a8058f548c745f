//! Stream framing for multipart messages.
//!
//! A message is a run of frames; each frame is a flags byte, a length
//! (1 byte, or 8 bytes big-endian when the LONG flag is set) and the
//! payload. The MORE flag chains frames into one atomic multipart message.
//!
//! The decoder is incremental: feed raw bytes into a `BytesMut`, pull
//! complete messages out. Partial frames stay buffered until the rest of
//! the bytes arrive; nothing above the decoder ever observes a partial
//! delivery.

use bytes::{Buf, Bytes, BytesMut};
use smallvec::SmallVec;
use std::io;
use thiserror::Error;

/// Another frame of the same message follows.
const FLAG_MORE: u8 = 0x01;
/// Frame length is a 64-bit big-endian integer.
const FLAG_LONG: u8 = 0x02;
/// Bits 2-7 must be zero.
const FLAG_RESERVED: u8 = !(FLAG_MORE | FLAG_LONG);

/// Framing errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Protocol violation: reserved bits set")]
    ReservedBits,

    #[error("Protocol violation: frame size too large")]
    SizeTooLarge,
}

impl From<CodecError> for io::Error {
    fn from(err: CodecError) -> Self {
        Self::new(io::ErrorKind::InvalidData, err)
    }
}

/// Result type alias for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;

/// A decoded frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub more: bool,
    pub payload: Bytes,
}

/// Decode a single frame from `src`, consuming its bytes.
///
/// Returns:
/// - `Ok(Some(frame))` → frame decoded
/// - `Ok(None)` → need more data (nothing consumed)
/// - `Err` → protocol violation
pub fn decode_frame(src: &mut BytesMut) -> Result<Option<Frame>> {
    if src.len() < 2 {
        return Ok(None);
    }

    let flags = src[0];
    if flags & FLAG_RESERVED != 0 {
        return Err(CodecError::ReservedBits);
    }

    let is_long = flags & FLAG_LONG != 0;
    let header_len = if is_long { 9 } else { 2 };
    if src.len() < header_len {
        return Ok(None);
    }

    let body_len = if is_long {
        let mut hdr = [0u8; 8];
        hdr.copy_from_slice(&src[1..9]);
        let size = u64::from_be_bytes(hdr);

        // MSB must be zero
        if size > 0x7FFF_FFFF_FFFF_FFFF {
            return Err(CodecError::SizeTooLarge);
        }
        size as usize
    } else {
        src[1] as usize
    };

    if src.len() < header_len + body_len {
        return Ok(None);
    }

    src.advance(header_len);
    let payload = src.split_to(body_len).freeze();

    Ok(Some(Frame {
        more: flags & FLAG_MORE != 0,
        payload,
    }))
}

/// Encode a multipart message directly into a buffer.
///
/// Reuses the provided `BytesMut`, avoiding allocations on the hot path.
pub fn encode_message(msg: &[Bytes], buf: &mut BytesMut) {
    for (i, part) in msg.iter().enumerate() {
        let more = i < msg.len() - 1;
        let is_long = part.len() >= 256;

        let mut flags = 0u8;
        if more {
            flags |= FLAG_MORE;
        }
        if is_long {
            flags |= FLAG_LONG;
        }

        buf.reserve(if is_long { 9 } else { 2 } + part.len());
        buf.extend_from_slice(&[flags]);

        if is_long {
            buf.extend_from_slice(&(part.len() as u64).to_be_bytes());
        } else {
            buf.extend_from_slice(&[part.len() as u8]);
        }

        buf.extend_from_slice(part);
    }
}

/// Stateful message assembler.
///
/// Accumulates frames across reads until a frame without MORE completes
/// the message.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    partial: SmallVec<[Bytes; 4]>,
}

impl MessageDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode the next complete message from `src`.
    ///
    /// Returns:
    /// - `Ok(Some(frames))` → complete multipart message
    /// - `Ok(None)` → need more data
    /// - `Err` → protocol violation (assembler state is reset)
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Vec<Bytes>>> {
        loop {
            match decode_frame(src) {
                Ok(Some(frame)) => {
                    let more = frame.more;
                    self.partial.push(frame.payload);
                    if !more {
                        return Ok(Some(self.partial.drain(..).collect()));
                    }
                }
                Ok(None) => return Ok(None),
                Err(e) => {
                    self.partial.clear();
                    return Err(e);
                }
            }
        }
    }

    /// Check whether the assembler is mid-message.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        !self.partial.is_empty()
    }
}
