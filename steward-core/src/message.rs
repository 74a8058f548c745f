//! Message builder for ergonomic multipart message construction.
//!
//! A message on the fabric is an ordered sequence of opaque frames,
//! transmitted atomically. This builder keeps request/reply assembly
//! readable at call sites.

use bytes::Bytes;
use std::io;

/// A multipart message builder.
///
/// # Examples
///
/// ```
/// use steward_core::message::Message;
///
/// // Build a request body
/// let msg = Message::new()
///     .push_str("svc.echo")
///     .push(b"payload".as_slice())
///     .into_frames();
/// assert_eq!(msg.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Message {
    frames: Vec<Bytes>,
}

impl Message {
    /// Create a new empty message.
    #[must_use]
    pub const fn new() -> Self {
        Self { frames: Vec::new() }
    }

    /// Create a message from existing frames.
    #[must_use]
    pub const fn from_frames(frames: Vec<Bytes>) -> Self {
        Self { frames }
    }

    /// Add a frame from any type that can be converted to `Bytes`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use steward_core::message::Message;
    /// use bytes::Bytes;
    ///
    /// let msg = Message::new()
    ///     .push(b"raw bytes".as_slice())
    ///     .push(vec![1, 2, 3])
    ///     .push(Bytes::from_static(b"static"));
    /// ```
    #[must_use]
    pub fn push(mut self, frame: impl Into<Bytes>) -> Self {
        self.frames.push(frame.into());
        self
    }

    /// Add a string frame (UTF-8 encoded).
    #[must_use]
    pub fn push_str(mut self, s: &str) -> Self {
        self.frames.push(Bytes::copy_from_slice(s.as_bytes()));
        self
    }

    /// Add an empty frame (used as the envelope delimiter).
    ///
    /// # Examples
    ///
    /// ```
    /// # use steward_core::message::Message;
    /// // Worker-bound envelope: [client-identity] [empty] [body]
    /// let msg = Message::new()
    ///     .push(b"peer-7".as_slice())
    ///     .push_empty()
    ///     .push_str("request");
    /// ```
    #[must_use]
    pub fn push_empty(mut self) -> Self {
        self.frames.push(Bytes::new());
        self
    }

    /// Get the number of frames.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Check if the message has no frames.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Get a reference to the frames.
    #[must_use]
    pub fn frames(&self) -> &[Bytes] {
        &self.frames
    }

    /// Consume the builder and return the frames.
    #[must_use]
    pub fn into_frames(self) -> Vec<Bytes> {
        self.frames
    }

    /// Try to parse a frame as a UTF-8 string.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame doesn't exist or isn't valid UTF-8.
    pub fn parse_frame_str(&self, index: usize) -> io::Result<&str> {
        let frame = self
            .frames
            .get(index)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "Frame index out of bounds"))?;

        std::str::from_utf8(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl From<Vec<Bytes>> for Message {
    fn from(frames: Vec<Bytes>) -> Self {
        Self { frames }
    }
}

impl From<Message> for Vec<Bytes> {
    fn from(msg: Message) -> Self {
        msg.frames
    }
}
