//! Size-delimited message frames.
//!
//! A [`Frame`] owns a growable byte buffer, a read/write cursor, and a
//! high-water mark of valid bytes. Writes grow the buffer; reads past the
//! high-water mark fail with [`FrameError::Exhausted`]. The same frame
//! object travels the whole round trip: it is queued for send, parked in
//! the channel's awaiting-reply set, and when the matching reply arrives
//! its body is copied back into this frame before the waiter resumes.
//!
//! A frame is associated with exactly one of:
//! - a oneshot sender that resumes a suspended request context,
//! - a completion callback (for call sites with no context of their own),
//! - nothing (fire-and-forget).

use crate::error::{FrameError, TransportError};
use bytes::BytesMut;
use tokio::sync::oneshot;

/// Default maximum frame size (1 MiB).
///
/// Large enough for bulk read/write payloads plus headers; anything larger
/// is treated as a framing error on the inbound side.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// What happens when the frame's round trip completes (or fails).
pub(crate) enum Completion {
    /// Nobody is waiting; the frame is dropped after send (fire-and-forget).
    None,
    /// Resume a suspended context by handing the frame back.
    Resume(oneshot::Sender<Result<Frame, TransportError>>),
    /// Invoke a callback with the completed frame.
    Callback(Box<dyn FnOnce(Result<Frame, TransportError>) + Send>),
}

impl Completion {
    /// Delivers the completion result through whichever path is attached.
    ///
    /// A dropped receiver is not an error; the waiter simply went away.
    pub(crate) fn complete(self, result: Result<Frame, TransportError>) {
        match self {
            Completion::None => {}
            Completion::Resume(tx) => {
                let _ = tx.send(result);
            }
            Completion::Callback(cb) => cb(result),
        }
    }
}

/// Per-frame state flags.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct FrameFlags {
    /// On a channel queue or awaiting a reply; recycle is refused.
    pub queued: bool,
    /// No reply is expected; destroy after the send completes.
    pub no_reply: bool,
    /// Bypasses reply matching; delivered to a registered direct waiter.
    pub direct: bool,
    /// Jumps ahead of non-urgent frames in the outbound FIFO.
    pub urgent: bool,
}

/// One discrete, size-delimited message exchanged over a channel.
pub struct Frame {
    buf: BytesMut,
    cursor: usize,
    /// High-water mark of valid bytes.
    valid: usize,
    /// Hard cap on growth; inherited from the mount configuration.
    max_size: usize,
    pub(crate) flags: FrameFlags,
    /// Bytes already written to the wire (partial-write resumption).
    pub(crate) sent: usize,
    /// Whether a reply is still expected (fire-and-forget with reply).
    pub(crate) completion: Completion,
}

impl Frame {
    /// Creates an empty frame with the default size limit.
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Creates an empty frame with an explicit size limit.
    pub fn with_limit(max_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            cursor: 0,
            valid: 0,
            max_size,
            flags: FrameFlags::default(),
            sent: 0,
            completion: Completion::None,
        }
    }

    /// Builds a frame around bytes received from the wire.
    pub(crate) fn from_bytes(bytes: BytesMut, max_size: usize) -> Self {
        let valid = bytes.len();
        Self {
            buf: bytes,
            cursor: 0,
            valid,
            max_size,
            flags: FrameFlags::default(),
            sent: 0,
            completion: Completion::None,
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Resets the frame for reuse.
    ///
    /// Refused while the frame is queued on a channel, since the pump still
    /// holds a stake in its contents.
    pub fn recycle(&mut self) -> Result<(), FrameError> {
        if self.flags.queued {
            return Err(FrameError::StillQueued);
        }
        self.buf.clear();
        self.cursor = 0;
        self.valid = 0;
        self.sent = 0;
        self.flags = FrameFlags::default();
        self.completion = Completion::None;
        Ok(())
    }

    /// Marks this frame urgent: it will jump ahead of previously queued
    /// non-urgent frames on the outbound FIFO.
    pub fn set_urgent(&mut self, urgent: bool) {
        self.flags.urgent = urgent;
    }

    /// Returns whether the frame is flagged urgent.
    pub fn is_urgent(&self) -> bool {
        self.flags.urgent
    }

    pub(crate) fn take_completion(&mut self) -> Completion {
        std::mem::replace(&mut self.completion, Completion::None)
    }

    /// Copies a reply body into this frame, replacing its contents.
    ///
    /// The cursor rewinds to zero so the waiter reads the reply from the
    /// start. Flags and completion are untouched.
    pub(crate) fn absorb(&mut self, reply: &Frame) {
        self.buf.clear();
        self.buf.extend_from_slice(reply.bytes());
        self.valid = reply.valid;
        self.cursor = 0;
        self.sent = 0;
    }

    // -------------------------------------------------------------------------
    // Cursor
    // -------------------------------------------------------------------------

    /// Returns the high-water mark of valid bytes.
    pub fn len(&self) -> usize {
        self.valid
    }

    /// Returns true if no bytes have been written.
    pub fn is_empty(&self) -> bool {
        self.valid == 0
    }

    /// Returns the current cursor position.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Moves the cursor to an absolute offset.
    ///
    /// Seeking past the high-water mark is allowed for writers that lay
    /// down a header after the body; reads from there still fail.
    pub fn seek(&mut self, offset: usize) {
        self.cursor = offset;
    }

    /// Rewinds the cursor to the start of the frame.
    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// Returns the valid bytes of the frame.
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.valid]
    }

    // -------------------------------------------------------------------------
    // Random-access writers
    // -------------------------------------------------------------------------

    /// Writes bytes at the cursor, growing the buffer, and advances it.
    pub fn put(&mut self, data: &[u8]) -> Result<(), FrameError> {
        self.put_at(self.cursor, data)?;
        self.cursor += data.len();
        Ok(())
    }

    /// Writes bytes at an absolute offset without moving the cursor.
    pub fn put_at(&mut self, offset: usize, data: &[u8]) -> Result<(), FrameError> {
        let end = offset + data.len();
        if end > self.max_size {
            return Err(FrameError::TooLarge {
                requested: end,
                max: self.max_size,
            });
        }
        if end > self.buf.len() {
            self.buf.resize(end, 0);
        }
        self.buf[offset..end].copy_from_slice(data);
        if end > self.valid {
            self.valid = end;
        }
        Ok(())
    }

    /// Writes a `u8` at the cursor.
    pub fn put_u8(&mut self, v: u8) -> Result<(), FrameError> {
        self.put(&[v])
    }

    /// Writes a little-endian `u16` at the cursor.
    pub fn put_u16(&mut self, v: u16) -> Result<(), FrameError> {
        self.put(&v.to_le_bytes())
    }

    /// Writes a little-endian `u32` at the cursor.
    pub fn put_u32(&mut self, v: u32) -> Result<(), FrameError> {
        self.put(&v.to_le_bytes())
    }

    /// Writes a little-endian `u64` at the cursor.
    pub fn put_u64(&mut self, v: u64) -> Result<(), FrameError> {
        self.put(&v.to_le_bytes())
    }

    /// Writes a little-endian `u32` at an absolute offset.
    pub fn put_u32_at(&mut self, offset: usize, v: u32) -> Result<(), FrameError> {
        self.put_at(offset, &v.to_le_bytes())
    }

    /// Writes a little-endian `i32` at an absolute offset.
    pub fn put_i32_at(&mut self, offset: usize, v: i32) -> Result<(), FrameError> {
        self.put_at(offset, &v.to_le_bytes())
    }

    /// Writes a length-prefixed byte string at the cursor.
    pub fn put_bytes(&mut self, data: &[u8]) -> Result<(), FrameError> {
        self.put_u32(data.len() as u32)?;
        self.put(data)
    }

    // -------------------------------------------------------------------------
    // Random-access readers
    // -------------------------------------------------------------------------

    /// Reads bytes at the cursor and advances it.
    pub fn get(&mut self, out: &mut [u8]) -> Result<(), FrameError> {
        self.get_at(self.cursor, out)?;
        self.cursor += out.len();
        Ok(())
    }

    /// Reads bytes at an absolute offset without moving the cursor.
    pub fn get_at(&self, offset: usize, out: &mut [u8]) -> Result<(), FrameError> {
        let end = offset + out.len();
        if end > self.valid {
            return Err(FrameError::Exhausted {
                offset,
                len: out.len(),
                valid: self.valid,
            });
        }
        out.copy_from_slice(&self.buf[offset..end]);
        Ok(())
    }

    /// Reads a `u8` at the cursor.
    pub fn get_u8(&mut self) -> Result<u8, FrameError> {
        let mut b = [0u8; 1];
        self.get(&mut b)?;
        Ok(b[0])
    }

    /// Reads a little-endian `u16` at the cursor.
    pub fn get_u16(&mut self) -> Result<u16, FrameError> {
        let mut b = [0u8; 2];
        self.get(&mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    /// Reads a little-endian `u32` at the cursor.
    pub fn get_u32(&mut self) -> Result<u32, FrameError> {
        let mut b = [0u8; 4];
        self.get(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    /// Reads a little-endian `u64` at the cursor.
    pub fn get_u64(&mut self) -> Result<u64, FrameError> {
        let mut b = [0u8; 8];
        self.get(&mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    /// Reads a little-endian `u32` at an absolute offset.
    pub fn get_u32_at(&self, offset: usize) -> Result<u32, FrameError> {
        let mut b = [0u8; 4];
        self.get_at(offset, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    /// Reads a little-endian `u64` at an absolute offset.
    pub fn get_u64_at(&self, offset: usize) -> Result<u64, FrameError> {
        let mut b = [0u8; 8];
        self.get_at(offset, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    /// Reads a little-endian `i32` at an absolute offset.
    pub fn get_i32_at(&self, offset: usize) -> Result<i32, FrameError> {
        let mut b = [0u8; 4];
        self.get_at(offset, &mut b)?;
        Ok(i32::from_le_bytes(b))
    }

    /// Reads a length-prefixed byte string at the cursor.
    ///
    /// The length prefix is untrusted input; it is checked against the
    /// remaining valid bytes before any allocation happens.
    pub fn get_bytes(&mut self) -> Result<Vec<u8>, FrameError> {
        let len = self.get_u32()? as usize;
        if len > self.valid.saturating_sub(self.cursor) {
            return Err(FrameError::Exhausted {
                offset: self.cursor,
                len,
                valid: self.valid,
            });
        }
        let mut out = vec![0u8; len];
        self.get(&mut out)?;
        Ok(out)
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.valid)
            .field("cursor", &self.cursor)
            .field("sent", &self.sent)
            .field("flags", &self.flags)
            .finish()
    }
}
