//! Engine error types and the numeric reply status.
//!
//! Two kinds of failure flow through the engine and they never mix:
//!
//! - [`Errno`] is the numeric status a filesystem operation returns to the
//!   peer. It travels in the reply header and is never escalated into an
//!   engine error.
//! - The `*Error` enums are engine-internal failures (I/O loss, malformed
//!   framing, registry misuse). They tear down at most the triggering
//!   request, or the affected channel half for transport failures.

use std::io;
use thiserror::Error;

// =============================================================================
// Numeric reply status
// =============================================================================

/// Errno-style numeric status returned by operation handlers.
///
/// Wraps the platform errno values from `libc` so handler implementations
/// can reuse familiar constants. `0` is success and is never constructed
/// through the error path; handlers signal success by returning `Ok`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Errno(i32);

impl Errno {
    /// Operation not supported by this filesystem (unset table slot).
    pub const NOSYS: Errno = Errno(libc::ENOSYS);
    /// No such file or directory.
    pub const NOENT: Errno = Errno(libc::ENOENT);
    /// Generic I/O failure.
    pub const IO: Errno = Errno(libc::EIO);
    /// Invalid argument.
    pub const INVAL: Errno = Errno(libc::EINVAL);
    /// Out of memory.
    pub const NOMEM: Errno = Errno(libc::ENOMEM);
    /// Permission denied.
    pub const ACCES: Errno = Errno(libc::EACCES);
    /// Directory not empty.
    pub const NOTEMPTY: Errno = Errno(libc::ENOTEMPTY);
    /// The peer connection is gone.
    pub const NOTCONN: Errno = Errno(libc::ENOTCONN);
    /// Device or resource busy.
    pub const BUSY: Errno = Errno(libc::EBUSY);

    /// Creates a status from a raw errno value.
    pub const fn from_raw(raw: i32) -> Self {
        Errno(raw)
    }

    /// Returns the raw errno value for the reply header.
    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl std::fmt::Debug for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Errno({})", self.0)
    }
}

impl std::fmt::Display for Errno {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "errno {}", self.0)
    }
}

/// Result type for operation-table handlers.
pub type OpResult<T> = Result<T, Errno>;

// =============================================================================
// Frame errors
// =============================================================================

/// Errors from frame buffer accessors and lifecycle.
#[derive(Debug, Error)]
pub enum FrameError {
    /// A read reached past the high-water mark of valid bytes.
    #[error("frame exhausted: read of {len} bytes at offset {offset} exceeds {valid} valid bytes")]
    Exhausted {
        /// Offset the read started at.
        offset: usize,
        /// Number of bytes requested.
        len: usize,
        /// High-water mark of the frame.
        valid: usize,
    },

    /// Attempted to recycle a frame that is still queued on a channel.
    #[error("frame is queued on a channel and cannot be recycled")]
    StillQueued,

    /// A write would grow the frame past the configured maximum.
    #[error("frame size {requested} exceeds maximum {max}")]
    TooLarge {
        /// Size the write would have produced.
        requested: usize,
        /// Configured maximum frame size.
        max: usize,
    },
}

// =============================================================================
// Transport errors
// =============================================================================

/// Errors from channel I/O and reply matching.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying I/O failure on a channel half.
    #[error("channel I/O error: {0}")]
    Io(#[from] io::Error),

    /// The channel died while the frame was queued or awaiting a reply.
    ///
    /// Every outstanding frame on a dead channel half completes with this.
    #[error("connection gone")]
    ConnectionGone,

    /// An inbound frame violated the size-prefixed framing.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Frame buffer failure while encoding or decoding.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The enqueue target channel is not registered with the transport.
    #[error("unknown channel {0}")]
    UnknownChannel(u64),
}

// =============================================================================
// Scheduler errors
// =============================================================================

/// Errors from the call-context scheduler.
#[derive(Debug, Error)]
pub enum SchedError {
    /// The context finished while a caller was waiting to resume it.
    #[error("context {0} already completed")]
    Completed(u64),
}

// =============================================================================
// Registry errors
// =============================================================================

/// Errors from the node and path registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The node is not (or no longer) in the live list.
    #[error("node {0} is not registered")]
    NotRegistered(u64),

    /// A path operation needs a cached path the node does not have.
    #[error("node {0} has no cached path")]
    NoPath(u64),

    /// Path building was asked for but path mode is off.
    #[error("path caching is disabled for this mount")]
    PathModeOff,
}

// =============================================================================
// Dispatch errors
// =============================================================================

/// Errors from request decoding and dispatch.
///
/// These are fatal to the current request only; the serve loop logs them
/// and moves on to the next inbound frame.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The request header could not be decoded.
    #[error("malformed request: {0}")]
    Malformed(String),

    /// The opcode is outside the known numbering.
    #[error("unknown opcode {opcode} in class {class}")]
    UnknownOpcode {
        /// Raw wire class value.
        class: u16,
        /// Raw wire opcode value.
        opcode: u16,
    },

    /// Transport failure while sending the reply.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Frame buffer failure while decoding arguments.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

// =============================================================================
// Umbrella
// =============================================================================

/// Top-level engine error for embedders.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Scheduler failure.
    #[error(transparent)]
    Sched(#[from] SchedError),

    /// Registry failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Dispatch failure.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}
