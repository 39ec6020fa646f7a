//! Channels and the frame pumps.
//!
//! A [`Channel`] is one bidirectional I/O endpoint. Adding a stream to the
//! [`Transport`] splits it and spawns two pumps:
//!
//! - the write pump drains the outbound FIFO (urgent frames jump ahead of
//!   queued non-urgent ones), writing each frame from its cursor across
//!   partial writes until the declared length is on the wire;
//! - the read pump assembles size-prefixed frames, hands direct frames to
//!   their registered waiter, runs replies through the pluggable
//!   [`ReplyMatcher`] against the awaiting-reply set, and forwards
//!   inbound requests to the serve loop.
//!
//! A read or write failure permanently closes that half: every queued
//! frame on the affected side completes with `ConnectionGone` through its
//! normal completion path, and the closed-channel hook fires once both
//! halves are gone.

use crate::error::TransportError;
use crate::transport::frame::{Completion, Frame, DEFAULT_MAX_FRAME_SIZE};
use crate::wire;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Identifier for a channel registered with the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "chan#{}", self.0)
    }
}

// =============================================================================
// Reply matching
// =============================================================================

/// Pluggable comparator matching an inbound frame against the
/// awaiting-reply set.
pub trait ReplyMatcher: Send + Sync {
    /// Returns whether `incoming` is the reply to `outstanding`.
    fn is_reply(&self, outstanding: &Frame, incoming: &Frame) -> bool;
}

/// Default matcher: correlation ids equal and the incoming frame carries
/// the response flag.
pub struct CorrelationMatcher;

impl ReplyMatcher for CorrelationMatcher {
    fn is_reply(&self, outstanding: &Frame, incoming: &Frame) -> bool {
        if !wire::peek_is_response(incoming) {
            return false;
        }
        match (wire::peek_request_id(outstanding), wire::peek_request_id(incoming)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

// =============================================================================
// Hooks
// =============================================================================

/// Event hooks shared by every channel on a transport.
#[derive(Default)]
pub struct ChannelHooks {
    /// Invoked with inbound reply frames that matched nothing (duplicates
    /// included). Without a hook they are dropped.
    pub on_unmatched: Option<Box<dyn Fn(Frame) + Send + Sync>>,
    /// Invoked once when both halves of a channel are gone.
    pub on_closed: Option<Box<dyn Fn(ChannelId) + Send + Sync>>,
    /// Invoked when a channel's readiness changes (enable, disable, or
    /// half-closure).
    pub on_readiness: Option<Box<dyn Fn(ChannelId, bool) + Send + Sync>>,
}

// =============================================================================
// Shared channel state
// =============================================================================

struct ChannelShared {
    id: ChannelId,
    max_frame_size: usize,
    /// Frames fully sent and awaiting a matched reply.
    pending: Mutex<Vec<Frame>>,
    /// At most one direct-receive waiter; the next inbound frame goes
    /// here, bypassing reply matching.
    direct_waiter: Mutex<Option<oneshot::Sender<Frame>>>,
    enabled: AtomicBool,
    enabled_notify: Notify,
    read_closed: AtomicBool,
    write_closed: AtomicBool,
    closed_notified: AtomicBool,
    read_waiters: AtomicUsize,
    write_waiters: AtomicUsize,
    shutdown: CancellationToken,
    matcher: Arc<dyn ReplyMatcher>,
    hooks: Arc<ChannelHooks>,
    /// Inbound non-reply frames for the serve loop.
    request_tx: mpsc::UnboundedSender<Frame>,
}

impl ChannelShared {
    /// Fails every frame in the awaiting-reply set.
    fn fail_pending(&self) {
        let drained: Vec<Frame> = std::mem::take(&mut *self.pending.lock());
        for mut frame in drained {
            frame.flags.queued = false;
            frame.take_completion().complete(Err(TransportError::ConnectionGone));
        }
        // A direct waiter learns of the death through its dropped sender.
        self.direct_waiter.lock().take();
    }

    /// Fires the closed-channel hook once both halves are gone.
    fn maybe_notify_closed(&self) {
        if self.read_closed.load(Ordering::Acquire)
            && self.write_closed.load(Ordering::Acquire)
            && !self.closed_notified.swap(true, Ordering::AcqRel)
        {
            debug!(channel = %self.id, "channel fully closed");
            if let Some(hook) = &self.hooks.on_closed {
                hook(self.id);
            }
        }
    }

    fn readiness_changed(&self, ready: bool) {
        if let Some(hook) = &self.hooks.on_readiness {
            hook(self.id, ready);
        }
    }
}

// =============================================================================
// Channel handle
// =============================================================================

/// Handle to one registered channel.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
    out_tx: mpsc::UnboundedSender<Frame>,
}

impl Channel {
    /// Returns the channel id.
    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    /// Queues a frame and suspends the calling context until the matched
    /// reply arrives (or the channel dies).
    ///
    /// On success the returned frame is the caller's own frame with the
    /// reply body copied into it and the cursor rewound.
    pub async fn enqueue_blocking(&self, mut frame: Frame) -> Result<Frame, TransportError> {
        let (tx, rx) = oneshot::channel();
        frame.completion = Completion::Resume(tx);
        frame.flags.queued = true;
        self.submit(frame)?;

        // The send itself is the pump's business; what this context is
        // blocked on is the inbound matched reply.
        self.shared.read_waiters.fetch_add(1, Ordering::AcqRel);
        let result = rx.await;
        self.shared.read_waiters.fetch_sub(1, Ordering::AcqRel);
        result.map_err(|_| TransportError::ConnectionGone)?
    }

    /// Queues a frame whose completion invokes a callback instead of
    /// resuming a context.
    ///
    /// For call sites with no context of their own.
    pub fn enqueue_callback<F>(&self, mut frame: Frame, callback: F) -> Result<(), TransportError>
    where
        F: FnOnce(Result<Frame, TransportError>) + Send + 'static,
    {
        frame.completion = Completion::Callback(Box::new(callback));
        frame.flags.queued = true;
        self.submit(frame)
    }

    /// Queues a frame for send with nobody waiting on it.
    ///
    /// With `want_reply` the frame stays in the awaiting-reply set so the
    /// eventual reply is consumed silently instead of hitting the
    /// unmatched hook; without it the frame is destroyed after the send
    /// completes.
    pub fn enqueue_fire_and_forget(
        &self,
        mut frame: Frame,
        want_reply: bool,
    ) -> Result<(), TransportError> {
        frame.flags.no_reply = !want_reply;
        frame.flags.queued = true;
        self.submit(frame)
    }

    /// Sends a frame and resumes when the bytes are on the wire, without
    /// entering the awaiting-reply set.
    ///
    /// Bulk-data phases use this when the caller already knows which
    /// physical frame departs next.
    pub async fn direct_send(&self, mut frame: Frame) -> Result<Frame, TransportError> {
        let (tx, rx) = oneshot::channel();
        frame.completion = Completion::Resume(tx);
        frame.flags.direct = true;
        frame.flags.queued = true;
        self.submit(frame)?;

        self.shared.write_waiters.fetch_add(1, Ordering::AcqRel);
        let result = rx.await;
        self.shared.write_waiters.fetch_sub(1, Ordering::AcqRel);
        result.map_err(|_| TransportError::ConnectionGone)?
    }

    /// Receives the next inbound frame directly, bypassing reply
    /// matching.
    ///
    /// At most one direct waiter may be registered at a time; a second
    /// registration replaces the first.
    pub async fn direct_receive(&self) -> Result<Frame, TransportError> {
        if self.shared.read_closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionGone);
        }
        let (tx, rx) = oneshot::channel();
        {
            let mut waiter = self.shared.direct_waiter.lock();
            if waiter.is_some() {
                warn!(channel = %self.id(), "replacing existing direct-receive waiter");
            }
            *waiter = Some(tx);
        }
        // The read half may have died between the check and registration;
        // fail_pending has already run, so clear our own waiter.
        if self.shared.read_closed.load(Ordering::Acquire) {
            self.shared.direct_waiter.lock().take();
            return Err(TransportError::ConnectionGone);
        }

        self.shared.read_waiters.fetch_add(1, Ordering::AcqRel);
        let result = rx.await;
        self.shared.read_waiters.fetch_sub(1, Ordering::AcqRel);
        result.map_err(|_| TransportError::ConnectionGone)
    }

    /// Resumes outbound processing.
    pub fn enable(&self) {
        self.shared.enabled.store(true, Ordering::Release);
        self.shared.enabled_notify.notify_waiters();
        self.shared.readiness_changed(true);
    }

    /// Pauses outbound processing; queued frames stay queued.
    pub fn disable(&self) {
        self.shared.enabled.store(false, Ordering::Release);
        self.shared.readiness_changed(false);
    }

    /// Returns whether outbound processing is enabled.
    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    /// Returns whether at least one half of the channel is still open.
    pub fn is_alive(&self) -> bool {
        !(self.shared.read_closed.load(Ordering::Acquire)
            && self.shared.write_closed.load(Ordering::Acquire))
    }

    /// Returns the number of contexts blocked on this channel
    /// (read waiters, write waiters).
    pub fn waiters(&self) -> (usize, usize) {
        (
            self.shared.read_waiters.load(Ordering::Acquire),
            self.shared.write_waiters.load(Ordering::Acquire),
        )
    }

    /// Returns the number of frames awaiting replies.
    pub fn pending_replies(&self) -> usize {
        self.shared.pending.lock().len()
    }

    fn submit(&self, frame: Frame) -> Result<(), TransportError> {
        if self.shared.write_closed.load(Ordering::Acquire) {
            let mut frame = frame;
            frame.flags.queued = false;
            frame.take_completion().complete(Err(TransportError::ConnectionGone));
            return Err(TransportError::ConnectionGone);
        }
        self.out_tx
            .send(frame)
            .map_err(|_| TransportError::ConnectionGone)
    }

    pub(crate) fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id)
            .field("enabled", &self.is_enabled())
            .field("alive", &self.is_alive())
            .field("pending_replies", &self.pending_replies())
            .finish()
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Manages channel registration and the frame pumps.
pub struct Transport {
    next_id: AtomicU64,
    channels: Mutex<HashMap<u64, Channel>>,
    matcher: Arc<dyn ReplyMatcher>,
    hooks: Arc<ChannelHooks>,
    max_frame_size: usize,
}

impl Transport {
    /// Creates a transport with the default correlation matcher and no
    /// hooks.
    pub fn new() -> Self {
        Self::with_matcher(Arc::new(CorrelationMatcher), ChannelHooks::default())
    }

    /// Creates a transport with a custom reply matcher and hooks.
    pub fn with_matcher(matcher: Arc<dyn ReplyMatcher>, hooks: ChannelHooks) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            channels: Mutex::new(HashMap::new()),
            matcher,
            hooks: Arc::new(hooks),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Sets the inbound frame size cap.
    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Registers a stream as a channel and spawns its pumps.
    ///
    /// Inbound frames that are not replies are delivered through
    /// `request_tx` to the serve loop.
    pub fn add_channel<S>(&self, stream: S, request_tx: mpsc::UnboundedSender<Frame>) -> Channel
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = ChannelId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(ChannelShared {
            id,
            max_frame_size: self.max_frame_size,
            pending: Mutex::new(Vec::new()),
            direct_waiter: Mutex::new(None),
            enabled: AtomicBool::new(true),
            enabled_notify: Notify::new(),
            read_closed: AtomicBool::new(false),
            write_closed: AtomicBool::new(false),
            closed_notified: AtomicBool::new(false),
            read_waiters: AtomicUsize::new(0),
            write_waiters: AtomicUsize::new(0),
            shutdown: CancellationToken::new(),
            matcher: self.matcher.clone(),
            hooks: self.hooks.clone(),
            request_tx,
        });

        let (rd, wr) = tokio::io::split(stream);
        tokio::spawn(write_pump(wr, out_rx, shared.clone()));
        tokio::spawn(read_pump(rd, shared.clone()));

        let channel = Channel {
            shared,
            out_tx,
        };
        debug!(channel = %id, "channel added");
        self.channels.lock().insert(id.0, channel.clone());
        channel
    }

    /// Returns a registered channel.
    pub fn get(&self, id: ChannelId) -> Option<Channel> {
        self.channels.lock().get(&id.0).cloned()
    }

    /// Resumes outbound processing on a channel.
    pub fn enable(&self, id: ChannelId) -> Result<(), TransportError> {
        self.get(id)
            .map(|c| c.enable())
            .ok_or(TransportError::UnknownChannel(id.0))
    }

    /// Pauses outbound processing on a channel.
    pub fn disable(&self, id: ChannelId) -> Result<(), TransportError> {
        self.get(id)
            .map(|c| c.disable())
            .ok_or(TransportError::UnknownChannel(id.0))
    }

    /// Removes a channel, failing everything still queued on it.
    pub fn remove(&self, id: ChannelId) -> Result<(), TransportError> {
        let channel = self
            .channels
            .lock()
            .remove(&id.0)
            .ok_or(TransportError::UnknownChannel(id.0))?;
        channel.shutdown();
        debug!(channel = %id, "channel removed");
        Ok(())
    }

    /// Returns the number of registered channels.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Write pump
// =============================================================================

/// Inserts a frame into the outbound FIFO, honoring urgency.
///
/// An urgent frame goes ahead of every queued non-urgent frame but
/// behind earlier urgent ones.
fn queue_outbound(queue: &mut VecDeque<Frame>, frame: Frame) {
    if frame.is_urgent() {
        let pos = queue
            .iter()
            .position(|f| !f.is_urgent())
            .unwrap_or(queue.len());
        queue.insert(pos, frame);
    } else {
        queue.push_back(frame);
    }
}

/// Writes one frame, resuming from its recorded progress across partial
/// writes, until the declared length is on the wire.
pub(crate) async fn send_frame<W>(wr: &mut W, frame: &mut Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while frame.sent < frame.len() {
        let n = wr.write(&frame.bytes()[frame.sent..]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "peer stopped accepting bytes",
            ));
        }
        frame.sent += n;
        if frame.sent < frame.len() {
            trace!(sent = frame.sent, total = frame.len(), "partial write, will resume");
        }
    }
    wr.flush().await
}

async fn write_pump<W>(
    mut wr: W,
    mut out_rx: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<ChannelShared>,
) where
    W: AsyncWrite + Unpin,
{
    let mut queue: VecDeque<Frame> = VecDeque::new();

    let failure: Option<io::Error> = 'pump: loop {
        // Pull in everything already submitted so urgent frames can
        // overtake the queue.
        while let Ok(frame) = out_rx.try_recv() {
            queue_outbound(&mut queue, frame);
        }

        if queue.is_empty() {
            tokio::select! {
                _ = shared.shutdown.cancelled() => break 'pump None,
                next = out_rx.recv() => match next {
                    Some(frame) => {
                        queue_outbound(&mut queue, frame);
                        continue;
                    }
                    None => break 'pump None,
                },
            }
        }

        // Gate on readiness; disable leaves the queue intact.
        while !shared.enabled.load(Ordering::Acquire) {
            tokio::select! {
                _ = shared.shutdown.cancelled() => break 'pump None,
                _ = shared.enabled_notify.notified() => {}
            }
        }

        let mut frame = queue.pop_front().expect("queue checked non-empty");
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                queue.push_front(frame);
                break 'pump None;
            }
            sent = send_frame(&mut wr, &mut frame) => match sent {
                Ok(()) => {
                    trace!(channel = %shared.id, len = frame.len(), "frame sent");
                    if frame.flags.direct {
                        frame.flags.queued = false;
                        let completion = frame.take_completion();
                        completion.complete(Ok(frame));
                    } else if frame.flags.no_reply {
                        // Fire-and-forget: destroyed after send.
                        frame.flags.queued = false;
                    } else {
                        shared.pending.lock().push(frame);
                    }
                }
                Err(e) => {
                    // Fail the in-flight frame through its completion path.
                    frame.flags.queued = false;
                    frame.take_completion().complete(Err(TransportError::ConnectionGone));
                    break 'pump Some(e);
                }
            }
        }
    };

    if let Some(e) = failure {
        warn!(channel = %shared.id, error = %e, "write half failed");
    }

    // Flush everything still queued on the write side.
    shared.write_closed.store(true, Ordering::Release);
    while let Ok(frame) = out_rx.try_recv() {
        queue_outbound(&mut queue, frame);
    }
    for mut frame in queue {
        frame.flags.queued = false;
        frame.take_completion().complete(Err(TransportError::ConnectionGone));
    }
    out_rx.close();
    while let Ok(mut frame) = out_rx.try_recv() {
        frame.flags.queued = false;
        frame.take_completion().complete(Err(TransportError::ConnectionGone));
    }

    shared.readiness_changed(false);
    shared.maybe_notify_closed();
}

// =============================================================================
// Read pump
// =============================================================================

/// Reads one size-prefixed frame. The length header arrives first; the
/// body read resumes until the declared length is in hand.
async fn read_frame<R>(rd: &mut R, max_frame_size: usize) -> Result<Frame, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    rd.read_exact(&mut len_buf).await?;
    let declared = u32::from_le_bytes(len_buf) as usize;

    if declared < wire::HEADER_LEN {
        return Err(TransportError::Malformed(format!(
            "declared length {} below header size",
            declared
        )));
    }
    if declared > max_frame_size {
        return Err(TransportError::Malformed(format!(
            "declared length {} exceeds cap {}",
            declared, max_frame_size
        )));
    }

    let mut bytes = BytesMut::zeroed(declared);
    bytes[..4].copy_from_slice(&len_buf);
    rd.read_exact(&mut bytes[4..]).await?;
    Ok(Frame::from_bytes(bytes, max_frame_size))
}

/// Routes one inbound frame: direct waiter, then reply matching, then
/// the serve loop.
fn deliver_inbound(shared: &ChannelShared, frame: Frame) {
    if let Some(waiter) = shared.direct_waiter.lock().take() {
        if waiter.send(frame).is_err() {
            warn!(channel = %shared.id, "direct waiter went away, frame dropped");
        }
        return;
    }

    if wire::peek_is_response(&frame) {
        let matched = {
            let mut pending = shared.pending.lock();
            pending
                .iter()
                .position(|out| shared.matcher.is_reply(out, &frame))
                .map(|pos| pending.remove(pos))
        };
        match matched {
            Some(mut original) => {
                original.absorb(&frame);
                original.flags.queued = false;
                let completion = original.take_completion();
                completion.complete(Ok(original));
            }
            None => {
                // Unmatched or duplicate reply.
                if let Some(hook) = &shared.hooks.on_unmatched {
                    hook(frame);
                } else {
                    trace!(channel = %shared.id, "unmatched reply dropped");
                }
            }
        }
        return;
    }

    if shared.request_tx.send(frame).is_err() {
        warn!(channel = %shared.id, "serve loop gone, inbound request dropped");
    }
}

async fn read_pump<R>(mut rd: R, shared: Arc<ChannelShared>)
where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            frame = read_frame(&mut rd, shared.max_frame_size) => match frame {
                Ok(frame) => deliver_inbound(&shared, frame),
                Err(e) => {
                    match &e {
                        TransportError::Io(io_err)
                            if io_err.kind() == io::ErrorKind::UnexpectedEof =>
                        {
                            debug!(channel = %shared.id, "peer closed read half");
                        }
                        other => warn!(channel = %shared.id, error = %other, "read half failed"),
                    }
                    break;
                }
            }
        }
    }

    shared.read_closed.store(true, Ordering::Release);
    shared.fail_pending();
    shared.readiness_changed(false);
    shared.maybe_notify_closed();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{self, OpClass, WireHeader};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;

    fn request_frame(id: u64) -> Frame {
        let mut f = Frame::new();
        wire::begin_request(&mut f, OpClass::Node, 0, id, true).unwrap();
        wire::finalize(&mut f).unwrap();
        f
    }

    fn reply_frame(id: u64, status: i32) -> Frame {
        let hdr = WireHeader {
            class: OpClass::Node,
            opcode: 0,
            flags: 0,
            status: 0,
            request_id: id,
        };
        let mut f = Frame::new();
        wire::begin_reply(&mut f, &hdr, status).unwrap();
        wire::finalize(&mut f).unwrap();
        f
    }

    // Takes the frame by value so spawned peers stay Send; a Frame
    // borrow held across the write would not be.
    async fn write_raw(stream: &mut DuplexStream, frame: Frame) {
        stream.write_all(frame.bytes()).await.unwrap();
        stream.flush().await.unwrap();
    }

    async fn read_one(stream: &mut DuplexStream) -> Frame {
        read_frame(stream, DEFAULT_MAX_FRAME_SIZE).await.unwrap()
    }

    // -------------------------------------------------------------------------
    // Scripted partial-write mock
    // -------------------------------------------------------------------------

    enum Step {
        Accept(usize),
        Block,
    }

    /// Writer that follows a script of partial accepts and would-blocks,
    /// then accepts everything.
    struct ScriptedWriter {
        script: VecDeque<Step>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl ScriptedWriter {
        fn new(script: Vec<Step>) -> (Self, Arc<Mutex<Vec<u8>>>) {
            let written = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    script: script.into(),
                    written: written.clone(),
                },
                written,
            )
        }
    }

    impl AsyncWrite for ScriptedWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            match self.script.pop_front() {
                Some(Step::Accept(n)) => {
                    let n = n.min(buf.len());
                    self.written.lock().extend_from_slice(&buf[..n]);
                    Poll::Ready(Ok(n))
                }
                Some(Step::Block) => {
                    cx.waker().wake_by_ref();
                    Poll::Pending
                }
                None => {
                    self.written.lock().extend_from_slice(buf);
                    Poll::Ready(Ok(buf.len()))
                }
            }
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Stream whose read half never produces data.
    struct WriteOnly(ScriptedWriter);

    impl AsyncRead for WriteOnly {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for WriteOnly {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().0).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
        }
    }

    // -------------------------------------------------------------------------
    // Partial writes
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_send_frame_resumes_across_partial_writes() {
        // 50-byte frame: 24-byte header plus 26 bytes of body.
        let mut frame = request_frame(1);
        frame.put(&[0xabu8; 26]).unwrap();
        wire::finalize(&mut frame).unwrap();
        assert_eq!(frame.len(), 50);
        let expected = frame.bytes().to_vec();

        // Writer accepts 10 bytes, would block, then drains the rest.
        let (mut wr, written) = ScriptedWriter::new(vec![Step::Accept(10), Step::Block]);
        send_frame(&mut wr, &mut frame).await.unwrap();

        assert_eq!(frame.sent, 50);
        assert_eq!(*written.lock(), expected);
    }

    #[tokio::test]
    async fn test_blocking_send_resumes_with_success_after_partial_write() {
        let (writer, written) =
            ScriptedWriter::new(vec![Step::Accept(10), Step::Block, Step::Accept(40)]);
        let transport = Transport::new();
        let (req_tx, _req_rx) = mpsc::unbounded_channel();
        let channel = transport.add_channel(WriteOnly(writer), req_tx);

        let mut frame = request_frame(7);
        frame.put(&[0x11u8; 26]).unwrap();
        wire::finalize(&mut frame).unwrap();
        let expected = frame.bytes().to_vec();

        // Direct send completes once the bytes are on the wire.
        let sent = channel.direct_send(frame).await.unwrap();
        assert_eq!(sent.len(), 50);
        assert_eq!(*written.lock(), expected);
    }

    // -------------------------------------------------------------------------
    // Ordering
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_outbound_fifo_with_urgent_jump() {
        let (client, mut server) = duplex(64 * 1024);
        let transport = Transport::new();
        let (req_tx, _req_rx) = mpsc::unbounded_channel();
        let channel = transport.add_channel(client, req_tx);

        // Hold the pump so all three frames are queued together.
        channel.disable();
        channel.enqueue_fire_and_forget(request_frame(1), false).unwrap();
        channel.enqueue_fire_and_forget(request_frame(2), false).unwrap();
        let mut urgent = request_frame(3);
        urgent.set_urgent(true);
        channel.enqueue_fire_and_forget(urgent, false).unwrap();
        channel.enable();

        let order = [
            wire::peek_request_id(&read_one(&mut server).await).unwrap(),
            wire::peek_request_id(&read_one(&mut server).await).unwrap(),
            wire::peek_request_id(&read_one(&mut server).await).unwrap(),
        ];
        assert_eq!(order, [3, 1, 2]);
    }

    #[tokio::test]
    async fn test_disable_holds_queue_until_enabled() {
        let (client, mut server) = duplex(64 * 1024);
        let transport = Transport::new();
        let (req_tx, _req_rx) = mpsc::unbounded_channel();
        let channel = transport.add_channel(client, req_tx);

        channel.disable();
        channel.enqueue_fire_and_forget(request_frame(9), false).unwrap();

        assert!(timeout(Duration::from_millis(50), read_one(&mut server))
            .await
            .is_err());

        channel.enable();
        let frame = read_one(&mut server).await;
        assert_eq!(wire::peek_request_id(&frame), Some(9));
    }

    // -------------------------------------------------------------------------
    // Reply matching
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_blocking_enqueue_resumes_with_matched_reply() {
        let (client, mut server) = duplex(64 * 1024);
        let transport = Transport::new();
        let (req_tx, _req_rx) = mpsc::unbounded_channel();
        let channel = transport.add_channel(client, req_tx);

        let peer = tokio::spawn(async move {
            let request = read_one(&mut server).await;
            let id = wire::peek_request_id(&request).unwrap();
            let mut reply = reply_frame(id, libc::ENOENT);
            reply.put(b"reply-body").unwrap();
            wire::finalize(&mut reply).unwrap();
            write_raw(&mut server, reply).await;
            server
        });

        let mut reply = channel.enqueue_blocking(request_frame(42)).await.unwrap();
        let hdr = WireHeader::decode(&reply).unwrap();
        assert_eq!(hdr.request_id, 42);
        assert_eq!(hdr.status, libc::ENOENT);
        reply.seek(wire::HEADER_LEN);
        let mut body = [0u8; 10];
        reply.get(&mut body).unwrap();
        assert_eq!(&body, b"reply-body");
        assert_eq!(channel.pending_replies(), 0);

        drop(peer.await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_reply_hits_unmatched_hook() {
        let unmatched = Arc::new(AtomicUsize::new(0));
        let counter = unmatched.clone();
        let hooks = ChannelHooks {
            on_unmatched: Some(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        };

        let (client, mut server) = duplex(64 * 1024);
        let transport = Transport::with_matcher(Arc::new(CorrelationMatcher), hooks);
        let (req_tx, _req_rx) = mpsc::unbounded_channel();
        let channel = transport.add_channel(client, req_tx);

        let peer = tokio::spawn(async move {
            let request = read_one(&mut server).await;
            let id = wire::peek_request_id(&request).unwrap();
            // Same reply twice: only one may complete the request.
            write_raw(&mut server, reply_frame(id, 0)).await;
            write_raw(&mut server, reply_frame(id, 0)).await;
            server
        });

        let reply = channel.enqueue_blocking(request_frame(5)).await.unwrap();
        assert_eq!(WireHeader::decode(&reply).unwrap().request_id, 5);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(unmatched.load(Ordering::SeqCst), 1);

        drop(peer.await.unwrap());
    }

    #[tokio::test]
    async fn test_fire_and_forget_with_reply_consumes_it_silently() {
        let unmatched = Arc::new(AtomicUsize::new(0));
        let counter = unmatched.clone();
        let hooks = ChannelHooks {
            on_unmatched: Some(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        };

        let (client, mut server) = duplex(64 * 1024);
        let transport = Transport::with_matcher(Arc::new(CorrelationMatcher), hooks);
        let (req_tx, _req_rx) = mpsc::unbounded_channel();
        let channel = transport.add_channel(client, req_tx);

        channel.enqueue_fire_and_forget(request_frame(8), true).unwrap();
        let request = read_one(&mut server).await;
        assert_eq!(channel.pending_replies(), 1);

        let id = wire::peek_request_id(&request).unwrap();
        write_raw(&mut server, reply_frame(id, 0)).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(channel.pending_replies(), 0);
        assert_eq!(unmatched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_callback_enqueue_completes_without_context() {
        let (client, mut server) = duplex(64 * 1024);
        let transport = Transport::new();
        let (req_tx, _req_rx) = mpsc::unbounded_channel();
        let channel = transport.add_channel(client, req_tx);

        let (done_tx, done_rx) = oneshot::channel();
        channel
            .enqueue_callback(request_frame(6), move |result| {
                let _ = done_tx.send(result.map(|f| wire::peek_request_id(&f)));
            })
            .unwrap();

        let request = read_one(&mut server).await;
        let id = wire::peek_request_id(&request).unwrap();
        write_raw(&mut server, reply_frame(id, 0)).await;

        let delivered = done_rx.await.unwrap().unwrap();
        assert_eq!(delivered, Some(6));
        assert_eq!(channel.pending_replies(), 0);
    }

    #[tokio::test]
    async fn test_blocking_wait_counts_as_read_waiter() {
        let (client, mut server) = duplex(64 * 1024);
        let transport = Transport::new();
        let (req_tx, _req_rx) = mpsc::unbounded_channel();
        let channel = transport.add_channel(client, req_tx);

        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.enqueue_blocking(request_frame(4)).await })
        };

        // The frame is on the wire; the caller is blocked on the reply,
        // which is a read-side wait.
        let request = read_one(&mut server).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(channel.waiters(), (1, 0));

        let id = wire::peek_request_id(&request).unwrap();
        write_raw(&mut server, reply_frame(id, 0)).await;
        waiter.await.unwrap().unwrap();
        assert_eq!(channel.waiters(), (0, 0));
    }

    // -------------------------------------------------------------------------
    // Direct transfer
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_direct_receive_bypasses_matching() {
        let (client, mut server) = duplex(64 * 1024);
        let transport = Transport::new();
        let (req_tx, _req_rx) = mpsc::unbounded_channel();
        let channel = transport.add_channel(client, req_tx);

        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.direct_receive().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A response frame that matches nothing outstanding would
        // normally be dropped; the direct waiter gets it instead.
        write_raw(&mut server, reply_frame(77, 0)).await;
        let frame = waiter.await.unwrap().unwrap();
        assert_eq!(wire::peek_request_id(&frame), Some(77));
    }

    // -------------------------------------------------------------------------
    // Failure semantics
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_channel_death_fails_pending_waiters() {
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = closed.clone();
        let hooks = ChannelHooks {
            on_closed: Some(Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        };

        let (client, mut server) = duplex(64 * 1024);
        let transport = Transport::with_matcher(Arc::new(CorrelationMatcher), hooks);
        let (req_tx, _req_rx) = mpsc::unbounded_channel();
        let channel = transport.add_channel(client, req_tx);

        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.enqueue_blocking(request_frame(1)).await })
        };

        // Let the request reach the wire, then kill the peer.
        let _ = read_one(&mut server).await;
        drop(server);

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(TransportError::ConnectionGone)));

        // Read half is gone; the write half closes on its next failure,
        // and only then does the closed-channel hook fire.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(closed.load(Ordering::SeqCst), 0);
        let _ = channel.enqueue_fire_and_forget(request_frame(2), false);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!channel.is_alive());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remove_channel_flushes_queued_frames() {
        let (client, _server) = duplex(64 * 1024);
        let transport = Transport::new();
        let (req_tx, _req_rx) = mpsc::unbounded_channel();
        let channel = transport.add_channel(client, req_tx);
        let id = channel.id();

        channel.disable();
        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.enqueue_blocking(request_frame(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        transport.remove(id).unwrap();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(TransportError::ConnectionGone)));
        assert_eq!(transport.channel_count(), 0);
        assert!(matches!(
            transport.enable(id),
            Err(TransportError::UnknownChannel(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_inbound_frame_is_malformed() {
        let (client, mut server) = duplex(64 * 1024);
        let transport = Transport::new().with_max_frame_size(128);
        let (req_tx, _req_rx) = mpsc::unbounded_channel();
        let channel = transport.add_channel(client, req_tx);

        server.write_all(&10_000u32.to_le_bytes()).await.unwrap();
        server.flush().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Read half is dead; write half still lives.
        assert!(channel.is_alive());
        let result = channel.direct_receive().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_inbound_request_reaches_serve_queue() {
        let (client, mut server) = duplex(64 * 1024);
        let transport = Transport::new();
        let (req_tx, mut req_rx) = mpsc::unbounded_channel();
        let _channel = transport.add_channel(client, req_tx);

        write_raw(&mut server, request_frame(55)).await;
        let frame = req_rx.recv().await.unwrap();
        assert_eq!(wire::peek_request_id(&frame), Some(55));
    }
}

