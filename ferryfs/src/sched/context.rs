//! Suspendable request contexts.
//!
//! A [`Context`] is the engine-side identity of one request running
//! end-to-end inside a tokio task. The task side holds the `Context` and
//! calls [`Context::suspend`] to yield; the scheduler side holds the
//! matching [`ContextHandle`] and calls [`ContextHandle::resume`] to hand
//! control back, blocking until the context yields again or completes.
//! This replaces a shared-stack continuation swap with an explicit
//! call-and-await of the task's next yield point.

use crate::error::SchedError;
use crate::transport::Frame;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Stable identifier for a context (reused across pooled records).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u64);

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Context state flags.
#[derive(Debug, Default, Clone, Copy)]
pub struct ContextFlags {
    /// The entry function has returned.
    pub done: bool,
    /// On suspend, hand control back to the main serve loop instead of
    /// the last resumer.
    pub main_loop: bool,
}

/// What a context announced at its last yield.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YieldPoint {
    /// Suspended mid-operation; resumable.
    Suspended,
    /// Suspended, and asked for the main serve loop to continue; the
    /// context belongs on the run queue.
    MainLoop,
    /// The entry function returned; the context record was recycled.
    Done,
}

/// The task-side half of a context.
pub struct Context {
    id: ContextId,
    flags: ContextFlags,
    frame: Option<Frame>,
    yield_tx: mpsc::Sender<YieldPoint>,
    resume_rx: mpsc::Receiver<()>,
}

impl Context {
    pub(crate) fn new(
        id: ContextId,
        yield_tx: mpsc::Sender<YieldPoint>,
        resume_rx: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            id,
            flags: ContextFlags::default(),
            frame: None,
            yield_tx,
            resume_rx,
        }
    }

    /// Returns the context id.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Returns the current flags.
    pub fn flags(&self) -> ContextFlags {
        self.flags
    }

    /// Marks that on suspension the main loop continues rather than the
    /// last resumer.
    pub fn set_continue_main_loop(&mut self, v: bool) {
        self.flags.main_loop = v;
    }

    /// Attaches the frame this context is operating on.
    pub fn attach_frame(&mut self, frame: Frame) {
        self.frame = Some(frame);
    }

    /// Detaches the operation frame.
    pub fn take_frame(&mut self) -> Option<Frame> {
        self.frame.take()
    }

    /// Blocks a freshly created context until the first resume.
    ///
    /// A context is inert after creation; the entry function only starts
    /// once a holder of the handle resumes it.
    pub(crate) async fn wait_start(&mut self) -> Result<(), SchedError> {
        self.resume_rx
            .recv()
            .await
            .ok_or(SchedError::Completed(self.id.0))
    }

    /// Suspends this context until a holder of the handle resumes it.
    ///
    /// Control returns to whoever awaited the yield: the last resumer,
    /// or the run-queue drain. With the main-loop flag set the yield
    /// announces [`YieldPoint::MainLoop`] so the holder parks the
    /// context on the run queue instead of resuming it in place.
    /// Fails if the handle side went away.
    pub async fn suspend(&mut self) -> Result<(), SchedError> {
        let point = if self.flags.main_loop {
            YieldPoint::MainLoop
        } else {
            YieldPoint::Suspended
        };
        self.yield_tx
            .send(point)
            .await
            .map_err(|_| SchedError::Completed(self.id.0))?;
        self.resume_rx
            .recv()
            .await
            .ok_or(SchedError::Completed(self.id.0))
    }

    pub(crate) fn mark_done(&mut self) {
        self.flags.done = true;
    }

    pub(crate) fn into_yield_tx(self) -> mpsc::Sender<YieldPoint> {
        self.yield_tx
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .field("has_frame", &self.frame.is_some())
            .finish()
    }
}

/// The scheduler-side half of a context.
pub struct ContextHandle {
    id: ContextId,
    resume_tx: mpsc::Sender<()>,
    yield_rx: mpsc::Receiver<YieldPoint>,
    task: Option<JoinHandle<()>>,
    borrowed: bool,
}

impl ContextHandle {
    pub(crate) fn new(
        id: ContextId,
        resume_tx: mpsc::Sender<()>,
        yield_rx: mpsc::Receiver<YieldPoint>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            resume_tx,
            yield_rx,
            task: Some(task),
            borrowed: false,
        }
    }

    /// Returns the context id.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Resumes a suspended (or not-yet-started) context and waits for
    /// its next yield point.
    pub async fn resume(&mut self) -> Result<YieldPoint, SchedError> {
        self.resume_tx
            .send(())
            .await
            .map_err(|_| SchedError::Completed(self.id.0))?;
        self.yield_rx
            .recv()
            .await
            .ok_or(SchedError::Completed(self.id.0))
    }

    /// Lends control to a context the caller does not own.
    ///
    /// Control comes back when the borrowed context yields again; the
    /// borrow mark means its eventual completion hands control back
    /// rather than finishing silently.
    pub async fn borrow(&mut self) -> Result<YieldPoint, SchedError> {
        self.borrowed = true;
        self.resume().await
    }

    /// Returns whether this handle has lent control out at least once.
    pub fn is_borrowed(&self) -> bool {
        self.borrowed
    }

    /// Resumes the context until it completes.
    ///
    /// Teardown path: there is no cancellation, so this waits for the
    /// in-flight context to reach its natural end.
    pub async fn run_to_completion(&mut self) -> Result<(), SchedError> {
        loop {
            match self.resume().await {
                Ok(YieldPoint::Done) | Err(SchedError::Completed(_)) => break,
                Ok(YieldPoint::Suspended) | Ok(YieldPoint::MainLoop) => continue,
            }
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandle")
            .field("id", &self.id)
            .field("borrowed", &self.borrowed)
            .finish()
    }
}
