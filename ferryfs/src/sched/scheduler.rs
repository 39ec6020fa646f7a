//! Cooperative scheduling of request contexts.
//!
//! The scheduler spawns one context per request, reusing bookkeeping
//! records from the bounded [`ContextPool`]. Handles for contexts that
//! yielded voluntarily go on a FIFO run queue; the serve loop drains it
//! between blocking waits so long continuation chains never starve
//! later arrivals.
//!
//! Concurrency contract: the mount serializes handler execution, so at
//! most one context runs engine state at an instant. Failures inside a
//! context are fatal to that request only.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::context::{Context, ContextHandle, YieldPoint};
use super::pool::{ContextPool, DEFAULT_CONTEXT_POOL_CAP};
use crate::error::SchedError;

/// Scheduler for one mount's request contexts.
pub struct Scheduler {
    pool: Arc<ContextPool>,
    run_queue: Mutex<VecDeque<ContextHandle>>,
}

impl Scheduler {
    /// Creates a scheduler with the default context pool cap.
    pub fn new() -> Self {
        Self::with_pool_cap(DEFAULT_CONTEXT_POOL_CAP)
    }

    /// Creates a scheduler with an explicit context pool cap.
    pub fn with_pool_cap(cap: usize) -> Self {
        Self {
            pool: Arc::new(ContextPool::new(cap)),
            run_queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Returns the context pool for inspection.
    pub fn pool(&self) -> &ContextPool {
        &self.pool
    }

    /// Creates a context around an entry function.
    ///
    /// The record comes from the pool first, else a fresh one is minted.
    /// The context stays inert until the returned handle resumes it; when
    /// the entry function returns, the record is recycled into the pool
    /// (up to the cap) and the handle observes [`YieldPoint::Done`].
    pub fn create<F, Fut>(&self, entry: F) -> ContextHandle
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Context> + Send + 'static,
    {
        let record = self.pool.acquire();
        let id = record.id();
        let (yield_tx, yield_rx) = mpsc::channel(1);
        let (resume_tx, resume_rx) = mpsc::channel(1);
        let pool = self.pool.clone();

        let ctx = Context::new(id, yield_tx, resume_rx);
        trace!(ctx = %id, reuses = record.reuses(), "context created");

        let task = tokio::spawn(async move {
            let mut ctx = ctx;
            if ctx.wait_start().await.is_err() {
                // Handle dropped before the first resume; never ran.
                pool.recycle(record);
                return;
            }
            let mut ctx = entry(ctx).await;
            ctx.mark_done();
            let yield_tx = ctx.into_yield_tx();
            let _ = yield_tx.send(YieldPoint::Done).await;
            if !pool.recycle(record) {
                trace!(ctx = %id, "context record evicted, pool full");
            }
        });

        ContextHandle::new(id, resume_tx, yield_rx, task)
    }

    /// Places a yielded context on the FIFO run queue.
    pub fn schedule(&self, handle: ContextHandle) {
        trace!(ctx = %handle.id(), "context scheduled");
        self.run_queue.lock().push_back(handle);
    }

    /// Returns the number of contexts waiting on the run queue.
    pub fn queued(&self) -> usize {
        self.run_queue.lock().len()
    }

    /// Drains the run queue once, FIFO.
    ///
    /// Each queued context is resumed one step; a context that yields
    /// again goes to the back of the queue, a completed one is dropped.
    /// Returns the number of contexts resumed.
    pub async fn drain(&self) -> Result<usize, SchedError> {
        let mut resumed = 0;
        let batch = {
            let mut queue = self.run_queue.lock();
            std::mem::take(&mut *queue)
        };
        for mut handle in batch {
            resumed += 1;
            match handle.resume().await {
                Ok(YieldPoint::Suspended) | Ok(YieldPoint::MainLoop) => {
                    self.run_queue.lock().push_back(handle)
                }
                Ok(YieldPoint::Done) => {}
                Err(SchedError::Completed(id)) => {
                    debug!(ctx = id, "context completed during drain");
                }
            }
        }
        Ok(resumed)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
