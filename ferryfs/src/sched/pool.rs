//! Bounded pool of reusable context records (the "magazine").
//!
//! The async runtime already pools task resources, so what survives here
//! is the per-context bookkeeping record: recycling one keeps its id slot
//! and reuse counter warm instead of minting a fresh identity per request.
//! The pool is capped; recycling into a full pool drops the record.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use super::context::ContextId;

/// Default cap on cached context records.
pub const DEFAULT_CONTEXT_POOL_CAP: usize = 16;

/// Reusable per-context bookkeeping.
#[derive(Debug)]
pub struct ContextRecord {
    id: ContextId,
    /// How many requests this record has served.
    reuses: u32,
}

impl ContextRecord {
    /// Returns the context id carried by this record.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Returns how many times the record has been reused.
    pub fn reuses(&self) -> u32 {
        self.reuses
    }
}

/// Bounded free list of context records.
pub struct ContextPool {
    cap: usize,
    free: Mutex<Vec<ContextRecord>>,
    next_id: AtomicU64,
}

impl ContextPool {
    /// Creates a pool with the given cap.
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            free: Mutex::new(Vec::with_capacity(cap)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Draws a record from the pool, or mints a fresh one.
    pub fn acquire(&self) -> ContextRecord {
        if let Some(mut rec) = self.free.lock().pop() {
            rec.reuses += 1;
            return rec;
        }
        ContextRecord {
            id: ContextId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            reuses: 0,
        }
    }

    /// Returns a finished record to the pool.
    ///
    /// Returns `false` when the pool is at its cap and the record was
    /// dropped instead of cached.
    pub fn recycle(&self, record: ContextRecord) -> bool {
        let mut free = self.free.lock();
        if free.len() >= self.cap {
            return false;
        }
        free.push(record);
        true
    }

    /// Returns the number of cached records.
    pub fn cached(&self) -> usize {
        self.free.lock().len()
    }

    /// Returns the pool cap.
    pub fn cap(&self) -> usize {
        self.cap
    }
}
