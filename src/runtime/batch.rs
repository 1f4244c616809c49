//! Batching of inbound payloads into write tasks.
//!
//! Thresholds are checked only when a unit arrives. A partially filled
//! batch is not flushed by the passage of time alone; it waits for the
//! next unit, which then sees the expired window and flushes everything.

use crate::runtime::connection::Connection;
use crate::runtime::pool::TaskQueue;
use crate::runtime::task::{Task, WriteTask};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Upper bound on the capacity reserved for a fresh batch.
const MAX_PREALLOC: usize = 1024;

/// A payload waiting for its digest, plus where to send the digest.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub payload: Bytes,
    pub conn: Arc<Connection>,
}

#[derive(Debug)]
struct Window {
    entries: Vec<BatchEntry>,
    started: Instant,
}

/// Collects units from all workers and emits a write task per batch.
#[derive(Debug)]
pub struct BatchAccumulator {
    window: Mutex<Window>,
    batch_size: usize,
    batch_time: Duration,
    queue: TaskQueue<Task>,
}

impl BatchAccumulator {
    pub fn new(batch_size: usize, batch_time: Duration, queue: TaskQueue<Task>) -> Self {
        Self {
            window: Mutex::new(Window {
                entries: Vec::with_capacity(batch_size.min(MAX_PREALLOC)),
                started: Instant::now(),
            }),
            batch_size,
            batch_time,
            queue,
        }
    }

    /// Append one unit; flush if the count or time threshold is reached.
    ///
    /// The threshold check, swap and enqueue happen under one lock, so one
    /// crossing produces exactly one write task. Returns whether this call
    /// flushed.
    pub fn add_unit(&self, payload: Bytes, conn: Arc<Connection>) -> bool {
        let mut window = self.window.lock();
        window.entries.push(BatchEntry { payload, conn });

        let elapsed = window.started.elapsed();
        if window.entries.len() < self.batch_size && elapsed < self.batch_time {
            return false;
        }

        let fresh = Vec::with_capacity(self.batch_size.min(MAX_PREALLOC));
        let batch = std::mem::replace(&mut window.entries, fresh);
        window.started = Instant::now();

        let size = batch.len();
        trace!(size, elapsed_ms = elapsed.as_millis() as u64, "Flushing batch");
        if self.queue.push(Task::Write(WriteTask::new(batch))).is_err() {
            warn!(size, "Task queue closed, dropping batch");
        }
        true
    }

    /// Units accumulated since the last flush.
    pub fn pending(&self) -> usize {
        self.window.lock().entries.len()
    }
}
