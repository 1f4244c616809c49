//! Units of work executed by the worker pool.
//!
//! The reactor only decides what is ready; these tasks do the blocking part
//! (accepting, reading a payload, writing digests) on worker threads.

use crate::digest::{digest_hex, PAYLOAD_SIZE};
use crate::runtime::batch::BatchEntry;
use crate::runtime::connection::{Connection, ReadOutcome};
use crate::runtime::stats::StatisticsRegistry;
use crate::runtime::Shared;
use bytes::BytesMut;
use std::io;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// A task queued for the worker pool.
#[derive(Debug)]
pub enum Task {
    Accept(AcceptTask),
    Read(ReadTask),
    Write(WriteTask),
}

impl Task {
    /// Run the task to completion on the calling worker.
    pub(crate) fn process(self, shared: &Shared) -> io::Result<()> {
        match self {
            Task::Accept(task) => task.process(shared),
            Task::Read(task) => task.process(shared),
            Task::Write(task) => task.process(&shared.stats),
        }
    }
}

/// Accept one pending connection from the listener.
#[derive(Debug, Default)]
pub struct AcceptTask;

impl AcceptTask {
    fn process(self, shared: &Shared) -> io::Result<()> {
        let result = match shared.listener.accept() {
            Ok((stream, peer)) => shared.admit(stream, peer),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!("Spurious accept wakeup");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Accept error");
                Ok(())
            }
        };
        shared.rearm_listener()?;
        result
    }
}

/// Read exactly one payload from a connection.
#[derive(Debug)]
pub struct ReadTask {
    conn: Arc<Connection>,
}

impl ReadTask {
    pub(crate) fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    fn process(self, shared: &Shared) -> io::Result<()> {
        let mut buf = BytesMut::zeroed(PAYLOAD_SIZE);

        match self.conn.read_payload(&mut buf) {
            Ok(ReadOutcome::Complete) => {
                shared.batches.add_unit(buf.freeze(), Arc::clone(&self.conn));
                shared.rearm(&self.conn)
            }
            Ok(ReadOutcome::Spurious) => shared.rearm(&self.conn),
            Ok(ReadOutcome::Eof { received }) => {
                if received > 0 {
                    debug!(
                        conn = %self.conn.id(),
                        received,
                        "Discarding partial payload"
                    );
                }
                shared.disconnect(&self.conn);
                Ok(())
            }
            Err(e) => {
                debug!(conn = %self.conn.id(), error = %e, "Read failed");
                shared.disconnect(&self.conn);
                Ok(())
            }
        }
    }
}

/// Reply with a digest for every entry of a flushed batch.
#[derive(Debug)]
pub struct WriteTask {
    entries: Vec<BatchEntry>,
}

impl WriteTask {
    pub(crate) fn new(entries: Vec<BatchEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Best effort: a failed write loses that one reply and the rest of
    /// the batch is still sent.
    fn process(self, stats: &StatisticsRegistry) -> io::Result<()> {
        let mut failed = 0usize;

        for entry in &self.entries {
            let digest = digest_hex(&entry.payload);
            match entry.conn.write_all(digest.as_bytes()) {
                Ok(()) => {
                    stats.increment(entry.conn.id());
                }
                Err(e) => {
                    failed += 1;
                    debug!(conn = %entry.conn.id(), error = %e, "Failed to write digest");
                }
            }
        }

        if failed > 0 {
            warn!(failed, total = self.entries.len(), "Batch partially written");
        }
        Ok(())
    }
}
