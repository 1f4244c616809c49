//! Per-connection throughput accounting and periodic reporting.
//!
//! Counters live in a concurrent map so workers on different connections
//! never contend. A read/write gate makes report-and-reset a single
//! critical section: updates share the gate, the report holds it alone.

use crate::runtime::connection::ConnId;
use chrono::{DateTime, Local};
use crossbeam_channel::{RecvTimeoutError, Sender};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info};

/// Concurrency-safe map from connection to messages served this window.
#[derive(Debug, Default)]
pub struct StatisticsRegistry {
    counters: DashMap<ConnId, AtomicU64>,
    gate: RwLock<()>,
}

impl StatisticsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting for a connection. A reconnect always starts at zero.
    pub fn register(&self, id: ConnId) {
        let _shared = self.gate.read();
        self.counters.insert(id, AtomicU64::new(0));
    }

    /// Stop counting for a connection. Returns false if it was not registered.
    pub fn deregister(&self, id: ConnId) -> bool {
        let _shared = self.gate.read();
        let removed = self.counters.remove(&id).is_some();
        if removed {
            debug!(conn = %id, "Connection removed from statistics");
        }
        removed
    }

    /// Count one served message.
    ///
    /// For a connection that is not (or no longer) registered this is a
    /// lost update: nothing is recorded and false is returned.
    pub fn increment(&self, id: ConnId) -> bool {
        let _shared = self.gate.read();
        match self.counters.get(&id) {
            Some(counter) => {
                counter.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Number of registered connections.
    pub fn active(&self) -> usize {
        self.counters.len()
    }

    /// Messages counted for `id` in the current window.
    pub fn count(&self, id: ConnId) -> Option<u64> {
        self.counters.get(&id).map(|c| c.load(Ordering::Relaxed))
    }

    /// Messages counted across all connections in the current window.
    pub fn total(&self) -> u64 {
        self.counters
            .iter()
            .map(|entry| entry.value().load(Ordering::Relaxed))
            .sum()
    }

    /// Summarize the window that just ended, then zero every counter.
    ///
    /// `interval` is the window length used to turn counts into rates.
    pub fn report(&self, interval: Duration) -> Snapshot {
        let _exclusive = self.gate.write();
        let secs = interval.as_secs_f64();

        let rates: Vec<f64> = self
            .counters
            .iter()
            .map(|entry| entry.value().swap(0, Ordering::Relaxed) as f64 / secs)
            .collect();

        Snapshot::from_rates(Local::now(), &rates)
    }
}

/// One statistics report.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub timestamp: DateTime<Local>,
    /// Messages per second across all connections.
    pub total_throughput: f64,
    pub active: usize,
    /// Messages per second per connection, averaged.
    pub mean: f64,
    /// Sample standard deviation of per-connection throughput.
    pub std_dev: f64,
}

impl Snapshot {
    fn from_rates(timestamp: DateTime<Local>, rates: &[f64]) -> Self {
        let active = rates.len();
        let total_throughput: f64 = rates.iter().sum();
        let mean = if active == 0 {
            0.0
        } else {
            total_throughput / active as f64
        };
        let std_dev = if active > 1 {
            let sum_sq: f64 = rates.iter().map(|r| (r - mean) * (r - mean)).sum();
            (sum_sq / (active - 1) as f64).sqrt()
        } else {
            0.0
        };

        Self {
            timestamp,
            total_throughput,
            active,
            mean,
            std_dev,
        }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] Server Throughput: {:.2} message(s)/s, Active Client Connections: {}, \
             Mean Per-client Throughput: {:.2} message(s)/s, \
             Std. Dev. Of Per-client Throughput: {:.2} message(s)/s",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.total_throughput,
            self.active,
            self.mean,
            self.std_dev,
        )
    }
}

/// Timer thread that reports and resets the registry every interval.
pub struct StatsReporter {
    handle: Option<JoinHandle<()>>,
    stop: Option<Sender<()>>,
}

impl StatsReporter {
    pub fn spawn(registry: Arc<StatisticsRegistry>, interval: Duration) -> io::Result<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);

        let handle = thread::Builder::new()
            .name("stats".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let snapshot = registry.report(interval);
                        info!("{snapshot}");
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;

        Ok(Self {
            handle: Some(handle),
            stop: Some(stop_tx),
        })
    }

    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatsReporter {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
