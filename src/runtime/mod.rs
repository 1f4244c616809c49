//! Server runtime: one reactor thread, a fixed worker pool and a stats timer.
//!
//! Components:
//! - `ConnectionTable`: open connections and their scheduling guards
//! - `reactor`: turns readiness into Accept/Read tasks
//! - `WorkerPool`/`TaskQueue`: FIFO queue drained by N threads
//! - `BatchAccumulator`: groups payloads into Write tasks
//! - `StatisticsRegistry`: per-connection throughput, reported periodically
//!
//! All shared state lives in one `Shared` value built at startup and passed
//! by reference to the reactor and every task.

mod batch;
mod connection;
mod pool;
mod reactor;
mod stats;
mod task;

pub use batch::{BatchAccumulator, BatchEntry};
pub use connection::{ConnId, Connection};
pub use pool::{TaskQueue, WorkerPool};
pub use stats::{Snapshot, StatisticsRegistry, StatsReporter};
pub use task::{AcceptTask, ReadTask, Task, WriteTask};

use crate::config::Config;
use connection::{ConnectionTable, Guard};
use crossbeam_channel::Receiver;
use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use mio::{Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use reactor::{LISTENER_TOKEN, WAKER_TOKEN};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// State shared by the reactor and all tasks.
pub(crate) struct Shared {
    pub(crate) registry: Registry,
    pub(crate) listener: TcpListener,
    pub(crate) connections: Mutex<ConnectionTable>,
    pub(crate) queue: TaskQueue<Task>,
    pub(crate) batches: BatchAccumulator,
    pub(crate) stats: Arc<StatisticsRegistry>,
}

impl Shared {
    fn new(
        registry: Registry,
        listener: TcpListener,
        queue: TaskQueue<Task>,
        batch_size: usize,
        batch_time: Duration,
        stats: Arc<StatisticsRegistry>,
    ) -> Self {
        Self {
            registry,
            listener,
            connections: Mutex::new(ConnectionTable::new()),
            batches: BatchAccumulator::new(batch_size, batch_time, queue.clone()),
            queue,
            stats,
        }
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Add an accepted stream to the table, start counting it and register
    /// it for read interest.
    pub(crate) fn admit(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let mut table = self.connections.lock();
        let conn = table.insert(stream, peer);
        self.stats.register(conn.id());

        let fd = conn.raw_fd();
        if let Err(e) =
            self.registry
                .register(&mut SourceFd(&fd), Token(conn.key()), Interest::READABLE)
        {
            table.remove(&conn);
            self.stats.deregister(conn.id());
            conn.close();
            return Err(e);
        }

        debug!(conn = %conn.id(), peer = %peer, open = table.len(), "Accepted connection");
        Ok(())
    }

    /// Finish a read task: clear the guard, then restore read interest so
    /// the reactor sees the next payload.
    pub(crate) fn rearm(&self, conn: &Connection) -> io::Result<()> {
        let mut table = self.connections.lock();
        let Some(slot) = table.slot_of(conn) else {
            // Removed during shutdown.
            return Ok(());
        };
        if slot.guard == Guard::Closing {
            return Ok(());
        }
        slot.guard = Guard::Armed;

        let fd = conn.raw_fd();
        let registered =
            self.registry
                .register(&mut SourceFd(&fd), Token(conn.key()), Interest::READABLE);
        drop(table);

        if let Err(e) = registered {
            self.disconnect(conn);
            return Err(e);
        }
        Ok(())
    }

    /// Finish an accept task: let the reactor schedule the next one.
    pub(crate) fn rearm_listener(&self) -> io::Result<()> {
        let mut table = self.connections.lock();
        *table.listener_guard() = Guard::Armed;

        let fd = self.listener.as_raw_fd();
        self.registry
            .register(&mut SourceFd(&fd), LISTENER_TOKEN, Interest::READABLE)
    }

    /// Tear a connection down: stop counting it, close it and drop it
    /// from the table. Its read interest stays cleared.
    pub(crate) fn disconnect(&self, conn: &Connection) {
        let mut table = self.connections.lock();
        if let Some(slot) = table.slot_of(conn) {
            slot.guard = Guard::Closing;
        }
        self.stats.deregister(conn.id());
        conn.close();
        table.remove(conn);

        debug!(conn = %conn.id(), peer = %conn.peer(), "Client disconnected");
    }
}

/// Stops a running [`Server`] from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake reactor");
        }
    }
}

/// A bound server, ready to run.
pub struct Server {
    poll: Poll,
    shared: Arc<Shared>,
    tasks: Receiver<Task>,
    workers: usize,
    stats_interval: Duration,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl Server {
    /// Bind the listener and build all shared state. No threads are started
    /// until [`Server::run`].
    pub fn bind(config: &Config) -> io::Result<Self> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let addr = config
            .listen_addr()
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no listen address"))?;

        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(reactor::create_listener(addr, config.backlog)?);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let (queue, tasks) = TaskQueue::new(config.queue_capacity);
        let shared = Arc::new(Shared::new(
            poll.registry().try_clone()?,
            listener,
            queue,
            config.batch_size,
            config.batch_time,
            Arc::new(StatisticsRegistry::new()),
        ));

        info!(
            addr = %shared.local_addr()?,
            workers = config.workers,
            batch_size = config.batch_size,
            batch_time_secs = config.batch_time.as_secs(),
            queue_capacity = ?config.queue_capacity,
            "Server bound"
        );

        Ok(Self {
            poll,
            shared,
            tasks,
            workers: config.workers,
            stats_interval: config.stats_interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            waker,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.shared.local_addr()
    }

    pub fn stats(&self) -> Arc<StatisticsRegistry> {
        Arc::clone(&self.shared.stats)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Start the workers and the stats timer, then run the reactor on the
    /// calling thread until shut down.
    pub fn run(self) -> io::Result<()> {
        let Server {
            poll,
            shared,
            tasks,
            workers,
            stats_interval,
            shutdown,
            waker: _waker,
        } = self;

        let pool = {
            let shared = Arc::clone(&shared);
            WorkerPool::spawn(workers, tasks, move |task: Task| task.process(&shared))?
        };
        let reporter = StatsReporter::spawn(Arc::clone(&shared.stats), stats_interval)?;

        let result = reactor::run(poll, &shared, &shutdown);

        // Closing every socket unblocks workers waiting on a slow client.
        let open = shared.connections.lock().drain();
        for conn in &open {
            shared.stats.deregister(conn.id());
            conn.close();
        }
        info!(closed = open.len(), "Closed open connections");

        reporter.shutdown();
        pool.shutdown();
        info!("Server stopped");
        result
    }
}

/// Bind and run a server until the process exits.
pub fn run(config: Config) -> io::Result<()> {
    Server::bind(&config)?.run()
}

/// Shared state on a loopback listener, with the receiving end of the task
/// queue instead of a worker pool.
#[cfg(test)]
pub(crate) fn test_shared(
    batch_size: usize,
    batch_time: Duration,
) -> (Arc<Shared>, Poll, Receiver<Task>) {
    let poll = Poll::new().unwrap();
    let mut listener =
        TcpListener::from_std(reactor::create_listener("127.0.0.1:0".parse().unwrap(), 64).unwrap());
    poll.registry()
        .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
        .unwrap();

    let (queue, rx) = TaskQueue::new(None);
    let shared = Shared::new(
        poll.registry().try_clone().unwrap(),
        listener,
        queue,
        batch_size,
        batch_time,
        Arc::new(StatisticsRegistry::new()),
    );
    (Arc::new(shared), poll, rx)
}
