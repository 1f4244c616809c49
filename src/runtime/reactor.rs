//! mio reactor loop.
//!
//! Readiness-based model: poll tells us which sockets are ready and the
//! reactor turns each into a task for the worker pool. It never reads,
//! writes or accepts itself, so one iteration costs the same no matter how
//! large the payloads are.
//!
//! Before a task is queued the socket's interest is cleared and its guard
//! set to `InFlight`, both under the connection table lock. The task re-arms
//! the socket when it finishes, so a connection never has two tasks at once.

use crate::runtime::connection::{ConnectionTable, Guard};
use crate::runtime::task::{AcceptTask, ReadTask, Task};
use crate::runtime::Shared;
use mio::unix::SourceFd;
use mio::{Events, Poll, Token};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub(crate) const LISTENER_TOKEN: Token = Token(usize::MAX);
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX - 1);

const EVENTS_CAPACITY: usize = 1024;

/// Run the reactor on the calling thread until `shutdown` is set and the
/// waker fires.
pub(crate) fn run(mut poll: Poll, shared: &Shared, shutdown: &AtomicBool) -> io::Result<()> {
    let mut events = Events::with_capacity(EVENTS_CAPACITY);
    let mut ready = Vec::with_capacity(EVENTS_CAPACITY);

    info!(addr = %shared.local_addr()?, "Reactor started");

    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        if shutdown.load(Ordering::Acquire) {
            info!("Reactor stopping");
            return Ok(());
        }

        {
            let mut table = shared.connections.lock();
            for event in events.iter() {
                let task = match event.token() {
                    WAKER_TOKEN => None,
                    LISTENER_TOKEN => dispatch_accept(shared, &mut table),
                    Token(key) => dispatch_read(shared, &mut table, key),
                };
                ready.extend(task);
            }
        }

        // Pushed outside the table lock: with a bounded queue the push may
        // block until a worker frees room, and workers need the lock to
        // re-arm.
        for task in ready.drain(..) {
            if shared.queue.push(task).is_err() {
                warn!("Task queue closed, reactor stopping");
                return Ok(());
            }
        }
    }
}

/// Schedule an accept unless one is already outstanding.
pub(crate) fn dispatch_accept(shared: &Shared, table: &mut ConnectionTable) -> Option<Task> {
    let guard = table.listener_guard();
    if *guard != Guard::Armed {
        return None;
    }

    let fd = shared.listener.as_raw_fd();
    if let Err(e) = shared.registry.deregister(&mut SourceFd(&fd)) {
        warn!(error = %e, "Failed to clear listener interest");
    }
    *guard = Guard::InFlight;
    Some(Task::Accept(AcceptTask))
}

/// Schedule a read for the connection at `key` unless one is already
/// outstanding or the connection is going away.
pub(crate) fn dispatch_read(
    shared: &Shared,
    table: &mut ConnectionTable,
    key: usize,
) -> Option<Task> {
    // Stale token: the connection is gone.
    let slot = table.slot_mut(key)?;
    if slot.guard != Guard::Armed {
        return None;
    }

    let fd = slot.conn.raw_fd();
    if let Err(e) = shared.registry.deregister(&mut SourceFd(&fd)) {
        debug!(conn = %slot.conn.id(), error = %e, "Failed to clear read interest");
    }
    slot.guard = Guard::InFlight;
    Some(Task::Read(ReadTask::new(Arc::clone(&slot.conn))))
}

/// Create a non-blocking listening socket with SO_REUSEADDR.
pub(crate) fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::connection::loopback_pair;
    use crate::runtime::test_shared;
    use std::time::Duration;

    const FOREVER: Duration = Duration::from_secs(24 * 60 * 60);

    #[test]
    fn test_one_read_task_per_connection() {
        let (shared, _poll, _rx) = test_shared(1, FOREVER);
        let (stream, peer, _client) = loopback_pair();

        let mut table = shared.connections.lock();
        let conn = table.insert(stream, peer);
        let fd = conn.raw_fd();
        shared
            .registry
            .register(&mut SourceFd(&fd), Token(conn.key()), mio::Interest::READABLE)
            .unwrap();

        // Two readiness events before the first task completes.
        assert!(matches!(
            dispatch_read(&shared, &mut table, conn.key()),
            Some(Task::Read(_))
        ));
        assert!(dispatch_read(&shared, &mut table, conn.key()).is_none());
        assert_eq!(table.slot_of(&conn).unwrap().guard, Guard::InFlight);
        drop(table);

        // Completing the task re-arms the connection.
        shared.rearm(&conn).unwrap();
        let mut table = shared.connections.lock();
        assert!(dispatch_read(&shared, &mut table, conn.key()).is_some());
    }

    #[test]
    fn test_one_accept_task_in_flight() {
        let (shared, _poll, _rx) = test_shared(1, FOREVER);
        let mut table = shared.connections.lock();

        assert!(matches!(
            dispatch_accept(&shared, &mut table),
            Some(Task::Accept(_))
        ));
        assert!(dispatch_accept(&shared, &mut table).is_none());
    }

    #[test]
    fn test_stale_token_is_ignored() {
        let (shared, _poll, _rx) = test_shared(1, FOREVER);
        let mut table = shared.connections.lock();
        assert!(dispatch_read(&shared, &mut table, 17).is_none());
    }

    #[test]
    fn test_create_listener_binds_ephemeral_port() {
        let listener = create_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }
}
