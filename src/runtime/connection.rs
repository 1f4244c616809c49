//! Connection records and the table the reactor dispatches from.
//!
//! The table is owned by the reactor for readiness tracking. Tasks hold
//! `Arc<Connection>` clones, so a connection removed from the table stays
//! valid (but closed) until the last queued task referencing it is done.

use mio::net::TcpStream;
use parking_lot::Mutex;
use slab::Slab;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Identity of a connection, stable for its lifetime and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(u64);

impl ConnId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Scheduling state of a connection (or of the listener).
///
/// Only mutated while holding the connection table lock, which is the
/// lock the reactor holds while dispatching readiness events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Guard {
    /// Registered for read interest, no task outstanding.
    Armed,
    /// Interest cleared; exactly one task is queued or executing.
    InFlight,
    /// Being torn down; readiness is ignored.
    Closing,
}

/// Result of trying to read one full payload.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    /// The buffer was filled completely.
    Complete,
    /// The peer closed the stream after `received` bytes.
    Eof { received: usize },
    /// Nothing was readable; the wakeup was stale.
    Spurious,
}

/// A single client connection.
pub struct Connection {
    id: ConnId,
    /// Slab key, doubling as the readiness token.
    key: usize,
    stream: TcpStream,
    peer: SocketAddr,
    closed: AtomicBool,
    /// Serializes writers so two digests never interleave on the wire.
    write_lock: Mutex<()>,
}

impl Connection {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub(crate) fn key(&self) -> usize {
        self.key
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Fill `buf` from the stream, waiting for readiness if the payload
    /// arrives in pieces.
    ///
    /// Returns `Spurious` only if nothing at all could be read.
    pub(crate) fn read_payload(&self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        let mut filled = 0;
        while filled < buf.len() {
            match (&self.stream).read(&mut buf[filled..]) {
                Ok(0) => return Ok(ReadOutcome::Eof { received: filled }),
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if filled == 0 {
                        return Ok(ReadOutcome::Spurious);
                    }
                    wait_for(self.raw_fd(), libc::POLLIN)?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(ReadOutcome::Complete)
    }

    /// Write all of `data`, blocking the calling worker until it is sent.
    pub(crate) fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let _writer = self.write_lock.lock();
        if self.is_closed() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            ));
        }

        let mut written = 0;
        while written < data.len() {
            match (&self.stream).write(&data[written..]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0"));
                }
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    wait_for(self.raw_fd(), libc::POLLOUT)?;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Shut the socket down in both directions.
    ///
    /// Returns false if the connection was already closed. The descriptor
    /// itself is released when the last reference is dropped.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        true
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Block until `fd` reports one of `events` (or an error/hangup).
fn wait_for(fd: RawFd, events: libc::c_short) -> io::Result<()> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    loop {
        // SAFETY: pfd is a valid, exclusively borrowed pollfd and nfds is 1.
        let rc = unsafe { libc::poll(&mut pfd, 1, -1) };
        if rc >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// A table entry: the connection plus its scheduling guard.
#[derive(Debug)]
pub(crate) struct Slot {
    pub(crate) conn: Arc<Connection>,
    pub(crate) guard: Guard,
}

/// Registry of open connections using slab allocation.
///
/// Also carries the listener's guard so accept scheduling follows the same
/// one-task-in-flight rule as reads.
#[derive(Debug)]
pub(crate) struct ConnectionTable {
    slots: Slab<Slot>,
    listener: Guard,
    next_id: u64,
}

impl ConnectionTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: Slab::new(),
            listener: Guard::Armed,
            next_id: 0,
        }
    }

    /// Insert a freshly accepted stream in the `Armed` state.
    pub(crate) fn insert(&mut self, stream: TcpStream, peer: SocketAddr) -> Arc<Connection> {
        let entry = self.slots.vacant_entry();
        let conn = Arc::new(Connection {
            id: ConnId(self.next_id),
            key: entry.key(),
            stream,
            peer,
            closed: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        });
        self.next_id += 1;
        entry.insert(Slot {
            conn: Arc::clone(&conn),
            guard: Guard::Armed,
        });
        conn
    }

    /// Slot at a readiness token, whichever connection currently owns it.
    pub(crate) fn slot_mut(&mut self, key: usize) -> Option<&mut Slot> {
        self.slots.get_mut(key)
    }

    /// Slot owned by `conn`, if it has not been removed (and reused) since.
    pub(crate) fn slot_of(&mut self, conn: &Connection) -> Option<&mut Slot> {
        self.slots
            .get_mut(conn.key)
            .filter(|slot| slot.conn.id == conn.id)
    }

    /// Remove `conn` from the table.
    pub(crate) fn remove(&mut self, conn: &Connection) -> Option<Arc<Connection>> {
        self.slot_of(conn)?;
        Some(self.slots.remove(conn.key).conn)
    }

    pub(crate) fn listener_guard(&mut self) -> &mut Guard {
        &mut self.listener
    }

    /// Remove every connection, returning them for teardown.
    pub(crate) fn drain(&mut self) -> Vec<Arc<Connection>> {
        self.slots.drain().map(|slot| slot.conn).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    pub(crate) fn keys(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots.iter().map(|(key, _)| key)
    }
}

/// Connected loopback pair: the server side as a mio stream, plus the
/// blocking client side.
#[cfg(test)]
pub(crate) fn loopback_pair() -> (TcpStream, SocketAddr, std::net::TcpStream) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (server, peer) = listener.accept().unwrap();
    server.set_nonblocking(true).unwrap();
    (TcpStream::from_std(server), peer, client)
}
