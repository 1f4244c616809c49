//! scaling-server: a thread-pool TCP server that answers every 8000-byte
//! payload with its SHA-1 digest.
//!
//! Architecture:
//! - One reactor thread (mio: epoll on Linux, kqueue on macOS) decides
//!   which sockets are ready and never performs I/O itself
//! - A fixed pool of worker threads accepts connections, reads payloads
//!   and writes digests
//! - Payloads are grouped into batches flushed by count or elapsed time
//! - Per-connection throughput is reported every interval
//!
//! Configuration comes from positional CLI arguments, optional flags and an
//! optional TOML file.

pub mod client;
pub mod config;
pub mod digest;
pub mod runtime;

pub use config::{Config, ConfigError};
pub use runtime::{run, Server, ShutdownHandle};
