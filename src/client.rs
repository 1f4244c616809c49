//! Load-generating client.
//!
//! Opens one connection, sends random payloads at a fixed rate and checks
//! every reply against the digests of what it sent.

use crate::digest::{digest_hex, DIGEST_LEN, PAYLOAD_SIZE};
use clap::Parser;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Command-line arguments for the client
#[derive(Parser, Debug, Clone)]
#[command(name = "scaling-client")]
#[command(version = "0.1.0")]
#[command(about = "Sends random 8000-byte payloads and verifies the digests", long_about = None)]
pub struct ClientArgs {
    /// Server host name or address
    pub host: String,

    /// Server port
    pub port: u16,

    /// Messages per second
    #[arg(value_parser = clap::value_parser!(u32).range(1..))]
    pub rate: u32,

    /// Stop after this many messages have been acknowledged
    #[arg(short = 'n', long)]
    pub count: Option<u64>,

    /// Seconds between statistics lines
    #[arg(short = 's', long, default_value_t = 20)]
    pub stats_interval: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Digests sent but not yet acknowledged, oldest first.
#[derive(Debug, Default)]
pub struct PendingDigests {
    inner: Mutex<VecDeque<String>>,
}

impl PendingDigests {
    pub fn push(&self, digest: String) {
        self.inner.lock().push_back(digest);
    }

    /// Remove `digest` if it is pending. Replies usually arrive in order,
    /// so the search starts at the front.
    pub fn acknowledge(&self, digest: &str) -> bool {
        let mut pending = self.inner.lock();
        match pending.iter().position(|d| d == digest) {
            Some(idx) => {
                pending.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// Running totals for one client.
#[derive(Debug, Default)]
pub struct ClientStatistics {
    sent: AtomicU64,
    received: AtomicU64,
}

impl ClientStatistics {
    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) -> u64 {
        self.received.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

impl fmt::Display for ClientStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] Total Sent Count: {}, Total Received Count: {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            self.sent(),
            self.received()
        )
    }
}

/// Run the client until the server closes the connection or `count`
/// messages are acknowledged.
pub fn run(args: ClientArgs) -> io::Result<Arc<ClientStatistics>> {
    let stream = TcpStream::connect((args.host.as_str(), args.port))?;
    stream.set_nodelay(true)?;
    info!(server = %stream.peer_addr()?, rate = args.rate, "Connected");

    let pending = Arc::new(PendingDigests::default());
    let stats = Arc::new(ClientStatistics::default());

    {
        let writer = stream.try_clone()?;
        let pending = Arc::clone(&pending);
        let stats = Arc::clone(&stats);
        let pause = Duration::from_secs_f64(1.0 / f64::from(args.rate));
        let count = args.count;
        thread::Builder::new()
            .name("sender".to_string())
            .spawn(move || send_loop(writer, pause, count, &pending, &stats))?;
    }

    {
        let stats = Arc::clone(&stats);
        let ticker = crossbeam_channel::tick(Duration::from_secs(args.stats_interval.max(1)));
        thread::Builder::new()
            .name("client-stats".to_string())
            .spawn(move || {
                for _ in ticker.iter() {
                    info!("{stats}");
                }
            })?;
    }

    receive_loop(stream, args.count, &pending, &stats)?;
    Ok(stats)
}

fn send_loop(
    mut stream: TcpStream,
    pause: Duration,
    count: Option<u64>,
    pending: &PendingDigests,
    stats: &ClientStatistics,
) {
    let mut rng = rand::rng();
    let mut payload = vec![0u8; PAYLOAD_SIZE];
    let mut sent = 0u64;

    while count.map_or(true, |limit| sent < limit) {
        rng.fill(&mut payload[..]);
        // Recorded before sending so a fast reply always finds it.
        pending.push(digest_hex(&payload));

        if let Err(e) = stream.write_all(&payload) {
            error!(error = %e, "Unable to send message");
            return;
        }
        stats.record_sent();
        sent += 1;
        thread::sleep(pause);
    }
    debug!(sent, "Sender finished");
}

fn receive_loop(
    mut stream: TcpStream,
    count: Option<u64>,
    pending: &PendingDigests,
    stats: &ClientStatistics,
) -> io::Result<()> {
    let mut reply = [0u8; DIGEST_LEN];

    loop {
        match stream.read_exact(&mut reply) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                info!("Server closed the connection");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let digest = String::from_utf8_lossy(&reply);
        if pending.acknowledge(&digest) {
            let received = stats.record_received();
            debug!(%digest, outstanding = pending.len(), "Acknowledged");
            if count == Some(received) {
                info!("{stats}");
                return Ok(());
            }
        } else {
            warn!(%digest, "Reply does not match any pending message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acknowledge_removes_only_match() {
        let pending = PendingDigests::default();
        pending.push("a".repeat(DIGEST_LEN));
        pending.push("b".repeat(DIGEST_LEN));

        assert!(pending.acknowledge(&"b".repeat(DIGEST_LEN)));
        assert!(!pending.acknowledge(&"b".repeat(DIGEST_LEN)));
        assert!(!pending.acknowledge(&"c".repeat(DIGEST_LEN)));
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_duplicate_payloads_need_two_replies() {
        let pending = PendingDigests::default();
        let digest = digest_hex(&[0u8; PAYLOAD_SIZE]);
        pending.push(digest.clone());
        pending.push(digest.clone());

        assert!(pending.acknowledge(&digest));
        assert!(pending.acknowledge(&digest));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_statistics_line() {
        let stats = ClientStatistics::default();
        stats.record_sent();
        stats.record_sent();
        assert_eq!(stats.record_received(), 1);

        let line = stats.to_string();
        assert!(line.ends_with("Total Sent Count: 2, Total Received Count: 1"));
    }

    #[test]
    fn test_rate_must_be_positive() {
        assert!(ClientArgs::try_parse_from(["scaling-client", "localhost", "5000", "0"]).is_err());
        let args = ClientArgs::try_parse_from(["scaling-client", "localhost", "5000", "4"]).unwrap();
        assert_eq!(args.rate, 4);
        assert_eq!(args.count, None);
    }
}
