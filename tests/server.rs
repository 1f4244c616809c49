//! End-to-end tests against a real server on an ephemeral loopback port.

use scaling_server::client::{self, ClientArgs};
use scaling_server::digest::{digest_hex, DIGEST_LEN, PAYLOAD_SIZE};
use scaling_server::runtime::StatisticsRegistry;
use scaling_server::{Config, Server, ShutdownHandle};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct TestServer {
    addr: SocketAddr,
    stats: Arc<StatisticsRegistry>,
    shutdown: ShutdownHandle,
    handle: Option<JoinHandle<io::Result<()>>>,
}

impl TestServer {
    fn start(workers: usize, batch_size: usize, batch_time_secs: u64) -> Self {
        let config = Config::try_from_args([
            "scaling-server".to_string(),
            "0".to_string(),
            workers.to_string(),
            batch_size.to_string(),
            batch_time_secs.to_string(),
            "--host".to_string(),
            "127.0.0.1".to_string(),
            "--stats-interval".to_string(),
            "3600".to_string(),
        ])
        .unwrap();

        let server = Server::bind(&config).unwrap();
        let addr = server.local_addr().unwrap();
        let stats = server.stats();
        let shutdown = server.shutdown_handle();
        let handle = thread::spawn(move || server.run());

        Self {
            addr,
            stats,
            shutdown,
            handle: Some(handle),
        }
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        stream
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.shutdown();
        if let Some(handle) = self.handle.take() {
            handle.join().unwrap().unwrap();
        }
    }
}

fn wait_until(mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

fn payload(seed: u64) -> Vec<u8> {
    // Cheap deterministic bytes that differ per seed.
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..PAYLOAD_SIZE)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

fn read_digest(stream: &mut TcpStream) -> String {
    let mut reply = [0u8; DIGEST_LEN];
    stream.read_exact(&mut reply).unwrap();
    String::from_utf8(reply.to_vec()).unwrap()
}

#[test]
fn replies_with_digest_of_each_payload() {
    let server = TestServer::start(2, 1, 3600);
    let mut stream = server.connect();

    for seed in 0..3 {
        let sent = payload(seed);
        stream.write_all(&sent).unwrap();
        assert_eq!(read_digest(&mut stream), digest_hex(&sent));
    }

    assert!(wait_until(|| server.stats.total() == 3));
    let snapshot = server.stats.report(Duration::from_secs(1));
    assert_eq!(snapshot.active, 1);
    assert_eq!(snapshot.total_throughput, 3.0);
    assert_eq!(server.stats.total(), 0);
}

#[test]
fn holds_replies_until_batch_is_full() {
    let server = TestServer::start(2, 4, 3600);
    let mut stream = server.connect();
    let sent: Vec<Vec<u8>> = (10..14).map(payload).collect();

    for p in &sent[..3] {
        stream.write_all(p).unwrap();
    }

    stream
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    let mut probe = [0u8; 1];
    let early = stream.read(&mut probe);
    assert!(matches!(
        early,
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut
    ));

    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream.write_all(&sent[3]).unwrap();
    for p in &sent {
        assert_eq!(read_digest(&mut stream), digest_hex(p));
    }
}

#[test]
fn flushes_underfilled_batch_once_window_has_expired() {
    let server = TestServer::start(2, 1000, 1);
    let mut stream = server.connect();
    let sent: Vec<Vec<u8>> = (20..23).map(payload).collect();

    // Far below the count threshold: each flush comes from a unit that
    // arrives after the one-second window has run out.
    for (i, p) in sent.iter().enumerate() {
        if i > 0 {
            thread::sleep(Duration::from_millis(1100));
        }
        stream.write_all(p).unwrap();
    }

    for p in &sent {
        assert_eq!(read_digest(&mut stream), digest_hex(p));
    }
}

#[test]
fn partial_payload_then_close_drops_connection() {
    let server = TestServer::start(2, 1, 3600);

    let mut quitter = server.connect();
    assert!(wait_until(|| server.stats.active() == 1));
    quitter.write_all(&payload(30)[..3000]).unwrap();
    drop(quitter);
    assert!(wait_until(|| server.stats.active() == 0));

    // The server keeps serving other clients.
    let mut stream = server.connect();
    let sent = payload(31);
    stream.write_all(&sent).unwrap();
    assert_eq!(read_digest(&mut stream), digest_hex(&sent));
}

#[test]
fn many_clients_each_get_exactly_their_digests() {
    const CLIENTS: u64 = 16;
    const MESSAGES: u64 = 25;

    // 16 * 25 is a multiple of the batch size, so every batch fills.
    let server = TestServer::start(8, 8, 3600);

    let clients: Vec<_> = (0..CLIENTS)
        .map(|c| {
            let mut stream = server.connect();
            thread::spawn(move || {
                let sent: Vec<Vec<u8>> = (0..MESSAGES).map(|m| payload(c * 1000 + m)).collect();
                for p in &sent {
                    stream.write_all(p).unwrap();
                }

                let mut expected: Vec<String> = sent.iter().map(|p| digest_hex(p)).collect();
                let mut received: Vec<String> =
                    (0..MESSAGES).map(|_| read_digest(&mut stream)).collect();
                expected.sort();
                received.sort();
                assert_eq!(received, expected);
                stream
            })
        })
        .collect();

    let streams: Vec<TcpStream> = clients.into_iter().map(|c| c.join().unwrap()).collect();
    assert!(wait_until(|| server.stats.active() == CLIENTS as usize));
    assert!(wait_until(|| server.stats.total() == CLIENTS * MESSAGES));
    drop(streams);
}

#[test]
fn bundled_client_verifies_every_reply() {
    let server = TestServer::start(2, 1, 3600);

    let args = ClientArgs {
        host: "127.0.0.1".to_string(),
        port: server.addr.port(),
        rate: 200,
        count: Some(10),
        stats_interval: 3600,
        log_level: "info".to_string(),
    };
    let stats = client::run(args).unwrap();

    assert_eq!(stats.received(), 10);
}
