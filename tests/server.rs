//! End-to-end tests against a live server on an ephemeral loopback port.
//!
//! Clients are plain blocking std sockets. Silence is asserted with a short
//! read timeout; closure is asserted by reading end-of-stream.

use crossbeam_channel::{Receiver, Sender};
use crystal::{Config, Responder, ResponderError, Server, ShutdownHandle};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Responder driven by the request text.
struct Stub {
    gate: Option<Receiver<()>>,
}

impl Stub {
    fn new() -> Arc<dyn Responder> {
        Arc::new(Stub { gate: None })
    }

    fn gated() -> (Arc<dyn Responder>, Sender<()>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Arc::new(Stub { gate: Some(rx) }), tx)
    }
}

impl Responder for Stub {
    fn handle(&self, request: &str) -> Result<String, ResponderError> {
        match request {
            "ping" => Ok("pong".to_string()),
            "empty" => Ok(String::new()),
            "fail" => Err(ResponderError::Failed("stub failure".to_string())),
            "boom" => panic!("stub panic"),
            "slow" => {
                thread::sleep(Duration::from_secs(3));
                Ok("done".to_string())
            }
            "wait" => {
                let gate = self.gate.as_ref().expect("gated stub");
                gate.recv_timeout(Duration::from_secs(10))
                    .map_err(|_| ResponderError::Failed("gate timeout".to_string()))?;
                Ok("released".to_string())
            }
            other => match other.strip_prefix("big:") {
                Some(n) => Ok("x".repeat(n.parse().unwrap())),
                None => Ok(format!("echo:{}", other)),
            },
        }
    }
}

struct TestServer {
    addr: SocketAddr,
    handle: ShutdownHandle,
    thread: Option<JoinHandle<io::Result<()>>>,
}

impl TestServer {
    fn start(tweak: impl FnOnce(&mut Config), responder: Arc<dyn Responder>) -> Self {
        let mut config = Config {
            port: 0,
            ..Config::default()
        };
        tweak(&mut config);

        let server = Server::bind(&config, responder).unwrap();
        let addr = server.local_addr();
        let handle = server.shutdown_handle();
        let thread = thread::spawn(move || server.run());

        Self {
            addr,
            handle,
            thread: Some(thread),
        }
    }

    fn inline() -> Self {
        Self::start(|_| {}, Stub::new())
    }

    fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }

    fn stop(mut self) -> io::Result<()> {
        self.handle.shutdown();
        self.thread.take().unwrap().join().unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.handle.shutdown();
            let _ = thread.join();
        }
    }
}

/// Run `body` against an inline server and against a pooled one.
fn in_each_mode(tweak: impl Fn(&mut Config), body: impl Fn(&TestServer)) {
    for workers in [0, 2] {
        let server = TestServer::start(
            |config| {
                tweak(config);
                config.responder_workers = workers;
            },
            Stub::new(),
        );
        body(&server);
    }
}

fn send(stream: &mut TcpStream, request: &str) {
    stream.write_all(request.as_bytes()).unwrap();
}

fn read_reply(stream: &mut TcpStream, len: usize) -> String {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).unwrap();
    String::from_utf8(buf).unwrap()
}

fn request(stream: &mut TcpStream, request: &str, expected: &str) {
    send(stream, request);
    assert_eq!(read_reply(stream, expected.len()), expected);
}

/// No bytes arrive and the connection stays open.
fn assert_silent(stream: &mut TcpStream) {
    stream.set_read_timeout(Some(Duration::from_millis(300))).unwrap();
    let mut buf = [0u8; 64];
    match stream.read(&mut buf) {
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
        Ok(0) => panic!("connection closed"),
        Ok(n) => panic!("unexpected bytes: {:?}", &buf[..n]),
        Err(e) => panic!("unexpected error: {}", e),
    }
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
}

/// The server closed the connection.
fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
            ) => {}
        Ok(n) => panic!("unexpected bytes: {:?}", &buf[..n]),
        Err(e) => panic!("connection not closed: {}", e),
    }
}

#[test]
fn test_chat_request_gets_exact_reply() {
    in_each_mode(|_| {}, |server| {
        let mut a = server.connect();

        request(&mut a, "CHAT-REQUEST:ping", "pong");
        // Exactly "pong" and nothing more.
        assert_silent(&mut a);
    });
}

#[test]
fn test_unprefixed_request_is_silent() {
    in_each_mode(|_| {}, |server| {
        // Unprefixed text gets no reply at all, not an error reply. This pins
        // the current behavior while the no-match policy stays undecided.
        let mut a = server.connect();

        send(&mut a, "ping");
        assert_silent(&mut a);

        // The connection is still usable.
        request(&mut a, "CHAT-REQUEST:ping", "pong");
    });
}

#[test]
fn test_empty_reply_sends_nothing() {
    in_each_mode(|_| {}, |server| {
        let mut a = server.connect();

        send(&mut a, "CHAT-REQUEST:empty");
        assert_silent(&mut a);
        request(&mut a, "CHAT-REQUEST:again", "echo:again");
    });
}

#[test]
fn test_sequential_requests_on_one_connection() {
    in_each_mode(|_| {}, |server| {
        let mut a = server.connect();

        for word in ["one", "two", "three"] {
            request(&mut a, &format!("CHAT-REQUEST:{}", word), &format!("echo:{}", word));
        }
    });
}

#[test]
fn test_reply_goes_only_to_requester() {
    in_each_mode(|_| {}, |server| {
        let mut a = server.connect();
        let mut b = server.connect();

        request(&mut a, "CHAT-REQUEST:ping", "pong");
        assert_silent(&mut a);
        assert_silent(&mut b);

        // B was untouched and is still open.
        request(&mut b, "CHAT-REQUEST:ping", "pong");
    });
}

#[test]
fn test_peer_close_does_not_affect_others() {
    in_each_mode(|_| {}, |server| {
        let a = server.connect();
        let mut b = server.connect();

        request(&mut b, "CHAT-REQUEST:first", "echo:first");
        drop(a);
        thread::sleep(Duration::from_millis(100));
        request(&mut b, "CHAT-REQUEST:second", "echo:second");
    });
}

#[test]
fn test_invalid_utf8_closes_only_that_connection() {
    in_each_mode(|_| {}, |server| {
        let mut a = server.connect();
        let mut b = server.connect();

        a.write_all(&[0xff, 0xfe, 0xfd]).unwrap();
        assert_closed(&mut a);

        request(&mut b, "CHAT-REQUEST:ping", "pong");
    });
}

#[test]
fn test_responder_failures_are_isolated() {
    in_each_mode(|_| {}, |server| {
        let mut panicking = server.connect();
        let mut failing = server.connect();
        let mut healthy = server.connect();

        send(&mut panicking, "CHAT-REQUEST:boom");
        assert_closed(&mut panicking);

        send(&mut failing, "CHAT-REQUEST:fail");
        assert_closed(&mut failing);

        request(&mut healthy, "CHAT-REQUEST:ping", "pong");

        // New connections are still accepted.
        let mut fresh = server.connect();
        request(&mut fresh, "CHAT-REQUEST:ping", "pong");
    });
}

#[test]
fn test_accepts_while_writes_are_pending() {
    in_each_mode(|config| config.max_outbound_bytes = 64 * 1024 * 1024, |server| {
        const LEN: usize = 16 * 1024 * 1024;

        // A asks for more than the socket buffers hold and does not read yet,
        // leaving the server with a partially written reply.
        let mut a = server.connect();
        send(&mut a, &format!("CHAT-REQUEST:big:{}", LEN));
        thread::sleep(Duration::from_millis(200));

        for _ in 0..3 {
            let mut c = server.connect();
            request(&mut c, "CHAT-REQUEST:ping", "pong");
        }

        // Every byte arrives exactly once, in order.
        a.set_read_timeout(Some(Duration::from_secs(20))).unwrap();
        let mut buf = vec![0u8; LEN];
        a.read_exact(&mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == b'x'));
        assert_silent(&mut a);
    });
}

#[test]
fn test_slow_consumer_is_disconnected() {
    let server = TestServer::start(|config| config.max_outbound_bytes = 1024, Stub::new());
    let mut a = server.connect();
    let mut b = server.connect();

    send(&mut a, "CHAT-REQUEST:big:4096");
    assert_closed(&mut a);

    request(&mut b, "CHAT-REQUEST:big:16", "xxxxxxxxxxxxxxxx");
}

#[test]
fn test_idle_connections_are_closed() {
    let server = TestServer::start(|config| config.idle_timeout_secs = 1, Stub::new());
    let mut idle = server.connect();

    idle.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    assert_closed(&mut idle);

    let mut fresh = server.connect();
    request(&mut fresh, "CHAT-REQUEST:ping", "pong");
}

#[test]
fn test_connection_limit() {
    let server = TestServer::start(|config| config.max_connections = 1, Stub::new());
    let mut a = server.connect();
    request(&mut a, "CHAT-REQUEST:ping", "pong");

    let mut b = server.connect();
    assert_closed(&mut b);

    // The admitted connection keeps working.
    request(&mut a, "CHAT-REQUEST:ping", "pong");
}

#[test]
fn test_worker_pool_does_not_stall_loop() {
    let (responder, gate) = Stub::gated();
    let server = TestServer::start(|config| config.responder_workers = 2, responder);
    let mut a = server.connect();
    let mut b = server.connect();

    send(&mut a, "CHAT-REQUEST:wait");
    thread::sleep(Duration::from_millis(100));

    // A's request is parked on the gate; B is served regardless.
    request(&mut b, "CHAT-REQUEST:ping", "pong");
    assert_silent(&mut a);

    gate.send(()).unwrap();
    assert_eq!(read_reply(&mut a, "released".len()), "released");
    request(&mut a, "CHAT-REQUEST:ping", "pong");
}

#[test]
fn test_reply_for_departed_client_is_not_misrouted() {
    let (responder, gate) = Stub::gated();
    let server = TestServer::start(|config| config.responder_workers = 1, responder);

    let mut a = server.connect();
    send(&mut a, "CHAT-REQUEST:wait");
    thread::sleep(Duration::from_millis(100));
    drop(a);
    thread::sleep(Duration::from_millis(100));

    // A's reply is produced after A left and must not reach B.
    let mut b = server.connect();
    gate.send(()).unwrap();
    assert_silent(&mut b);
    request(&mut b, "CHAT-REQUEST:ping", "pong");
}

#[test]
fn test_graceful_shutdown() {
    let server = TestServer::inline();
    let mut a = server.connect();
    request(&mut a, "CHAT-REQUEST:ping", "pong");

    let addr = server.addr;
    server.stop().unwrap();

    assert_closed(&mut a);
    assert!(TcpStream::connect(addr).is_err());
}

#[test]
fn test_pooled_shutdown_respects_grace_period() {
    let server = TestServer::start(
        |config| {
            config.responder_workers = 1;
            config.shutdown_grace_secs = 1;
        },
        Stub::new(),
    );

    // One slow request runs and two queue behind it.
    let mut clients: Vec<_> = (0..3).map(|_| server.connect()).collect();
    for client in &mut clients {
        send(client, "CHAT-REQUEST:slow");
    }
    thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    server.stop().unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(2500), "shutdown took {:?}", elapsed);

    for client in &mut clients {
        assert_closed(client);
    }
}
