//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! One thread runs the loop. It owns the poll, the listener and every
//! connection, so none of them need locking. Readiness from mio is
//! edge-triggered: the read handler receives until would-block (each
//! successful receive is one request) and the write handler sends until the
//! outbound buffer is empty or the socket would block.
//!
//! ## Framing
//!
//! One read is one request. A request split over two reads is handled as
//! two requests, and two requests that arrive in one read are handled as
//! one. Clients are expected to send one request and wait for its reply.

use crate::config::Config;
use crate::responder::{self, Responder, ResponderError};
use crate::runtime::connection::{ConnectionTable, Recv};
use crate::runtime::listener::Listener;
use crate::runtime::pool::{Completion, Job, ResponderPool};
use crate::runtime::protocol::{self, Request};
use crate::runtime::token::{ConnToken, LISTENER_TOKEN, WAKER_TOKEN};
use crate::shutdown::ShutdownHandle;
use crossbeam_channel::Receiver;
use mio::event::Event;
use mio::{Events, Poll, Token, Waker};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Longest the poll sleeps while an idle timeout is armed.
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Where responder calls run.
enum Dispatch {
    /// On the loop thread.
    Inline(Arc<dyn Responder>),
    /// On worker threads, results delivered through the waker.
    Pool(ResponderPool),
}

/// Readiness copied out of `Events` so handlers can borrow the loop mutably.
#[derive(Debug, Clone, Copy)]
struct Ready {
    token: Token,
    readable: bool,
    writable: bool,
}

impl From<&Event> for Ready {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable() || event.is_write_closed(),
        }
    }
}

pub struct EventLoop {
    poll: Poll,
    events: Events,
    ready: Vec<Ready>,
    listener: Listener,
    listening: bool,
    connections: ConnectionTable,
    dispatch: Dispatch,
    completions: Receiver<Completion>,
    shutdown: ShutdownHandle,
    idle_timeout: Option<Duration>,
    shutdown_grace: Duration,
}

impl EventLoop {
    /// Bind the listener and set up the poll, waker and responder dispatch.
    pub fn new(config: &Config, responder: Arc<dyn Responder>) -> io::Result<Self> {
        let addr = resolve(&config.host, config.port)?;

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let mut listener = Listener::bind(addr, config.backlog)?;
        listener.register(poll.registry())?;

        let (completions_tx, completions) = crossbeam_channel::unbounded();
        let dispatch = if config.responder_workers == 0 {
            Dispatch::Inline(responder)
        } else {
            Dispatch::Pool(ResponderPool::spawn(
                config.responder_workers,
                responder,
                completions_tx,
                Arc::clone(&waker),
            )?)
        };

        let connections = ConnectionTable::new(
            config.max_connections,
            config.read_buffer_size,
            config.max_outbound_bytes,
        );

        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity),
            ready: Vec::with_capacity(config.events_capacity),
            listener,
            listening: true,
            connections,
            dispatch,
            completions,
            shutdown: ShutdownHandle::new(waker),
            idle_timeout: (config.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(config.idle_timeout_secs)),
            shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Run until shutdown is requested or the poll fails.
    ///
    /// Returns `Ok(())` after a graceful shutdown and the poll error
    /// otherwise. Every open connection is closed either way.
    pub fn run(mut self) -> io::Result<()> {
        info!(
            addr = %self.listener.local_addr(),
            workers = match &self.dispatch {
                Dispatch::Inline(_) => 0,
                Dispatch::Pool(pool) => pool.workers(),
            },
            max_connections = self.connections.capacity(),
            "Event loop started"
        );

        let mut drain_deadline: Option<Instant> = None;

        let result = loop {
            let timeout = self.poll_timeout(drain_deadline);
            if let Err(e) = self.poll.poll(&mut self.events, timeout) {
                if e.kind() != io::ErrorKind::Interrupted {
                    error!(error = %e, "Poll failed");
                    break Err(e);
                }
                // A signal landed; fall through to the shutdown check.
                self.events.clear();
            }

            self.dispatch_events();

            if let Some(timeout) = self.idle_timeout {
                self.close_idle(timeout);
            }

            if drain_deadline.is_none() && self.shutdown.is_requested() {
                self.stop_accepting();
                drain_deadline = Some(Instant::now() + self.shutdown_grace);
            }

            if let Some(deadline) = drain_deadline {
                if self.connections.is_quiescent() {
                    info!("All in-flight requests finished");
                    break Ok(());
                }
                if Instant::now() >= deadline {
                    warn!(
                        connections = self.connections.len(),
                        "Shutdown grace period elapsed"
                    );
                    break Ok(());
                }
            }
        };

        let closed = self.connections.close_all(self.poll.registry());
        if let Dispatch::Pool(pool) = &mut self.dispatch {
            let discarded = pool.stop(drain_deadline.unwrap_or_else(Instant::now));
            if discarded > 0 {
                debug!(discarded, "Dropped requests queued for closed connections");
            }
        }
        info!(closed, "Event loop stopped");
        result
    }

    fn poll_timeout(&self, drain_deadline: Option<Instant>) -> Option<Duration> {
        let idle = self.idle_timeout.map(|t| t.min(IDLE_SWEEP_INTERVAL));
        let drain = drain_deadline.map(|d| d.saturating_duration_since(Instant::now()));
        match (idle, drain) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn dispatch_events(&mut self) {
        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        ready.extend(self.events.iter().map(Ready::from));

        for r in &ready {
            match r.token {
                LISTENER_TOKEN => {
                    if self.listening {
                        self.listener
                            .accept_ready(self.poll.registry(), &mut self.connections);
                    }
                }
                WAKER_TOKEN => self.drain_completions(),
                Token(slot) => {
                    if let Err(e) = self.handle_connection_event(slot, *r) {
                        debug!(conn_id = slot, error = %e, "Connection error");
                        self.connections.close(self.poll.registry(), slot);
                    }
                }
            }
        }

        self.ready = ready;
    }

    fn handle_connection_event(&mut self, slot: usize, ready: Ready) -> io::Result<()> {
        if !self.connections.contains(slot) {
            return Ok(());
        }

        if ready.readable {
            self.on_readable(slot)?;
        }

        // Re-check connection exists (may have been closed by the read)
        if !self.connections.contains(slot) {
            return Ok(());
        }

        if ready.writable {
            self.on_writable(slot)?;
        }

        self.connections.sync_interest(self.poll.registry(), slot)
    }

    /// Receive and dispatch requests until the socket would block.
    fn on_readable(&mut self, slot: usize) -> io::Result<()> {
        loop {
            let Some(conn) = self.connections.get_mut(slot) else {
                return Ok(());
            };

            // One request at a time; pick the rest up when the reply lands.
            if conn.is_in_flight() {
                conn.defer_read();
                return Ok(());
            }

            match conn.recv()? {
                Recv::WouldBlock => return Ok(()),
                Recv::Eof => {
                    debug!(conn_id = slot, peer = %conn.peer(), "Peer closed connection");
                    // Best effort for replies already queued.
                    if let Err(e) = conn.flush() {
                        trace!(conn_id = slot, error = %e, "Flush on close failed");
                    }
                    self.connections.close(self.poll.registry(), slot);
                    return Ok(());
                }
                Recv::Request => {
                    let token = conn.token();
                    let text = conn
                        .take_request()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    self.dispatch_request(token, &text)?;
                }
            }
        }
    }

    fn on_writable(&mut self, slot: usize) -> io::Result<()> {
        if let Some(conn) = self.connections.get_mut(slot) {
            conn.flush()?;
        }
        Ok(())
    }

    fn dispatch_request(&mut self, token: ConnToken, text: &str) -> io::Result<()> {
        let body = match protocol::parse(text) {
            Request::Chat(body) => body,
            Request::Unrecognized => {
                debug!(conn_id = token.slot, bytes = text.len(), "Dropping unrecognized request");
                return Ok(());
            }
        };

        let result = match &self.dispatch {
            Dispatch::Inline(responder) => responder::invoke(responder.as_ref(), body),
            Dispatch::Pool(pool) => {
                pool.submit(Job {
                    token,
                    request: body.to_string(),
                })?;
                if let Some(conn) = self.connections.get_by_token(token) {
                    conn.begin_request();
                }
                return Ok(());
            }
        };

        self.apply_reply(token, result)
    }

    /// Queue a responder result on its connection.
    ///
    /// Responder failures and backpressure overflows come back as errors so
    /// the caller closes the connection.
    fn apply_reply(
        &mut self,
        token: ConnToken,
        result: Result<String, ResponderError>,
    ) -> io::Result<()> {
        let Some(conn) = self.connections.get_by_token(token) else {
            trace!(conn_id = token.slot, "Reply for closed connection dropped");
            return Ok(());
        };

        let reply = result.map_err(|e| {
            warn!(conn_id = token.slot, peer = %conn.peer(), error = %e, "Responder failed");
            io::Error::new(io::ErrorKind::Other, e)
        })?;

        if reply.is_empty() {
            return Ok(());
        }

        conn.queue_reply(&reply).map_err(|e| {
            warn!(
                conn_id = token.slot,
                peer = %conn.peer(),
                error = %e,
                "Disconnecting slow consumer"
            );
            io::Error::from(e)
        })
    }

    /// Deliver every finished worker-pool request to its connection.
    fn drain_completions(&mut self) {
        while let Ok(completion) = self.completions.try_recv() {
            let token = completion.token;
            let deferred = match self.connections.get_by_token(token) {
                Some(conn) => conn.finish_request(),
                None => {
                    trace!(conn_id = token.slot, "Completion for closed connection dropped");
                    continue;
                }
            };

            if let Err(e) = self.complete(token, completion.result, deferred) {
                debug!(conn_id = token.slot, error = %e, "Connection error");
                self.connections.close(self.poll.registry(), token.slot);
            }
        }
    }

    fn complete(
        &mut self,
        token: ConnToken,
        result: Result<String, ResponderError>,
        deferred_read: bool,
    ) -> io::Result<()> {
        self.apply_reply(token, result)?;
        if deferred_read {
            self.on_readable(token.slot)?;
        }
        self.connections.sync_interest(self.poll.registry(), token.slot)
    }

    fn close_idle(&mut self, timeout: Duration) {
        for slot in self.connections.idle_slots(Instant::now(), timeout) {
            debug!(conn_id = slot, "Closing idle connection");
            self.connections.close(self.poll.registry(), slot);
        }
    }

    fn stop_accepting(&mut self) {
        info!(
            connections = self.connections.len(),
            grace_secs = self.shutdown_grace.as_secs(),
            "Shutdown requested, no longer accepting"
        );
        if let Err(e) = self.listener.deregister(self.poll.registry()) {
            warn!(error = %e, "Failed to deregister listener");
        }
        self.listening = false;
    }
}

/// Resolve `host:port`, taking the first address.
pub fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address for {}:{}", host, port),
        )
    })
}
