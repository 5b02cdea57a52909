//! Connection state machine and the table of live connections.
//!
//! Each connection tracks its lifecycle state, the bytes of the request it
//! just read, the replies waiting to be sent, and the readiness interest it
//! is registered with. The table owns every connection and is the only place
//! that registers, reregisters or deregisters connection sockets, so the
//! interest a connection records is always the interest the poll holds.

use crate::runtime::buffer::{BufferFull, OutboundBuffer};
use crate::runtime::token::{ConnToken, SerialAllocator};
use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use slab::Slab;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::str::Utf8Error;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Normal operation.
    Open,
    /// Peer gone or fatal error observed, cleanup pending.
    Closing,
    /// Deregistered and socket released. Terminal.
    Closed,
}

/// Outcome of a single receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recv {
    /// Bytes landed in the inbound buffer and form one request.
    Request,
    /// Peer closed its write side.
    Eof,
    /// Nothing to read right now.
    WouldBlock,
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    token: ConnToken,
    peer: SocketAddr,
    state: ConnState,
    /// Bytes of the most recent read. Cleared once taken.
    inbound: BytesMut,
    read_size: usize,
    outbound: OutboundBuffer,
    /// Interest currently registered with the poll.
    registered: Interest,
    /// A request is with the worker pool.
    in_flight: bool,
    /// Read readiness arrived while a request was in flight.
    deferred_read: bool,
    last_active: Instant,
}

impl Connection {
    fn new(
        stream: TcpStream,
        token: ConnToken,
        peer: SocketAddr,
        read_size: usize,
        max_outbound: usize,
    ) -> Self {
        Self {
            stream,
            token,
            peer,
            state: ConnState::Open,
            inbound: BytesMut::with_capacity(read_size),
            read_size,
            outbound: OutboundBuffer::new(max_outbound),
            registered: Interest::READABLE,
            in_flight: false,
            deferred_read: false,
            last_active: Instant::now(),
        }
    }

    pub fn token(&self) -> ConnToken {
        self.token
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Interest currently registered with the poll.
    pub fn registered_interest(&self) -> Interest {
        self.registered
    }

    /// Interest this connection should be registered with.
    ///
    /// Always readable while open; writable only while output is queued.
    pub fn desired_interest(&self) -> Interest {
        if self.outbound.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    /// Perform one non-blocking receive of up to `read_size` bytes.
    pub fn recv(&mut self) -> io::Result<Recv> {
        self.inbound.clear();
        self.inbound.resize(self.read_size, 0);

        let result = loop {
            match self.stream.read(&mut self.inbound) {
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };

        match result {
            Ok(0) => {
                self.inbound.clear();
                self.mark_closing();
                Ok(Recv::Eof)
            }
            Ok(n) => {
                self.inbound.truncate(n);
                self.last_active = Instant::now();
                trace!(conn_id = self.token.slot, bytes = n, "Received request");
                Ok(Recv::Request)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.inbound.clear();
                Ok(Recv::WouldBlock)
            }
            Err(e) => {
                self.inbound.clear();
                self.mark_closing();
                Err(e)
            }
        }
    }

    /// Decode the inbound bytes as UTF-8 and clear the inbound buffer.
    pub fn take_request(&mut self) -> Result<String, Utf8Error> {
        let text = std::str::from_utf8(&self.inbound).map(str::to_owned);
        self.inbound.clear();
        text
    }

    /// Append reply text to the outbound buffer.
    pub fn queue_reply(&mut self, reply: &str) -> Result<(), BufferFull> {
        self.outbound.push(reply.as_bytes())
    }

    /// Send queued output until it is drained or the socket would block.
    pub fn flush(&mut self) -> io::Result<usize> {
        let n = self.outbound.drain_into(&mut self.stream)?;
        if n > 0 {
            self.last_active = Instant::now();
            trace!(conn_id = self.token.slot, bytes = n, pending = self.outbound.len(), "Sent");
        }
        Ok(n)
    }

    /// Bytes queued but not yet sent.
    pub fn pending_output(&self) -> usize {
        self.outbound.len()
    }

    /// Record that a request was handed to the worker pool.
    pub fn begin_request(&mut self) {
        self.in_flight = true;
    }

    /// Record that the in-flight request completed.
    ///
    /// Returns true if read readiness was deferred in the meantime.
    pub fn finish_request(&mut self) -> bool {
        self.in_flight = false;
        std::mem::take(&mut self.deferred_read)
    }

    /// Remember read readiness that arrived while a request was in flight.
    pub fn defer_read(&mut self) {
        self.deferred_read = true;
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Time since the last successful read or write.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active)
    }

    /// Transition Open to Closing. No effect in any other state.
    pub fn mark_closing(&mut self) {
        if self.state == ConnState::Open {
            self.state = ConnState::Closing;
        }
    }
}

/// Table of live connections keyed by slab slot.
///
/// Provides O(1) insert, lookup, and remove operations. Removing a
/// connection deregisters and closes its socket, once.
pub struct ConnectionTable {
    connections: Slab<Connection>,
    max_connections: usize,
    read_size: usize,
    max_outbound: usize,
    serials: SerialAllocator,
}

impl ConnectionTable {
    /// Create a new table.
    ///
    /// * `max_connections` - connections beyond this are refused
    /// * `read_size` - bytes per receive, and so the largest request
    /// * `max_outbound` - per-connection cap on queued output
    pub fn new(max_connections: usize, read_size: usize, max_outbound: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(4096)),
            max_connections,
            read_size,
            max_outbound,
            serials: SerialAllocator::new(),
        }
    }

    /// Insert a freshly accepted stream and register it for readability.
    ///
    /// Returns `Ok(None)` if the table is at capacity; the stream is dropped
    /// and so closed.
    pub fn insert(
        &mut self,
        registry: &Registry,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> io::Result<Option<ConnToken>> {
        if self.connections.len() >= self.max_connections {
            return Ok(None);
        }

        let entry = self.connections.vacant_entry();
        let token = ConnToken {
            slot: entry.key(),
            serial: self.serials.alloc(),
        };

        let mut conn = Connection::new(stream, token, peer, self.read_size, self.max_outbound);
        registry.register(&mut conn.stream, token.poll_token(), conn.registered)?;
        entry.insert(conn);

        Ok(Some(token))
    }

    #[cfg(test)]
    pub(crate) fn get(&self, slot: usize) -> Option<&Connection> {
        self.connections.get(slot)
    }

    /// Get a mutable reference to a connection.
    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Connection> {
        self.connections.get_mut(slot)
    }

    /// Look up a connection by token, rejecting a different connection that
    /// reused the same slot.
    pub fn get_by_token(&mut self, token: ConnToken) -> Option<&mut Connection> {
        self.connections
            .get_mut(token.slot)
            .filter(|conn| conn.token.serial == token.serial)
    }

    /// Check if a connection exists.
    pub fn contains(&self, slot: usize) -> bool {
        self.connections.contains(slot)
    }

    /// Bring the registered interest in line with the connection's buffers.
    pub fn sync_interest(&mut self, registry: &Registry, slot: usize) -> io::Result<()> {
        let Some(conn) = self.connections.get_mut(slot) else {
            return Ok(());
        };
        let desired = conn.desired_interest();
        if desired != conn.registered {
            registry.reregister(&mut conn.stream, Token(slot), desired)?;
            conn.registered = desired;
        }
        Ok(())
    }

    /// Deregister, close and remove a connection.
    ///
    /// A closed connection leaves the table, so it is handed back in the
    /// `Closed` state; its socket shuts when the caller drops it. Returns
    /// `None` if the slot was already empty, so closing twice is harmless.
    pub fn close(&mut self, registry: &Registry, slot: usize) -> Option<Connection> {
        let mut conn = self.connections.try_remove(slot)?;

        conn.mark_closing();
        if let Err(e) = registry.deregister(&mut conn.stream) {
            debug!(conn_id = slot, error = %e, "Deregister failed");
        }
        conn.state = ConnState::Closed;

        debug!(
            conn_id = slot,
            peer = %conn.peer,
            unsent = conn.pending_output(),
            "Connection closed"
        );
        Some(conn)
    }

    /// Close every connection. Returns how many were closed.
    pub fn close_all(&mut self, registry: &Registry) -> usize {
        let slots: Vec<usize> = self.connections.iter().map(|(slot, _)| slot).collect();
        slots
            .into_iter()
            .filter(|&slot| self.close(registry, slot).is_some())
            .count()
    }

    /// Slots of connections idle longer than `timeout` with nothing in flight.
    pub fn idle_slots(&self, now: Instant, timeout: Duration) -> Vec<usize> {
        self.connections
            .iter()
            .filter(|(_, conn)| !conn.in_flight && conn.idle_for(now) >= timeout)
            .map(|(slot, _)| slot)
            .collect()
    }

    /// True when no request is in flight and no output is queued.
    pub fn is_quiescent(&self) -> bool {
        self.connections
            .iter()
            .all(|(_, conn)| !conn.in_flight && conn.outbound.is_empty())
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}
