//! Poll tokens and connection identities.
//!
//! Connections are registered with mio under their slab key. Slab keys are
//! reused after a connection closes, so anything that outlives a single
//! event dispatch (a request handed to the worker pool) carries a
//! `ConnToken` that pairs the key with a per-connection serial number.

use mio::Token;

/// Token for the listening socket.
pub const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Token for the waker used by the worker pool and the shutdown handle.
pub const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Stable identity of one connection across slot reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnToken {
    /// Slab key, also the mio token value.
    pub slot: usize,
    /// Serial assigned at accept time, unique for the server's lifetime.
    pub serial: u64,
}

impl ConnToken {
    /// Poll token for this connection.
    pub fn poll_token(&self) -> Token {
        Token(self.slot)
    }
}

/// Hands out connection serials.
#[derive(Debug, Default)]
pub struct SerialAllocator {
    next: u64,
}

impl SerialAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next serial.
    pub fn alloc(&mut self) -> u64 {
        let serial = self.next;
        self.next = self.next.wrapping_add(1);
        serial
    }
}
