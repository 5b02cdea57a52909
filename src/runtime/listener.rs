//! Listening socket.
//!
//! Bound with socket2 so the backlog is configurable, then handed to mio.
//! Registered for readability only; readiness means connections are pending.

use crate::runtime::connection::ConnectionTable;
use crate::runtime::token::LISTENER_TOKEN;
use mio::net::TcpListener;
use mio::{Interest, Registry};
use std::io;
use std::net::SocketAddr;
use tracing::{debug, error, warn};

pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind a non-blocking listener on `addr` with the given backlog.
    pub fn bind(addr: SocketAddr, backlog: i32) -> io::Result<Self> {
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

        let inner = TcpListener::from_std(socket.into());
        let local_addr = inner.local_addr()?;
        Ok(Self { inner, local_addr })
    }

    /// Address actually bound, with the real port if 0 was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.inner, LISTENER_TOKEN, Interest::READABLE)
    }

    pub fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.inner)
    }

    /// Accept every pending connection into `connections`.
    ///
    /// Readiness is edge-triggered, so this accepts until the backlog is
    /// empty. Accept failures are logged and end the batch; they never
    /// propagate. Returns the number of connections added.
    pub fn accept_ready(&self, registry: &Registry, connections: &mut ConnectionTable) -> usize {
        let mut accepted = 0;
        loop {
            match self.inner.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    match connections.insert(registry, stream, peer) {
                        Ok(Some(token)) => {
                            accepted += 1;
                            debug!(conn_id = token.slot, peer = %peer, "Accepted connection");
                        }
                        Ok(None) => {
                            warn!(
                                peer = %peer,
                                limit = connections.capacity(),
                                "Connection limit reached"
                            );
                        }
                        Err(e) => {
                            warn!(peer = %peer, error = %e, "Failed to register connection");
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_resource_exhaustion(&e) => {
                    warn!(error = %e, "Accept failed: resource exhaustion");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
        accepted
    }
}

/// Out of descriptors or kernel memory. Transient; the loop keeps running.
fn is_resource_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}
