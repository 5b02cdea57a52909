//! TCP server for chat requests.
//!
//! Binds the listener, wires the injected responder into the event loop, and
//! runs the loop on the calling thread.

use crate::config::Config;
use crate::responder::Responder;
use crate::runtime::EventLoop;
use crate::shutdown::ShutdownHandle;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

/// Server instance
pub struct Server {
    event_loop: EventLoop,
}

impl Server {
    /// Bind to `config.host:config.port` and prepare the event loop.
    ///
    /// Nothing is accepted until `run` is called, but the socket is already
    /// listening, so `local_addr` is final.
    pub fn bind(config: &Config, responder: Arc<dyn Responder>) -> io::Result<Self> {
        Ok(Server {
            event_loop: EventLoop::new(config, responder)?,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.event_loop.local_addr()
    }

    /// Handle that stops `run` gracefully from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.event_loop.shutdown_handle()
    }

    /// Serve until shut down. Blocks the calling thread.
    pub fn run(self) -> io::Result<()> {
        self.event_loop.run()
    }
}
