//! Graceful shutdown.
//!
//! A `ShutdownHandle` sets a flag the event loop checks after every poll and
//! wakes the poll so the flag is seen promptly. `on_signals` wires SIGINT and
//! SIGTERM to a handle from a dedicated thread.

use mio::Waker;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{info, warn};

/// Requests a graceful stop of one event loop. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub(crate) fn new(waker: Arc<Waker>) -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            waker,
        }
    }

    /// Ask the loop to stop accepting and finish in-flight work.
    pub fn shutdown(&self) {
        self.requested.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake event loop for shutdown");
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Trigger `handle` on the first SIGINT or SIGTERM.
pub fn on_signals(handle: ShutdownHandle) -> io::Result<thread::JoinHandle<()>> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!(signal, "Shutdown signal received");
                handle.shutdown();
            }
        })
}
