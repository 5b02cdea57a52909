//! crystal: a single-threaded chat request server
//!
//! Clients send `CHAT-REQUEST:<text>` over plain TCP and get back the raw
//! reply text produced by a pluggable `Responder`. One thread multiplexes
//! every connection with mio:
//! - Non-blocking accept, read and write with per-connection buffers
//! - Write interest registered only while output is queued
//! - Responder calls inline or on a worker pool
//! - Bounded output, optional idle timeout, connection limit
//! - Graceful shutdown on SIGINT/SIGTERM

pub mod config;
pub mod responder;
pub mod runtime;
pub mod server;
pub mod shutdown;

pub use config::Config;
pub use responder::{Responder, ResponderError};
pub use server::Server;
pub use shutdown::ShutdownHandle;
