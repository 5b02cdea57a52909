//! Single-threaded readiness-based runtime.
//!
//! - `Listener`: non-blocking listening socket, accepts into the table
//! - `ConnectionTable` / `Connection`: per-socket state machine and buffers
//! - `EventLoop`: mio poll loop dispatching readiness to the above
//! - `ResponderPool`: optional worker threads for slow responders
//!
//! The loop owns its poll registry; nothing here is process-global.

mod buffer;
mod connection;
mod event_loop;
mod listener;
mod pool;
pub mod protocol;
pub(crate) mod token;

pub use buffer::{BufferFull, OutboundBuffer};
pub use connection::{ConnState, Connection, ConnectionTable, Recv};
pub use event_loop::{resolve, EventLoop};
pub use listener::Listener;
pub use pool::{Completion, Job, ResponderPool};
pub use token::ConnToken;
