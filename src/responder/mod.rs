//! The responder capability.
//!
//! The server core knows nothing about how replies are produced. It holds an
//! `Arc<dyn Responder>` and calls `handle` with the text of each chat
//! request, either inline on the event loop thread or from the worker pool.
//!
//! `intents` provides the keyword-matching responder used by the binary.

pub mod intents;

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

pub use intents::{IntentModel, IntentResponder, ModelError};

/// Text in, text out.
///
/// Implementations must be cheap to call from the event loop thread when the
/// server runs without workers: every other connection waits while `handle`
/// runs.
pub trait Responder: Send + Sync {
    /// Produce the reply for one request.
    ///
    /// An empty reply sends nothing back.
    fn handle(&self, request: &str) -> Result<String, ResponderError>;
}

impl<F> Responder for F
where
    F: Fn(&str) -> Result<String, ResponderError> + Send + Sync,
{
    fn handle(&self, request: &str) -> Result<String, ResponderError> {
        self(request)
    }
}

/// Responder failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponderError {
    /// The request could not be answered.
    Failed(String),
    /// The responder panicked.
    Panicked(String),
}

impl fmt::Display for ResponderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponderError::Failed(reason) => write!(f, "responder failed: {}", reason),
            ResponderError::Panicked(msg) => write!(f, "responder panicked: {}", msg),
        }
    }
}

impl std::error::Error for ResponderError {}

/// Call the responder, turning a panic into `ResponderError::Panicked`.
///
/// A misbehaving responder closes one connection instead of unwinding
/// through the event loop.
pub fn invoke(responder: &dyn Responder, request: &str) -> Result<String, ResponderError> {
    match panic::catch_unwind(AssertUnwindSafe(|| responder.handle(request))) {
        Ok(result) => result,
        Err(payload) => Err(ResponderError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
