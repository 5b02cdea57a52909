//! Request grammar for the chat protocol.
//!
//! There is no framing: one successful read is one request. A request is
//! recognized only when it starts with the literal `CHAT-REQUEST:` prefix;
//! everything after the prefix is handed to the responder verbatim.
//!
//! ```text
//! Request:  CHAT-REQUEST:hello there
//! Response: <responder reply bytes, no terminator>
//!
//! Request:  anything else
//! Response: (nothing)
//! ```

/// Prefix that marks a chat request.
pub const CHAT_PREFIX: &str = "CHAT-REQUEST:";

/// Parsed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    /// Chat request carrying the text after the prefix.
    Chat(&'a str),
    /// Text without the recognized prefix. Produces no reply.
    Unrecognized,
}

/// Parse one decoded request.
pub fn parse(text: &str) -> Request<'_> {
    match text.strip_prefix(CHAT_PREFIX) {
        Some(body) => Request::Chat(body),
        None => Request::Unrecognized,
    }
}
