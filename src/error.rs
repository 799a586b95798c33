use std::io;

use thiserror::Error;

/// Errors surfaced by the client.
///
/// Timeouts never show up here: an unanswered frame is resent by the
/// multiplexer until the connection drops. Checksum and sequence problems on
/// inbound traffic are logged and the offending packet discarded; they only
/// become an [`Error::Framing`] when a caller asked for the decode directly.
#[derive(Debug, Error)]
pub enum Error {
    /// TCP connect, read or write failure. The reconnect supervisor owns
    /// recovery for these.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The gateway refused the connection or sent a malformed greeting.
    #[error("gateway handshake failed: {0}")]
    Handshake(String),

    /// The gateway rejected the supplied credentials.
    #[error("gateway authentication failed")]
    Auth,

    /// A frame or packet failed to decode.
    #[error("framing error: {0}")]
    Framing(String),

    /// A device reported state that violates the protocol's checksum or
    /// setup mode contract. Fatal for the current device operation.
    #[error("protocol invariant violated: {0}")]
    Invariant(String),

    /// The connection went away while a request was outstanding.
    #[error("disconnected from PIM")]
    Disconnected,
}
