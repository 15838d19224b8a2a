//! Error types used across the crate.

use std::io;

/// The error type for connection handling, codecs and transports.
///
/// The parser and the frame codec surface typed failures; the connection
/// supervisor translates them into wire responses. Failures inside user
/// callbacks are isolated per connection and never tear down the server.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed HTTP was received. Answered with `400 Bad Request`
    /// carrying the message as body, then the connection is closed.
    #[error("{0}")]
    BadRequest(String),

    /// An RFC 6455 violation on a WebSocket stream. The socket is closed
    /// without a close frame.
    #[error("{0}")]
    Format(String),

    /// A SockJS send transport was invoked with an empty body.
    #[error("Payload expected.")]
    PayloadRequired,

    /// A SockJS send transport carried a body that does not decode as a
    /// JSON array of strings.
    #[error("Broken JSON encoding.")]
    BrokenJson,

    /// No bytes arrived on the connection within the configured idle
    /// deadline.
    #[error("connection idle past its deadline")]
    IdleTimeout,

    /// The underlying transport failed.
    #[error("i/o failure on the connection")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn bad_request(msg: impl Into<String>) -> Error {
        Error::BadRequest(msg.into())
    }

    pub(crate) fn format(msg: impl Into<String>) -> Error {
        Error::Format(msg.into())
    }
}
