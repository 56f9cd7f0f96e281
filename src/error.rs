//! AMQP 0-9-1 Error Handling
//!
//! This module provides the error taxonomy for the protocol core. Errors fall
//! into six kinds:
//!
//! - **Codec**: bytes could not be decoded as valid AMQP (bad frame-end
//!   marker, truncated field, unknown type tag). Fatal to the connection.
//! - **Protocol**: valid encoding but invalid sequence (unexpected frame,
//!   wrong channel, body overflow, reply with nothing outstanding). Fatal.
//! - **Channel**: the server closed a channel with a non-zero reply code.
//!   Non-fatal to the connection.
//! - **Connection**: the server closed the connection, or an equivalent hard
//!   failure. Fatal.
//! - **Transport**: socket or TLS level failure reported by the host
//!   adapter. Fatal, handled like a connection error.
//! - **Usage**: the caller invoked an operation on a closed object or passed
//!   an invalid argument. Fails locally, nothing on the wire.
//!
//! # Examples
//!
//! ```rust
//! use warren_amqp::error::{Error, Result};
//!
//! fn check_name(name: &str) -> Result<()> {
//!     if name.len() > 255 {
//!         return Err(Error::usage("name exceeds 255 bytes"));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Errors surfaced by the protocol core and the transport adapter.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("channel error {code}: {text}")]
    Channel { code: u16, text: String },

    #[error("connection error {code}: {text}")]
    Connection { code: u16, text: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("usage error: {0}")]
    Usage(String),
}

/// Result type for AMQP operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a codec error.
    pub fn codec(msg: impl Into<String>) -> Self {
        Error::Codec(msg.into())
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a channel error from a server `channel.close`.
    pub fn channel(code: u16, text: impl Into<String>) -> Self {
        Error::Channel { code, text: text.into() }
    }

    /// Create a connection error from a server `connection.close` or an
    /// internal hard failure.
    pub fn connection(code: u16, text: impl Into<String>) -> Self {
        Error::Connection { code, text: text.into() }
    }

    /// Create a transport error.
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    /// Create a usage error.
    pub fn usage(msg: impl Into<String>) -> Self {
        Error::Usage(msg.into())
    }

    /// Whether this error tears down the whole connection.
    ///
    /// Channel and usage errors are local; everything else fails every
    /// channel and closes the connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Channel { .. } | Error::Usage(_))
    }

    /// The wire reply code, for errors that carry one.
    pub fn reply_code(&self) -> Option<u16> {
        match self {
            Error::Channel { code, .. } | Error::Connection { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The server-supplied reply text, for errors that carry one.
    pub fn reply_text(&self) -> Option<&str> {
        match self {
            Error::Channel { text, .. } | Error::Connection { text, .. } => Some(text),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

/// Reply codes the server may send in `connection.close` and
/// `channel.close`.
pub mod reply_code {
    pub const CONTENT_TOO_LARGE: u16 = 311;
    pub const NO_CONSUMERS: u16 = 313;
    pub const CONNECTION_FORCED: u16 = 320;
    pub const INVALID_PATH: u16 = 402;
    pub const ACCESS_REFUSED: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const RESOURCE_LOCKED: u16 = 405;
    pub const PRECONDITION_FAILED: u16 = 406;
    pub const FRAME_ERROR: u16 = 501;
    pub const SYNTAX_ERROR: u16 = 502;
    pub const COMMAND_INVALID: u16 = 503;
    pub const CHANNEL_ERROR: u16 = 504;
    pub const UNEXPECTED_FRAME: u16 = 505;
    pub const RESOURCE_ERROR: u16 = 506;
    pub const NOT_ALLOWED: u16 = 530;
    pub const NOT_IMPLEMENTED: u16 = 540;
    pub const INTERNAL_ERROR: u16 = 541;
}
