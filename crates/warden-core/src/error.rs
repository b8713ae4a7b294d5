//! Error types for warden-core.

use std::net::SocketAddr;

use thiserror::Error;

use crate::protocol::SessionId;

/// Main error type for warden operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls. Fatal to the session it
    /// occurred on, never to the server.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or oversized frame. The affected connection must be closed;
    /// binary framing has no recovery point.
    #[error("framing error: {message}")]
    Framing { message: String },

    /// Protocol violation above the framing layer (bad envelope, bad payload).
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Listener could not be started. Fatal to that `start` call only.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// A command targeted a session id that is not in the registry.
    #[error("unknown client: {0}")]
    UnknownClient(SessionId),

    /// `start` was called while the server was not stopped.
    #[error("server is already running")]
    AlreadyRunning,

    /// The connection was closed before the operation could complete.
    #[error("connection closed")]
    ConnectionClosed,
}

impl Error {
    /// Shorthand for a framing error.
    pub fn framing(message: impl Into<String>) -> Self {
        Error::Framing {
            message: message.into(),
        }
    }

    /// Shorthand for a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }

    /// Returns true if this error is fatal to the session it occurred on.
    ///
    /// Session-fatal errors close that connection; they never propagate to
    /// the accept loop or to sibling sessions.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Framing { .. } | Error::ConnectionClosed
        )
    }
}

/// Convenience result type for warden operations.
pub type Result<T> = std::result::Result<T, Error>;
