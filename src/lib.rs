//! Subprocess-isolated, durable execution core for interactive Python
//! sessions with native top-level `await` support.
//!
//! The crate is organized leaf-first, mirroring the component layering it
//! implements: [`message`] and [`transport`] define the wire,
//! [`correlator`] bridges requests to durable promises, [`engine`] hosts
//! the CPython-embedded execution engine and namespace manager (used
//! inside the worker binary), [`worker`] assembles those into the worker
//! process's event loop, and [`session`] is what an embedder actually
//! drives: one subprocess, one reader, one `execute()` API.

#![warn(missing_docs)]

pub mod config;
pub mod correlator;
pub mod engine;
pub mod message;
pub mod session;
pub mod transport;
pub mod worker;

use thiserror::Error;

/// A serializable projection of a library error, suitable for the wire
/// `error` message.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorResponse {
    /// Human-readable error message.
    pub message: String,
    /// The wire `Error.kind` this error maps to (spec §7).
    pub kind: message::ErrorKind,
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Library-wide error, aggregating each subsystem's own error type — one
/// variant per failure surface, following the same shape as the teacher's
/// own top-level `Error` enum.
#[derive(Debug, Error)]
pub enum Error {
    /// Frame transport failure (short read, oversize frame, peer
    /// disconnect).
    #[error(transparent)]
    Transport(#[from] transport::Error),

    /// Session lifecycle failure (spawn, startup timeout, not running).
    #[error(transparent)]
    Session(#[from] session::Error),

    /// Execution Engine failure (compilation, execution, cancellation,
    /// timeout).
    #[error(transparent)]
    Engine(#[from] engine::Error),

    /// A malformed frame, unknown required field, or state-machine
    /// violation.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl Error {
    /// Project this error onto the wire `Error.kind` enumeration (spec §7).
    pub fn as_wire_kind(&self) -> message::ErrorKind {
        match self {
            Error::Transport(_) => message::ErrorKind::WorkerCrash,
            Error::Session(err) => err.wire_kind(),
            Error::Engine(err) => err.wire_kind(),
            Error::Protocol(_) => message::ErrorKind::Protocol,
        }
    }

    /// Translate the error into an [`ErrorResponse`] carrying a wire-ready
    /// message and kind.
    pub fn as_response(&self) -> ErrorResponse {
        ErrorResponse {
            message: self.to_string(),
            kind: self.as_wire_kind(),
        }
    }
}

impl From<Error> for ErrorResponse {
    fn from(error: Error) -> Self {
        error.as_response()
    }
}
