//! Error types for fxvisor.

use std::time::Duration;

use thiserror::Error;

use crate::protocol::FailureKind;

/// fxvisor error type.
#[derive(Error, Debug)]
pub enum Error {
    /// No response arrived before the call's deadline
    #[error("Call to '{method}' timed out after {timeout:?}")]
    CallTimeout { method: String, timeout: Duration },

    /// The worker died while the call was pending
    #[error("Worker crashed while '{method}' was pending")]
    WorkerCrashed { method: String },

    /// Restart budget used up; the supervisor is terminated
    #[error("Worker restart limit reached after {attempts} attempts")]
    RestartExhausted { attempts: u32 },

    /// Supervisor shut down, or the worker exited on its own
    #[error("Supervisor is shutting down")]
    SupervisorShuttingDown,

    /// Method is not part of the engine surface
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    /// Worker reported a call-level failure
    #[error("Call to '{method}' failed ({kind}): {message}")]
    CallFailed {
        method: String,
        kind: FailureKind,
        message: String,
    },

    /// Initial worker launch or handshake failed
    #[error("Worker startup failed: {0}")]
    StartupFailed(String),

    /// Worker answered with a value of the wrong shape
    #[error("Unexpected {value} value returned by '{method}'")]
    UnexpectedValue { method: String, value: String },

    /// Arguments could not be framed, e.g. a buffer over the frame limit
    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors after which no further call on the same supervisor can succeed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::RestartExhausted { .. } | Error::SupervisorShuttingDown | Error::StartupFailed(_)
        )
    }
}

/// Result type alias for fxvisor operations.
pub type Result<T> = std::result::Result<T, Error>;
