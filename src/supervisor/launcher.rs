//! Seam between the supervisor and however a worker is actually run.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::error::Result;
use crate::protocol::{SupervisorMessage, WorkerMessage};

/// How a worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    /// Terminating signal on unix.
    pub signal: Option<i32>,
}

impl WorkerExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signal(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Exit whose status could not be determined.
    pub fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    /// Exit code 0. Anything else counts as a crash.
    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Something that happened on the worker side of a link.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Message(WorkerMessage),
    /// Always the last event of a link.
    Exited(WorkerExit),
}

/// Out-of-band control over a running worker.
pub trait WorkerControl: Send + Sync {
    /// OS process id, when the worker is a separate process.
    fn pid(&self) -> Option<u32>;

    /// Stop the worker immediately.
    fn kill(&self);

    /// Wait up to `grace` for the worker to exit on its own, then force it.
    ///
    /// Blocks the calling thread.
    fn terminate(&self, grace: Duration);
}

/// A freshly launched worker.
pub struct WorkerLink {
    pub commands: UnboundedSender<SupervisorMessage>,
    pub events: UnboundedReceiver<WorkerEvent>,
    pub control: Arc<dyn WorkerControl>,
}

/// Starts workers on behalf of a supervisor.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self) -> Result<WorkerLink>;
}
