//! fxvisor - process-isolated audio engine proxy.
//!
//! A `Supervisor` runs the engine in a crash-isolated worker and exposes it
//! through an async call API; `AudioProcessor` is the typed façade on top.

mod defaults;
pub mod error;

pub mod config;
pub mod engine;
pub mod protocol;
pub mod proxy;
pub mod supervisor;
pub mod worker;

pub use error::{Error, Result};

pub use config::{RestartPolicy, SupervisorConfig};
pub use engine::{
    select_engine, Engine, EngineError, EngineKind, EnginePolicy, NativeEngine, Parameter,
    ParameterSet, SelectedEngine, SoftwareEngine,
};
pub use protocol::{
    FailureKind, Method, Outcome, ProtocolError, SupervisorMessage, Value, WorkerMessage,
};
pub use proxy::AudioProcessor;
pub use supervisor::{
    InProcessLauncher, ProcessHandle, ProcessLauncher, ProcessState, Supervisor, WorkerControl,
    WorkerEvent, WorkerExit, WorkerLauncher, WorkerLink,
};
pub use worker::{Worker, WorkerChannel};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
