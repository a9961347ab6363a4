//! Worker: owns exactly one engine and serves commands against it.
//!
//! Commands are processed one at a time in arrival order. Failures inside a
//! single command (bad arguments, unknown method, a panic in the engine) are
//! turned into `Failure` outcomes. Channel failures end the worker.

pub mod stdio;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use crate::engine::{select_engine, Engine, EngineError, EngineKind, EnginePolicy, Parameter};
use crate::protocol::{
    FailureKind, Method, Outcome, ProtocolError, SupervisorMessage, Value, WorkerMessage,
};

pub use stdio::{run_stdio, FramedChannel};

/// Clean shutdown, or the supervisor closed the channel.
pub const EXIT_OK: i32 = 0;
/// The channel to the supervisor failed.
pub const EXIT_CHANNEL_ERROR: i32 = 1;
/// Neither the native nor the fallback engine could be constructed.
pub const EXIT_NO_ENGINE: i32 = 2;
/// The worker panicked outside command dispatch.
pub const EXIT_PANIC: i32 = 101;

/// Bidirectional message channel between a worker and its supervisor.
pub trait WorkerChannel {
    /// Next inbound message. `Ok(None)` means the supervisor side closed.
    fn recv(&mut self) -> Result<Option<SupervisorMessage>, ProtocolError>;

    fn send(&mut self, msg: WorkerMessage) -> Result<(), ProtocolError>;
}

/// Construct an engine per `policy` and serve `channel` until shutdown.
///
/// Returns the process exit code.
pub fn run<C: WorkerChannel>(
    policy: EnginePolicy,
    native_library: Option<&Path>,
    channel: &mut C,
) -> i32 {
    match Worker::start(policy, native_library) {
        Ok(worker) => worker.serve(channel),
        Err(e) => {
            log::error!("No engine could be constructed: {}", e);
            EXIT_NO_ENGINE
        }
    }
}

/// A single engine plus the command handling around it.
pub struct Worker {
    engine: Box<dyn Engine>,
    kind: EngineKind,
    created: bool,
}

impl Worker {
    pub fn new(engine: Box<dyn Engine>) -> Self {
        let kind = engine.kind();
        Self {
            engine,
            kind,
            created: false,
        }
    }

    /// Select an engine and wrap it.
    pub fn start(policy: EnginePolicy, native_library: Option<&Path>) -> Result<Self, EngineError> {
        let selected = select_engine(policy, native_library)?;
        log::info!("Worker using {} engine", selected.kind());
        Ok(Self::new(selected.into_engine()))
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    /// Announce readiness, then serve messages until shutdown or EOF.
    pub fn serve<C: WorkerChannel>(mut self, channel: &mut C) -> i32 {
        let ready = WorkerMessage::Ready {
            engine: self.kind,
            pid: std::process::id(),
        };
        if let Err(e) = channel.send(ready) {
            log::error!("Failed to signal readiness: {}", e);
            return EXIT_CHANNEL_ERROR;
        }
        log::info!("Worker ready ({} engine)", self.kind);

        loop {
            let msg = match channel.recv() {
                Ok(Some(msg)) => msg,
                Ok(None) => {
                    log::info!("Supervisor closed the channel; exiting");
                    return EXIT_OK;
                }
                Err(e) => {
                    log::error!("Fatal channel error: {}", e);
                    return EXIT_CHANNEL_ERROR;
                }
            };

            if msg == SupervisorMessage::Shutdown {
                log::info!("Shutdown requested");
                return EXIT_OK;
            }

            if let Some(reply) = self.handle(msg) {
                if let Err(e) = channel.send(reply) {
                    log::error!("Failed to send reply: {}", e);
                    return EXIT_CHANNEL_ERROR;
                }
            }
        }
    }

    /// Handle one inbound message, producing the reply if there is one.
    pub fn handle(&mut self, msg: SupervisorMessage) -> Option<WorkerMessage> {
        match msg {
            SupervisorMessage::Create => {
                self.created = true;
                let initialized = self.engine.is_initialized();
                log::info!("Engine created (initialized: {})", initialized);
                Some(WorkerMessage::Created {
                    success: true,
                    initialized,
                    engine: self.kind,
                })
            }
            SupervisorMessage::Invoke { id, method, args } => Some(WorkerMessage::Result {
                id,
                outcome: self.invoke(&method, args),
            }),
            SupervisorMessage::Ping { id } => Some(WorkerMessage::Pong { id }),
            SupervisorMessage::Shutdown => None,
        }
    }

    /// Run one method against the engine.
    pub fn invoke(&mut self, method: &str, args: Vec<Value>) -> Outcome {
        let Ok(parsed) = method.parse::<Method>() else {
            log::warn!("Rejecting unknown method '{}'", method);
            return Outcome::failure(
                FailureKind::UnknownMethod,
                format!("unknown method: {}", method),
            );
        };
        if !self.created {
            return Outcome::failure(FailureKind::NotCreated, "engine not created yet");
        }

        log::debug!("Calling {} with {} args", parsed, args.len());
        let engine = self.engine.as_mut();
        match panic::catch_unwind(AssertUnwindSafe(|| dispatch(engine, parsed, args))) {
            Ok(Ok(value)) => Outcome::Success { value },
            Ok(Err(failure)) => failure,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("Engine panicked during {}: {}", parsed, message);
                Outcome::failure(FailureKind::Engine, message)
            }
        }
    }
}

fn dispatch(engine: &mut dyn Engine, method: Method, args: Vec<Value>) -> Result<Value, Outcome> {
    if let Some(param) = setter_parameter(method) {
        let value = number_arg(method, &args)?;
        engine.set_parameter(param, value as f32);
        return Ok(Value::Null);
    }

    match method {
        Method::IsInitialized => Ok(Value::Bool(engine.is_initialized())),
        Method::SetModEnabled => {
            engine.set_mod_enabled(bool_arg(method, &args)?);
            Ok(Value::Null)
        }
        Method::ProcessAudio => {
            let block = buffer_arg(method, args)?;
            Ok(Value::Buffer(engine.process_block(&block)))
        }
        Method::GetParameters => Ok(Value::Parameters(engine.parameters())),
        other => Err(Outcome::failure(
            FailureKind::UnknownMethod,
            format!("no handler for {}", other),
        )),
    }
}

fn setter_parameter(method: Method) -> Option<Parameter> {
    match method {
        Method::SetVolume => Some(Parameter::Volume),
        Method::SetModRate => Some(Parameter::ModRate),
        Method::SetModDepth => Some(Parameter::ModDepth),
        Method::SetFilterCutoff => Some(Parameter::FilterCutoff),
        Method::SetFilterResonance => Some(Parameter::FilterResonance),
        Method::SetPitchBend => Some(Parameter::PitchBend),
        Method::SetControlPosition => Some(Parameter::ControlPosition),
        _ => None,
    }
}

fn invalid(message: String) -> Outcome {
    Outcome::failure(FailureKind::InvalidArguments, message)
}

fn number_arg(method: Method, args: &[Value]) -> Result<f64, Outcome> {
    match args.first() {
        Some(Value::Number(n)) => Ok(*n),
        Some(Value::Bool(b)) => Ok(if *b { 1.0 } else { 0.0 }),
        Some(other) => Err(invalid(format!(
            "{} expects a number, got {}",
            method,
            other.type_name()
        ))),
        None => Err(invalid(format!("{} expects one argument", method))),
    }
}

fn bool_arg(method: Method, args: &[Value]) -> Result<bool, Outcome> {
    match args.first() {
        Some(Value::Bool(b)) => Ok(*b),
        Some(Value::Number(n)) => Ok(*n != 0.0 && !n.is_nan()),
        Some(Value::Null) => Ok(false),
        Some(other) => Err(invalid(format!(
            "{} expects a bool, got {}",
            method,
            other.type_name()
        ))),
        None => Err(invalid(format!("{} expects one argument", method))),
    }
}

fn buffer_arg(method: Method, args: Vec<Value>) -> Result<Vec<f32>, Outcome> {
    match args.into_iter().next() {
        Some(Value::Buffer(block)) => Ok(block),
        Some(other) => Err(invalid(format!(
            "{} expects an audio buffer, got {}",
            method,
            other.type_name()
        ))),
        None => Err(invalid(format!("{} expects one argument", method))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "engine panicked".to_string()
    }
}
