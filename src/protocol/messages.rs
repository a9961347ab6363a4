//! Messages exchanged between supervisor and worker.

use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::engine::{EngineKind, ParameterSet};

/// Methods a worker's engine exposes. Closed set; anything else is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    IsInitialized,
    SetVolume,
    SetModEnabled,
    SetModRate,
    SetModDepth,
    SetFilterCutoff,
    SetFilterResonance,
    SetPitchBend,
    SetControlPosition,
    ProcessAudio,
    GetParameters,
}

impl Method {
    pub const ALL: [Method; 11] = [
        Method::IsInitialized,
        Method::SetVolume,
        Method::SetModEnabled,
        Method::SetModRate,
        Method::SetModDepth,
        Method::SetFilterCutoff,
        Method::SetFilterResonance,
        Method::SetPitchBend,
        Method::SetControlPosition,
        Method::ProcessAudio,
        Method::GetParameters,
    ];

    /// Wire name of the method.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IsInitialized => "isInitialized",
            Self::SetVolume => "setVolume",
            Self::SetModEnabled => "setModEnabled",
            Self::SetModRate => "setModRate",
            Self::SetModDepth => "setModDepth",
            Self::SetFilterCutoff => "setFilterCutoff",
            Self::SetFilterResonance => "setFilterResonance",
            Self::SetPitchBend => "setPitchBend",
            Self::SetControlPosition => "setControlPosition",
            Self::ProcessAudio => "processAudio",
            Self::GetParameters => "getParameters",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or(())
    }
}

/// Location of a binary blob inside a frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobSpan {
    pub offset: usize,
    /// Number of f32 samples.
    pub len: usize,
}

/// Argument or return value carried by a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Bool(bool),
    /// JSON has no NaN; it travels as `null` and comes back as NaN.
    #[serde(deserialize_with = "number_or_nan")]
    Number(f64),
    Buffer(Vec<f32>),
    Parameters(ParameterSet),
    /// Wire-only stand-in for a `Buffer` moved into the frame payload.
    #[doc(hidden)]
    Blob(BlobSpan),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::Buffer(_) => "buffer",
            Self::Parameters(_) => "parameters",
            Self::Blob(_) => "blob",
        }
    }
}

fn number_or_nan<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Number(v as f64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Number(v)
    }
}

impl From<Vec<f32>> for Value {
    fn from(v: Vec<f32>) -> Self {
        Value::Buffer(v)
    }
}

/// Category of a call-level failure reported by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    UnknownMethod,
    InvalidArguments,
    NotCreated,
    Engine,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownMethod => write!(f, "unknown method"),
            Self::InvalidArguments => write!(f, "invalid arguments"),
            Self::NotCreated => write!(f, "engine not created"),
            Self::Engine => write!(f, "engine error"),
        }
    }
}

/// Outcome of one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success { value: Value },
    Failure { kind: FailureKind, message: String },
}

impl Outcome {
    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Outcome::Failure {
            kind,
            message: message.into(),
        }
    }
}

/// Supervisor → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorMessage {
    Create,
    Invoke {
        id: u64,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    Ping {
        id: u64,
    },
    Shutdown,
}

/// Worker → supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Ready {
        engine: EngineKind,
        pid: u32,
    },
    Created {
        success: bool,
        initialized: bool,
        engine: EngineKind,
    },
    Result {
        id: u64,
        outcome: Outcome,
    },
    Pong {
        id: u64,
    },
}

/// Messages whose values may carry audio buffers.
pub trait FrameValues {
    fn values_mut(&mut self) -> Vec<&mut Value>;
}

impl FrameValues for SupervisorMessage {
    fn values_mut(&mut self) -> Vec<&mut Value> {
        match self {
            Self::Invoke { args, .. } => args.iter_mut().collect(),
            _ => Vec::new(),
        }
    }
}

impl FrameValues for WorkerMessage {
    fn values_mut(&mut self) -> Vec<&mut Value> {
        match self {
            Self::Result {
                outcome: Outcome::Success { value },
                ..
            } => vec![value],
            _ => Vec::new(),
        }
    }
}
