//! Typed façade over a supervisor, one method per engine operation.

use std::sync::Arc;

use crate::config::SupervisorConfig;
use crate::engine::{EngineKind, ParameterSet};
use crate::error::{Error, Result};
use crate::protocol::{Method, Value};
use crate::supervisor::{Supervisor, WorkerLauncher};

/// Audio processor whose engine runs in a supervised worker.
///
/// Every method returns either the engine's answer or an `Error`; none of
/// them can crash the caller.
pub struct AudioProcessor {
    supervisor: Supervisor,
}

impl AudioProcessor {
    /// Start a processor backed by a worker process.
    pub async fn start(config: SupervisorConfig) -> Result<Self> {
        Ok(Self::new(Supervisor::start(config).await?))
    }

    /// Start a processor with a custom launcher.
    pub async fn with_launcher(
        config: SupervisorConfig,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Result<Self> {
        Ok(Self::new(Supervisor::with_launcher(config, launcher).await?))
    }

    pub fn new(supervisor: Supervisor) -> Self {
        Self { supervisor }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Engine variant of the current worker.
    pub fn engine_kind(&self) -> Option<EngineKind> {
        self.supervisor.engine_kind()
    }

    pub async fn is_initialized(&self) -> Result<bool> {
        let method = Method::IsInitialized;
        let value = self.call(method, Vec::new()).await?;
        value.as_bool().ok_or_else(|| unexpected(method, &value))
    }

    pub async fn set_volume(&self, volume: f32) -> Result<()> {
        self.set(Method::SetVolume, volume.into()).await
    }

    pub async fn set_mod_enabled(&self, enabled: bool) -> Result<()> {
        self.set(Method::SetModEnabled, enabled.into()).await
    }

    pub async fn set_mod_rate(&self, rate: f32) -> Result<()> {
        self.set(Method::SetModRate, rate.into()).await
    }

    pub async fn set_mod_depth(&self, depth: f32) -> Result<()> {
        self.set(Method::SetModDepth, depth.into()).await
    }

    /// Cutoff in Hz.
    pub async fn set_filter_cutoff(&self, hz: f32) -> Result<()> {
        self.set(Method::SetFilterCutoff, hz.into()).await
    }

    pub async fn set_filter_resonance(&self, resonance: f32) -> Result<()> {
        self.set(Method::SetFilterResonance, resonance.into()).await
    }

    /// Pitch bend in semitones.
    pub async fn set_pitch_bend(&self, semitones: f32) -> Result<()> {
        self.set(Method::SetPitchBend, semitones.into()).await
    }

    pub async fn set_control_position(&self, position: f32) -> Result<()> {
        self.set(Method::SetControlPosition, position.into()).await
    }

    /// Process one block of samples. The result has the same length.
    pub async fn process_audio(&self, block: impl Into<Vec<f32>>) -> Result<Vec<f32>> {
        let method = Method::ProcessAudio;
        match self.call(method, vec![Value::Buffer(block.into())]).await? {
            Value::Buffer(out) => Ok(out),
            other => Err(unexpected(method, &other)),
        }
    }

    /// Current (clamped) parameter values held by the engine.
    pub async fn parameters(&self) -> Result<ParameterSet> {
        let method = Method::GetParameters;
        match self.call(method, Vec::new()).await? {
            Value::Parameters(params) => Ok(params),
            other => Err(unexpected(method, &other)),
        }
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.supervisor.shutdown().await
    }

    async fn call(&self, method: Method, args: Vec<Value>) -> Result<Value> {
        self.supervisor.call(method.as_str(), args).await
    }

    async fn set(&self, method: Method, value: Value) -> Result<()> {
        match self.call(method, vec![value]).await? {
            Value::Null => Ok(()),
            other => Err(unexpected(method, &other)),
        }
    }
}

fn unexpected(method: Method, value: &Value) -> Error {
    Error::UnexpectedValue {
        method: method.to_string(),
        value: value.type_name().to_string(),
    }
}
