//! Audio engines hosted by a worker.
//!
//! This module provides:
//! - The `Engine` capability trait (`Engine`)
//! - Parameter ranges and clamping (`params`)
//! - The pure-Rust software fallback (`fallback`)
//! - The shared-library native engine (`native`)
//! - Engine selection (`select_engine`)

pub mod fallback;
pub mod native;
pub mod params;

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use fallback::SoftwareEngine;
pub use native::NativeEngine;
pub use params::{ParamRange, Parameter, ParameterSet};

/// Errors raised while constructing an engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Native engine unavailable: {0}")]
    Unavailable(String),
}

/// Which engine variant is active inside a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Native,
    Fallback,
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// Engine selection policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnginePolicy {
    /// Try the native engine, fall back to software if it cannot be built.
    #[default]
    Auto,
    /// Native engine only; failure to construct is fatal.
    Native,
    /// Software engine only.
    Fallback,
}

impl EnginePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Native => "native",
            Self::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for EnginePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnginePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "native" => Ok(Self::Native),
            "fallback" | "software" => Ok(Self::Fallback),
            other => Err(format!("unknown engine policy '{}'", other)),
        }
    }
}

/// Capability surface shared by every engine variant.
///
/// Setters never fail: values are clamped into the parameter's range.
/// `process_block` returns a block of the same length as its input.
pub trait Engine: Send {
    fn kind(&self) -> EngineKind;

    fn is_initialized(&self) -> bool;

    /// Assign a numeric parameter. Returns the clamped value actually stored.
    fn set_parameter(&mut self, param: Parameter, value: f32) -> f32;

    fn set_mod_enabled(&mut self, enabled: bool);

    fn parameters(&self) -> ParameterSet;

    fn process_block(&mut self, block: &[f32]) -> Vec<f32>;
}

/// Result of engine selection, tagged with the variant that won.
pub enum SelectedEngine {
    Native(NativeEngine),
    Fallback {
        engine: SoftwareEngine,
        /// Why the native engine was skipped, if it was attempted.
        reason: Option<String>,
    },
}

impl SelectedEngine {
    pub fn kind(&self) -> EngineKind {
        match self {
            Self::Native(_) => EngineKind::Native,
            Self::Fallback { .. } => EngineKind::Fallback,
        }
    }

    pub fn into_engine(self) -> Box<dyn Engine> {
        match self {
            Self::Native(engine) => Box::new(engine),
            Self::Fallback { engine, .. } => Box::new(engine),
        }
    }
}

impl std::fmt::Debug for SelectedEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Native(_) => f.write_str("Native"),
            Self::Fallback { reason, .. } => {
                f.debug_struct("Fallback").field("reason", reason).finish()
            }
        }
    }
}

/// Pick an engine according to `policy`.
///
/// Construction is synchronous and bounded. Under `Auto`, `EngineError::Unavailable`
/// from the native engine is recovered locally by building the software engine.
pub fn select_engine(
    policy: EnginePolicy,
    native_library: Option<&Path>,
) -> Result<SelectedEngine, EngineError> {
    match policy {
        EnginePolicy::Fallback => {
            log::info!("Engine policy is 'fallback'; using software engine");
            Ok(SelectedEngine::Fallback {
                engine: SoftwareEngine::new(),
                reason: None,
            })
        }
        EnginePolicy::Native => {
            let engine = load_native(native_library)?;
            log::info!("Native engine loaded");
            Ok(SelectedEngine::Native(engine))
        }
        EnginePolicy::Auto => match load_native(native_library) {
            Ok(engine) => {
                log::info!("Native engine loaded");
                Ok(SelectedEngine::Native(engine))
            }
            Err(EngineError::Unavailable(reason)) => {
                log::warn!("{}; falling back to software engine", reason);
                Ok(SelectedEngine::Fallback {
                    engine: SoftwareEngine::new(),
                    reason: Some(reason),
                })
            }
        },
    }
}

fn load_native(native_library: Option<&Path>) -> Result<NativeEngine, EngineError> {
    let path = native_library.ok_or_else(|| {
        EngineError::Unavailable("no native engine library configured".to_string())
    })?;
    NativeEngine::load(path)
}
