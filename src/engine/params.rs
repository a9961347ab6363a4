//! Tunable engine parameters and their declared ranges.
//!
//! Every numeric parameter is clamped into its range on assignment. Nothing
//! here rejects input.

use serde::{Deserialize, Serialize};

/// Inclusive range a numeric parameter is clamped into.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamRange {
    pub min: f32,
    pub max: f32,
}

impl ParamRange {
    pub const fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    /// Clamp a value into the range. NaN maps to `fallback`.
    pub fn clamp(&self, value: f32, fallback: f32) -> f32 {
        if value.is_nan() {
            return fallback;
        }
        value.clamp(self.min, self.max)
    }
}

/// Numeric parameters exposed by every engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum Parameter {
    Volume = 0,
    ModRate = 1,
    ModDepth = 2,
    FilterCutoff = 3,
    FilterResonance = 4,
    PitchBend = 5,
    ControlPosition = 6,
}

impl Parameter {
    pub const ALL: [Parameter; 7] = [
        Parameter::Volume,
        Parameter::ModRate,
        Parameter::ModDepth,
        Parameter::FilterCutoff,
        Parameter::FilterResonance,
        Parameter::PitchBend,
        Parameter::ControlPosition,
    ];

    pub fn range(self) -> ParamRange {
        match self {
            Self::Volume | Self::ModRate | Self::ModDepth | Self::ControlPosition => {
                ParamRange::new(0.0, 1.0)
            }
            Self::FilterCutoff => ParamRange::new(20.0, 20_000.0),
            Self::FilterResonance => ParamRange::new(0.0, 2.0),
            Self::PitchBend => ParamRange::new(-24.0, 24.0),
        }
    }

    pub fn default_value(self) -> f32 {
        match self {
            Self::Volume => 1.0,
            Self::ModRate => 0.5,
            Self::ModDepth => 0.3,
            Self::FilterCutoff => 1000.0,
            Self::FilterResonance => 1.0,
            Self::PitchBend => 0.0,
            Self::ControlPosition => 0.5,
        }
    }

    /// Stable numeric id used across the native ABI.
    pub fn id(self) -> u32 {
        self as u32
    }
}

impl std::fmt::Display for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Volume => "volume",
            Self::ModRate => "mod_rate",
            Self::ModDepth => "mod_depth",
            Self::FilterCutoff => "filter_cutoff",
            Self::FilterResonance => "filter_resonance",
            Self::PitchBend => "pitch_bend",
            Self::ControlPosition => "control_position",
        };
        f.write_str(name)
    }
}

/// Snapshot of every parameter an engine holds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub volume: f32,
    pub mod_enabled: bool,
    pub mod_rate: f32,
    pub mod_depth: f32,
    pub filter_cutoff: f32,
    pub filter_resonance: f32,
    pub pitch_bend: f32,
    pub control_position: f32,
}

impl Default for ParameterSet {
    fn default() -> Self {
        Self {
            volume: Parameter::Volume.default_value(),
            mod_enabled: false,
            mod_rate: Parameter::ModRate.default_value(),
            mod_depth: Parameter::ModDepth.default_value(),
            filter_cutoff: Parameter::FilterCutoff.default_value(),
            filter_resonance: Parameter::FilterResonance.default_value(),
            pitch_bend: Parameter::PitchBend.default_value(),
            control_position: Parameter::ControlPosition.default_value(),
        }
    }
}

impl ParameterSet {
    pub fn get(&self, param: Parameter) -> f32 {
        match param {
            Parameter::Volume => self.volume,
            Parameter::ModRate => self.mod_rate,
            Parameter::ModDepth => self.mod_depth,
            Parameter::FilterCutoff => self.filter_cutoff,
            Parameter::FilterResonance => self.filter_resonance,
            Parameter::PitchBend => self.pitch_bend,
            Parameter::ControlPosition => self.control_position,
        }
    }

    /// Assign a parameter, clamping into its range. Returns the stored value.
    pub fn set(&mut self, param: Parameter, value: f32) -> f32 {
        let clamped = param.range().clamp(value, param.default_value());
        let slot = match param {
            Parameter::Volume => &mut self.volume,
            Parameter::ModRate => &mut self.mod_rate,
            Parameter::ModDepth => &mut self.mod_depth,
            Parameter::FilterCutoff => &mut self.filter_cutoff,
            Parameter::FilterResonance => &mut self.filter_resonance,
            Parameter::PitchBend => &mut self.pitch_bend,
            Parameter::ControlPosition => &mut self.control_position,
        };
        *slot = clamped;
        clamped
    }
}
