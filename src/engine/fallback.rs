//! Software fallback engine.
//!
//! Pure Rust, no FFI. Each block is processed independently from the current
//! parameters, so the same input and parameters always yield the same output.

use std::f32::consts::PI;

use super::{Engine, EngineKind, Parameter, ParameterSet};

/// Sample rate the fallback assumes when mapping Hz-based parameters.
pub const SAMPLE_RATE: f32 = 44_100.0;

const MIN_MOD_HZ: f32 = 0.1;
const MAX_MOD_HZ: f32 = 10.0;

/// Software engine: pitch resample, one-pole low-pass, amplitude modulation, gain.
#[derive(Debug, Clone, Default)]
pub struct SoftwareEngine {
    params: ParameterSet,
}

impl SoftwareEngine {
    pub fn new() -> Self {
        log::debug!("Software engine created");
        Self::default()
    }

    fn resample(&self, block: &[f32]) -> Vec<f32> {
        let ratio = 2f32.powf(self.params.pitch_bend / 12.0);
        if (ratio - 1.0).abs() < f32::EPSILON {
            return block.to_vec();
        }

        let len = block.len();
        (0..len)
            .map(|i| {
                let position = i as f32 * ratio;
                let index = position.floor() as usize;
                let frac = position - index as f32;
                let a = block[index % len];
                let b = block[(index + 1) % len];
                a + (b - a) * frac
            })
            .collect()
    }

    fn low_pass(&self, block: &mut [f32]) {
        let alpha = 1.0 - (-2.0 * PI * self.params.filter_cutoff / SAMPLE_RATE).exp();
        let emphasis = self.params.filter_resonance * 0.5;
        let mut state = 0.0f32;
        let mut previous = 0.0f32;
        for sample in block.iter_mut() {
            state += alpha * (*sample - state);
            *sample = state + emphasis * (state - previous);
            previous = state;
        }
    }

    fn modulate(&self, block: &mut [f32]) {
        if !self.params.mod_enabled || self.params.mod_depth <= 0.0 {
            return;
        }
        let rate_hz = MIN_MOD_HZ + self.params.mod_rate * (MAX_MOD_HZ - MIN_MOD_HZ);
        let step = 2.0 * PI * rate_hz / SAMPLE_RATE;
        let depth = self.params.mod_depth;
        for (n, sample) in block.iter_mut().enumerate() {
            let lfo = 0.5 * (1.0 - (step * n as f32).cos());
            *sample *= 1.0 - depth * lfo;
        }
    }
}

impl Engine for SoftwareEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Fallback
    }

    fn is_initialized(&self) -> bool {
        true
    }

    fn set_parameter(&mut self, param: Parameter, value: f32) -> f32 {
        let stored = self.params.set(param, value);
        log::debug!("{} set to {}", param, stored);
        stored
    }

    fn set_mod_enabled(&mut self, enabled: bool) {
        self.params.mod_enabled = enabled;
        log::debug!("modulation enabled: {}", enabled);
    }

    fn parameters(&self) -> ParameterSet {
        self.params
    }

    fn process_block(&mut self, block: &[f32]) -> Vec<f32> {
        if block.is_empty() {
            return Vec::new();
        }

        let mut out = self.resample(block);
        self.low_pass(&mut out);
        self.modulate(&mut out);

        let gain = self.params.volume;
        for sample in out.iter_mut() {
            *sample = if sample.is_finite() {
                (*sample * gain).clamp(-1.0, 1.0)
            } else {
                0.0
            };
        }
        out
    }
}
