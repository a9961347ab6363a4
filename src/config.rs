//! Supervisor configuration.
//!
//! `SupervisorConfig::default()` carries the built-in defaults.
//! `SupervisorConfig::from_env()` layers `FXVISOR_*` overrides on top.

use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;

use crate::defaults;
use crate::engine::EnginePolicy;

pub const ENV_CALL_TIMEOUT_MS: &str = "FXVISOR_CALL_TIMEOUT_MS";
pub const ENV_STARTUP_TIMEOUT_MS: &str = "FXVISOR_STARTUP_TIMEOUT_MS";
pub const ENV_MAX_RESTARTS: &str = "FXVISOR_MAX_RESTARTS";
pub const ENV_RESTART_BACKOFF_MS: &str = "FXVISOR_RESTART_BACKOFF_MS";
pub const ENV_ENGINE: &str = "FXVISOR_ENGINE";
pub const ENV_NATIVE_LIBRARY: &str = "FXVISOR_NATIVE_LIBRARY";
pub const ENV_WORKER_PATH: &str = "FXVISOR_WORKER_PATH";

/// Bounded restart with capped exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// Consecutive restart attempts allowed before giving up.
    pub max_restarts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Fractional jitter in [0, 1] applied to each delay.
    pub jitter: f64,
    /// A worker that stays ready this long resets the attempt counter.
    pub stable_period: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: defaults::MAX_RESTARTS,
            initial_backoff: defaults::restart_backoff_initial(),
            max_backoff: defaults::restart_backoff_max(),
            multiplier: defaults::RESTART_BACKOFF_MULTIPLIER,
            jitter: defaults::RESTART_JITTER,
            stable_period: defaults::stable_period(),
        }
    }
}

impl RestartPolicy {
    /// Policy that never restarts.
    pub fn never() -> Self {
        Self {
            max_restarts: 0,
            ..Self::default()
        }
    }

    /// Delay before restart attempt `attempt` (1-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let cap = self.max_backoff.as_secs_f64();
        if !secs.is_finite() || secs > cap {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// Delay before restart attempt `attempt`, with jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        base.mul_f64(factor)
    }
}

/// Everything a supervisor needs to launch and manage its worker.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Engine selection policy passed to the worker.
    pub engine: EnginePolicy,
    /// Shared library implementing the native engine.
    pub native_library: Option<PathBuf>,
    /// Worker executable. Resolved automatically when unset.
    pub worker_path: Option<PathBuf>,
    pub call_timeout: Duration,
    /// Bound on launch plus the ready/create handshake.
    pub startup_timeout: Duration,
    pub restart: RestartPolicy,
    /// Kill and restart the worker when a call times out.
    pub restart_on_timeout: bool,
    /// Ping the worker this often. Disabled when `None`.
    pub heartbeat_interval: Option<Duration>,
    pub heartbeat_timeout: Duration,
    /// How long a shutdown waits for the worker to exit before signalling it.
    pub shutdown_grace: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            engine: EnginePolicy::default(),
            native_library: None,
            worker_path: None,
            call_timeout: defaults::call_timeout(),
            startup_timeout: defaults::startup_timeout(),
            restart: RestartPolicy::default(),
            restart_on_timeout: false,
            heartbeat_interval: None,
            heartbeat_timeout: defaults::heartbeat_timeout(),
            shutdown_grace: defaults::shutdown_grace(),
        }
    }
}

impl SupervisorConfig {
    /// Defaults overridden by `FXVISOR_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    /// Apply overrides from `lookup`. Unparseable values are logged and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_CALL_TIMEOUT_MS) {
            self.call_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_STARTUP_TIMEOUT_MS) {
            self.startup_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<u32, _>(&lookup, ENV_MAX_RESTARTS) {
            self.restart.max_restarts = n;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_RESTART_BACKOFF_MS) {
            self.restart.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(policy) = parse_var::<EnginePolicy, _>(&lookup, ENV_ENGINE) {
            self.engine = policy;
        }
        if let Some(path) = lookup(ENV_NATIVE_LIBRARY).filter(|s| !s.is_empty()) {
            self.native_library = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup(ENV_WORKER_PATH).filter(|s| !s.is_empty()) {
            self.worker_path = Some(PathBuf::from(path));
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring invalid value '{}' for {}", raw, key);
            None
        }
    }
}
