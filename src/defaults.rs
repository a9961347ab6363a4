//! Default values for supervisor timing and restart policy.

use std::time::Duration;

pub const CALL_TIMEOUT_MS: u64 = 10_000;
pub const STARTUP_TIMEOUT_MS: u64 = 10_000;
pub const MAX_RESTARTS: u32 = 3;
pub const RESTART_BACKOFF_INITIAL_MS: u64 = 1_000;
pub const RESTART_BACKOFF_MAX_MS: u64 = 10_000;
pub const RESTART_BACKOFF_MULTIPLIER: f64 = 2.0;
pub const RESTART_JITTER: f64 = 0.1;
pub const STABLE_PERIOD_MS: u64 = 30_000;
pub const HEARTBEAT_TIMEOUT_MS: u64 = 5_000;
pub const SHUTDOWN_GRACE_MS: u64 = 2_000;

pub fn call_timeout() -> Duration { Duration::from_millis(CALL_TIMEOUT_MS) }
pub fn startup_timeout() -> Duration { Duration::from_millis(STARTUP_TIMEOUT_MS) }
pub fn restart_backoff_initial() -> Duration { Duration::from_millis(RESTART_BACKOFF_INITIAL_MS) }
pub fn restart_backoff_max() -> Duration { Duration::from_millis(RESTART_BACKOFF_MAX_MS) }
pub fn stable_period() -> Duration { Duration::from_millis(STABLE_PERIOD_MS) }
pub fn heartbeat_timeout() -> Duration { Duration::from_millis(HEARTBEAT_TIMEOUT_MS) }
pub fn shutdown_grace() -> Duration { Duration::from_millis(SHUTDOWN_GRACE_MS) }
