//! Pool configuration.

use std::time::Duration;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Target number of pooled execution units
    pub max_workers: usize,
    /// Budget for one worker's init handshake
    pub init_timeout: Duration,
    /// How long an acquire may wait on the FIFO wait-list
    pub wait_ceiling: Duration,
    /// Interval between idle-worker health sweeps
    pub health_interval: Duration,
    /// Budget for one health-check ping
    pub ping_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            init_timeout: Duration::from_secs(10),
            wait_ceiling: Duration::from_secs(10),
            health_interval: Duration::from_secs(60),
            ping_timeout: Duration::from_secs(2),
        }
    }
}

impl PoolConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_workers: std::env::var("VTRACE_MAX_WORKERS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_workers),
            init_timeout: env_duration_secs("VTRACE_INIT_TIMEOUT_SECS", defaults.init_timeout),
            wait_ceiling: env_duration_secs("VTRACE_WAIT_CEILING_SECS", defaults.wait_ceiling),
            health_interval: env_duration_secs(
                "VTRACE_HEALTH_INTERVAL_SECS",
                defaults.health_interval,
            ),
            ping_timeout: env_duration_secs("VTRACE_PING_TIMEOUT_SECS", defaults.ping_timeout),
        }
    }
}

fn env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
