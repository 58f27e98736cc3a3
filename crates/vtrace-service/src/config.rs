//! Service configuration.

use std::time::Duration;

use vtrace_models::{ConversionConfig, ImagePayload, IntensityClass, JobPriority};
use vtrace_pool::PoolConfig;

use crate::degrade::DegradePolicy;

/// Configuration for the conversion service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Worker pool settings
    pub pool: PoolConfig,
    /// Completed cache entries kept before LRU eviction
    pub cache_capacity: usize,
    /// Deadline base for a zero-size input
    pub base_timeout: Duration,
    /// Additional deadline per megapixel of input
    pub per_megapixel: Duration,
    /// Hard cap on any computed deadline
    pub max_deadline: Duration,
    /// Pass count at or above which a job is high-intensity
    pub high_pass_threshold: u32,
    /// Megapixels at or above which a job is high-intensity and a
    /// timeout counts as a critical fault
    pub large_image_mp: f64,
    /// Config degradation applied on the critical-fault retry
    pub degrade: DegradePolicy,
    /// How long an aborted job's worker may keep running before it is
    /// forcibly replaced
    pub abort_grace: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            cache_capacity: 64,
            base_timeout: Duration::from_secs(60),
            per_megapixel: Duration::from_secs(2),
            max_deadline: Duration::from_secs(300),
            high_pass_threshold: 7,
            large_image_mp: 16.0,
            degrade: DegradePolicy::default(),
            abort_grace: Duration::from_millis(500),
        }
    }
}

impl ServiceConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            pool: PoolConfig::from_env(),
            cache_capacity: std::env::var("VTRACE_CACHE_CAPACITY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.cache_capacity),
            base_timeout: env_duration_secs("VTRACE_BASE_TIMEOUT_SECS", defaults.base_timeout),
            per_megapixel: env_duration_secs(
                "VTRACE_PER_MEGAPIXEL_SECS",
                defaults.per_megapixel,
            ),
            max_deadline: env_duration_secs("VTRACE_MAX_DEADLINE_SECS", defaults.max_deadline),
            high_pass_threshold: std::env::var("VTRACE_HIGH_PASS_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.high_pass_threshold),
            large_image_mp: std::env::var("VTRACE_LARGE_IMAGE_MP")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.large_image_mp),
            degrade: DegradePolicy::default(),
            abort_grace: defaults.abort_grace,
        }
    }

    /// Deadline scaled by input size: `base + per_megapixel * MP`,
    /// clamped to the hard maximum.
    pub fn deadline_for(&self, megapixels: f64, base_override: Option<Duration>) -> Duration {
        let base = base_override.unwrap_or(self.base_timeout);
        let scaled = base + self.per_megapixel.mul_f64(megapixels);
        scaled.min(self.max_deadline)
    }

    /// Classify a job's intensity from its image, config, and the
    /// caller's priority hint.
    pub fn classify_intensity(
        &self,
        image: &ImagePayload,
        config: &ConversionConfig,
        priority: JobPriority,
    ) -> IntensityClass {
        if priority == JobPriority::High
            || config.pass_count >= self.high_pass_threshold
            || image.megapixels() >= self.large_image_mp
        {
            IntensityClass::High
        } else {
            IntensityClass::Normal
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
