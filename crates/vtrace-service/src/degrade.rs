//! Config degradation for critical-fault retries.

use std::time::Duration;

use vtrace_models::ConversionConfig;

/// How a job's parameters are reduced on its single retry after a
/// critical fault, trading quality for reliability.
///
/// The right reduction depends on the wrapped engine's resource profile,
/// so every knob is configurable rather than hard-coded.
#[derive(Debug, Clone)]
pub struct DegradePolicy {
    /// Multiplier applied to the detail level
    pub detail_factor: f32,
    /// Collapse multipass configs to a single pass
    pub force_single_pass: bool,
    /// Force single-threaded engine execution
    pub force_single_threaded: bool,
    /// Multiplier applied to the remaining deadline
    pub deadline_factor: f32,
}

impl Default for DegradePolicy {
    fn default() -> Self {
        Self {
            detail_factor: 0.5,
            force_single_pass: true,
            force_single_threaded: true,
            deadline_factor: 1.5,
        }
    }
}

impl DegradePolicy {
    /// Derive the reduced-fidelity variant of `config`.
    pub fn degrade(&self, config: &ConversionConfig) -> ConversionConfig {
        let mut degraded = config.clone();
        degraded.detail = (config.detail * self.detail_factor).clamp(0.0, 1.0);
        if self.force_single_pass {
            degraded.pass_count = 1;
            degraded.enable_multipass = false;
        }
        if self.force_single_threaded {
            degraded.single_threaded = true;
        }
        degraded
    }

    /// Extend a deadline for the degraded attempt.
    pub fn extend_deadline(&self, deadline: Duration) -> Duration {
        deadline.mul_f32(self.deadline_factor.max(1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degrade_halves_detail_and_forces_single_pass() {
        let config = ConversionConfig::default()
            .with_detail(0.8)
            .with_pass_count(5);

        let degraded = DegradePolicy::default().degrade(&config);
        assert!((degraded.detail - 0.4).abs() < 1e-6);
        assert_eq!(degraded.pass_count, 1);
        assert!(!degraded.enable_multipass);
        assert!(degraded.single_threaded);
        // Untouched knobs survive.
        assert_eq!(degraded.backend, config.backend);
    }

    #[test]
    fn deadline_extension_never_shrinks() {
        let policy = DegradePolicy {
            deadline_factor: 0.5,
            ..Default::default()
        };
        let extended = policy.extend_deadline(Duration::from_secs(10));
        assert_eq!(extended, Duration::from_secs(10));
    }

    #[test]
    fn default_extension_is_half_again() {
        let extended = DegradePolicy::default().extend_deadline(Duration::from_secs(10));
        assert_eq!(extended, Duration::from_secs(15));
    }
}
