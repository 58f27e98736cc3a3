//! Engine capability descriptor.

/// Feature set reported once by an engine at `init()` time.
///
/// The coordinator consults this descriptor instead of probing for
/// optional behavior per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineCapabilities {
    /// The engine emits progress events while processing.
    pub reports_progress: bool,
    /// The engine honors cooperative abort requests mid-job.
    pub supports_abort: bool,
    /// The engine can use internal parallelism; when false the
    /// coordinator forces single-threaded configs.
    pub parallel: bool,
    /// Largest width or height the engine accepts.
    pub max_dimension: u32,
}

impl Default for EngineCapabilities {
    fn default() -> Self {
        Self {
            reports_progress: true,
            supports_abort: true,
            parallel: true,
            max_dimension: vtrace_models::MAX_IMAGE_DIMENSION,
        }
    }
}
