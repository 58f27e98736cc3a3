//! Conversion configuration.
//!
//! A `ConversionConfig` is a plain value type compared structurally; its
//! canonical JSON form feeds the job fingerprint, so field order and
//! serialization must stay deterministic.

use serde::{Deserialize, Serialize};
use std::fmt;
use validator::Validate;

/// Tracing backend selected for a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TraceBackend {
    /// Edge detection + contour following (sparse outlines)
    #[default]
    Edge,
    /// Skeleton + centerline tracing (engraving/sketch effects)
    Centerline,
    /// Large cell-shaded regions
    Superpixel,
    /// Dot-based stippling/pointillism
    Dots,
}

impl fmt::Display for TraceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TraceBackend::Edge => "edge",
            TraceBackend::Centerline => "centerline",
            TraceBackend::Superpixel => "superpixel",
            TraceBackend::Dots => "dots",
        };
        f.write_str(name)
    }
}

/// Parameters for a single conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ConversionConfig {
    /// Selected tracing backend
    pub backend: TraceBackend,

    /// Detail level (0.0 = very sparse, 1.0 = maximum detail)
    #[validate(range(min = 0.0, max = 1.0))]
    pub detail: f32,

    /// Stroke width at 1080p reference resolution
    #[validate(range(min = 0.1, max = 50.0))]
    pub stroke_px_at_1080p: f32,

    /// Enable multi-pass processing for enhanced quality
    pub enable_multipass: bool,

    /// Number of processing passes (more than one implies multipass)
    #[validate(range(min = 1, max = 10))]
    pub pass_count: u32,

    /// Enable content-aware noise filtering
    pub noise_filtering: bool,

    /// Force single-threaded execution inside the engine
    pub single_threaded: bool,

    /// Optional per-job engine time budget in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_processing_time_ms: Option<u64>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            backend: TraceBackend::Edge,
            detail: 0.5,
            stroke_px_at_1080p: 1.5,
            enable_multipass: false,
            pass_count: 1,
            noise_filtering: true,
            single_threaded: false,
            max_processing_time_ms: None,
        }
    }
}

impl ConversionConfig {
    /// Create a config for the given backend with default parameters.
    pub fn new(backend: TraceBackend) -> Self {
        Self {
            backend,
            ..Default::default()
        }
    }

    /// Set the detail level.
    pub fn with_detail(mut self, detail: f32) -> Self {
        self.detail = detail;
        self
    }

    /// Set the stroke width at 1080p reference resolution.
    pub fn with_stroke_width(mut self, px: f32) -> Self {
        self.stroke_px_at_1080p = px;
        self
    }

    /// Set the pass count. More than one pass enables multipass processing.
    pub fn with_pass_count(mut self, count: u32) -> Self {
        self.pass_count = count;
        if count > 1 {
            self.enable_multipass = true;
        }
        self
    }

    /// Enable or disable noise filtering.
    pub fn with_noise_filtering(mut self, enabled: bool) -> Self {
        self.noise_filtering = enabled;
        self
    }

    /// Force single-threaded execution.
    pub fn with_single_threaded(mut self, enabled: bool) -> Self {
        self.single_threaded = enabled;
        self
    }

    /// Set the per-job engine time budget.
    pub fn with_time_budget_ms(mut self, ms: u64) -> Self {
        self.max_processing_time_ms = Some(ms);
        self
    }

    /// Canonical serialization used for fingerprinting.
    ///
    /// Field order is fixed by the struct definition, so the output is
    /// deterministic for structurally equal configs.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).expect("config serialization cannot fail")
    }
}
