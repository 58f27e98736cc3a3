//! Conversion results.

use serde::{Deserialize, Serialize};

/// Output of a successful conversion.
///
/// Immutable once stored in the result cache; concurrent readers share
/// the same `Arc<VectorResult>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorResult {
    /// The generated SVG document
    pub svg: String,
    /// Number of emitted paths
    pub path_count: usize,
    /// Total node count across all paths
    pub node_count: usize,
    /// Engine-side processing time
    pub processing_time_ms: u64,
}
