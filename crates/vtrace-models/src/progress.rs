//! Normalized progress updates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline stage reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Preprocessing,
    Tracing,
    PathFitting,
    SvgEmit,
}

impl fmt::Display for ProgressStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProgressStage::Preprocessing => "preprocessing",
            ProgressStage::Tracing => "tracing",
            ProgressStage::PathFitting => "path_fitting",
            ProgressStage::SvgEmit => "svg_emit",
        };
        f.write_str(name)
    }
}

/// Normalized progress event delivered to caller callbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Current pipeline stage
    pub stage: ProgressStage,
    /// Overall completion in percent (0-100)
    pub percent: u8,
    /// Time elapsed since the job started running
    pub elapsed_ms: u64,
    /// Estimate derived from elapsed time and completion, when available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_ms: Option<u64>,
}
