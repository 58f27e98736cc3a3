//! Shared data models for the vtrace conversion subsystem.
//!
//! This crate provides Serde-serializable value types for:
//! - Jobs, job states, and intensity classes
//! - Conversion configuration and trace backends
//! - Image payloads and validation limits
//! - Fingerprints for cache lookup and dedup
//! - Vector results and normalized progress updates
//! - The caller-facing error taxonomy

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod image;
pub mod job;
pub mod progress;
pub mod result;

// Re-export common types
pub use config::{ConversionConfig, TraceBackend};
pub use error::{ConversionError, ConversionResult, CriticalFault};
pub use fingerprint::Fingerprint;
pub use image::{ImagePayload, MAX_IMAGE_DIMENSION, MAX_IMAGE_PIXELS};
pub use job::{IntensityClass, JobId, JobPriority, JobState};
pub use progress::{ProgressStage, ProgressUpdate};
pub use result::VectorResult;
