//! Conversion job orchestration.
//!
//! This crate ties the subsystem together: the per-stream job queue, the
//! fingerprint result cache, the progress aggregator, the job runner
//! state machine, and the [`VectorizerService`] facade the host
//! application talks to.

pub mod cache;
pub mod config;
pub mod degrade;
pub mod logging;
pub mod progress;
pub mod queue;
pub mod runner;
pub mod service;

pub use cache::ResultCache;
pub use config::ServiceConfig;
pub use degrade::DegradePolicy;
pub use progress::{ProgressAggregator, ProgressCallback};
pub use queue::JobQueue;
pub use runner::{JobCtl, JobRunner};
pub use service::{ServiceStats, SubmitOptions, SubmittedJob, VectorizerService};
