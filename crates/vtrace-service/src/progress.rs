//! Per-job progress fan-out.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::warn;

use vtrace_engine::RawProgress;
use vtrace_models::{JobId, ProgressUpdate};

/// Observer invoked with normalized progress for one job.
pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// In-memory fan-out from worker progress events to caller callbacks.
///
/// Purely transient: nothing is persisted, and a slow or panicking
/// callback never blocks the worker's message loop (events arrive over a
/// channel and callbacks run on the coordinator side).
#[derive(Default)]
pub struct ProgressAggregator {
    observers: Mutex<HashMap<JobId, ProgressCallback>>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the observer for a job, replacing any previous one.
    pub fn attach(&self, job_id: JobId, callback: ProgressCallback) {
        self.observers.lock().unwrap().insert(job_id, callback);
    }

    /// Remove a job's observer. Safe to call repeatedly or for jobs that
    /// never attached one.
    pub fn detach(&self, job_id: &JobId) {
        self.observers.lock().unwrap().remove(job_id);
    }

    /// Normalize a raw engine event and deliver it to the job's
    /// observer, if any. A panicking observer is detached and the panic
    /// swallowed; the underlying job is unaffected.
    pub fn report(&self, job_id: &JobId, raw: RawProgress) {
        let callback = {
            let observers = self.observers.lock().unwrap();
            observers.get(job_id).cloned()
        };
        let Some(callback) = callback else { return };

        let update = normalize(raw);
        if catch_unwind(AssertUnwindSafe(|| callback(update))).is_err() {
            warn!(job_id = %job_id, "progress callback panicked; detaching it");
            self.detach(job_id);
        }
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        self.observers.lock().unwrap().len()
    }
}

/// Clamp percent into range and derive a remaining-time estimate from
/// the elapsed time and completion ratio.
fn normalize(raw: RawProgress) -> ProgressUpdate {
    let percent = raw.percent.min(100);
    let estimated_remaining_ms = if percent > 0 && percent < 100 {
        Some(raw.elapsed_ms * (100 - percent as u64) / percent as u64)
    } else {
        None
    };
    ProgressUpdate {
        stage: raw.stage,
        percent,
        elapsed_ms: raw.elapsed_ms,
        estimated_remaining_ms,
    }
}
