//! Per-stream job serialization.
//!
//! Jobs from one logical stream (a caller session, typically) run one at
//! a time to full settlement, so two quick submissions can never
//! interleave against shared client state. Separate streams drain
//! concurrently and race for the worker pool.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tracing::debug;

use vtrace_models::JobId;

/// Deferred work for one queued job. Invoked exactly once by the
/// stream's drain task; dropping it without invoking abandons the job.
pub type QueueTask = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct QueuedJob {
    job_id: JobId,
    task: QueueTask,
}

#[derive(Default)]
struct StreamState {
    jobs: VecDeque<QueuedJob>,
    draining: bool,
}

struct QueueShared {
    streams: Mutex<HashMap<String, StreamState>>,
    closed: AtomicBool,
}

/// FIFO queues keyed by stream, each drained by at most one task.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueShared>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(QueueShared {
                streams: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Append a job to its stream and start the drain task if idle.
    ///
    /// Returns `false` without queueing when the queue is closed.
    pub fn enqueue(&self, stream: &str, job_id: JobId, task: QueueTask) -> bool {
        if self.inner.closed.load(Ordering::SeqCst) {
            return false;
        }

        let start_drain = {
            let mut streams = self.inner.streams.lock().unwrap();
            let state = streams.entry(stream.to_string()).or_default();
            state.jobs.push_back(QueuedJob { job_id, task });
            if state.draining {
                false
            } else {
                state.draining = true;
                true
            }
        };

        if start_drain {
            let queue = self.clone();
            let key = stream.to_string();
            tokio::spawn(async move { queue.drain(key).await });
        }
        true
    }

    /// Remove a still-queued job. Returns `false` if the job has already
    /// been handed to the drain task (or never existed).
    pub fn remove(&self, stream: &str, job_id: &JobId) -> bool {
        let mut streams = self.inner.streams.lock().unwrap();
        let Some(state) = streams.get_mut(stream) else {
            return false;
        };
        match state.jobs.iter().position(|j| &j.job_id == job_id) {
            Some(pos) => {
                state.jobs.remove(pos);
                debug!(job_id = %job_id, stream, "removed queued job");
                true
            }
            None => false,
        }
    }

    /// Close the queue and drop every queued job. Jobs already running
    /// settle normally. Returns the number of dropped jobs.
    pub fn close(&self) -> usize {
        self.inner.closed.store(true, Ordering::SeqCst);
        let mut streams = self.inner.streams.lock().unwrap();
        let mut dropped = 0;
        for state in streams.values_mut() {
            dropped += state.jobs.len();
            state.jobs.clear();
        }
        dropped
    }

    /// Jobs currently waiting (not yet running) across all streams.
    pub fn queued_len(&self) -> usize {
        let streams = self.inner.streams.lock().unwrap();
        streams.values().map(|s| s.jobs.len()).sum()
    }

    /// Process one job at a time until the stream runs dry. A failed job
    /// settles its own waiters; the loop always continues.
    async fn drain(self, key: String) {
        loop {
            let next = {
                let mut streams = self.inner.streams.lock().unwrap();
                let Some(state) = streams.get_mut(&key) else {
                    return;
                };
                match state.jobs.pop_front() {
                    Some(job) => Some(job),
                    None => {
                        state.draining = false;
                        None
                    }
                }
            };

            match next {
                Some(job) => {
                    debug!(job_id = %job.job_id, stream = %key, "drain loop running job");
                    (job.task)().await;
                }
                None => return,
            }
        }
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}
