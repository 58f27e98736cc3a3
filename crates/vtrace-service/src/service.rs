//! The conversion service facade.
//!
//! An explicitly constructed service object: the host application builds
//! one with [`VectorizerService::start`], clones it wherever jobs are
//! submitted, and calls [`VectorizerService::shutdown`] when done. No
//! globals, no hidden cross-instance state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use validator::Validate;

use vtrace_engine::EngineFactory;
use vtrace_models::{
    ConversionConfig, ConversionError, Fingerprint, ImagePayload, IntensityClass, JobId,
    JobPriority, JobState, ProgressUpdate, VectorResult,
};
use vtrace_pool::{spawn_health_loop, WorkerPool};

use crate::cache::ResultCache;
use crate::config::ServiceConfig;
use crate::progress::{ProgressAggregator, ProgressCallback};
use crate::queue::JobQueue;
use crate::runner::{JobCtl, JobRunner, RunnerJob};

/// Stream jobs land on when the caller does not name one.
const DEFAULT_STREAM: &str = "default";

/// Options accepted by [`VectorizerService::submit`].
#[derive(Default)]
pub struct SubmitOptions {
    /// Logical stream the job serializes against (defaults to a shared
    /// stream; use one key per caller session)
    pub stream: Option<String>,
    /// Scheduling hint; `High` forces isolated-worker escalation
    pub priority: JobPriority,
    /// Observer for normalized progress updates
    pub on_progress: Option<ProgressCallback>,
    /// Base-timeout override in milliseconds
    pub timeout_ms: Option<u64>,
}

impl SubmitOptions {
    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_progress(
        mut self,
        callback: impl Fn(ProgressUpdate) + Send + Sync + 'static,
    ) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// Handle for one accepted submission.
#[derive(Debug)]
pub struct SubmittedJob {
    pub job_id: JobId,
    rx: oneshot::Receiver<Result<Arc<VectorResult>, ConversionError>>,
}

impl SubmittedJob {
    /// Wait for the job to settle.
    pub async fn await_result(self) -> Result<Arc<VectorResult>, ConversionError> {
        self.rx
            .await
            .unwrap_or_else(|_| Err(ConversionError::ShuttingDown))
    }
}

/// Point-in-time service statistics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ServiceStats {
    pub total_workers: usize,
    pub idle: usize,
    pub busy: usize,
    pub error: usize,
    pub total_processed: u64,
    pub avg_processing_time_ms: u64,
}

struct JobEntry {
    stream: String,
    state: JobState,
    ctl: JobCtl,
    settle: Option<oneshot::Sender<Result<Arc<VectorResult>, ConversionError>>>,
}

#[derive(Default)]
struct Timings {
    completed: u64,
    total_ms: u64,
}

struct ServiceShared {
    config: ServiceConfig,
    pool: Arc<WorkerPool>,
    cache: ResultCache,
    queue: JobQueue,
    progress: Arc<ProgressAggregator>,
    runner: JobRunner,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    timings: Mutex<Timings>,
    shutdown_tx: watch::Sender<bool>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// The public surface of the conversion subsystem.
#[derive(Clone)]
pub struct VectorizerService {
    inner: Arc<ServiceShared>,
}

impl VectorizerService {
    /// Initialize the worker pool and start the service.
    pub async fn start(
        config: ServiceConfig,
        factory: EngineFactory,
    ) -> Result<Self, ConversionError> {
        let pool = WorkerPool::initialize(Arc::clone(&factory), config.pool.clone()).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let health_task = spawn_health_loop(Arc::clone(&pool), shutdown_rx);

        let progress = Arc::new(ProgressAggregator::new());
        let runner = JobRunner::new(
            Arc::clone(&pool),
            factory,
            Arc::clone(&progress),
            config.clone(),
        );

        let inner = Arc::new(ServiceShared {
            cache: ResultCache::new(config.cache_capacity),
            config,
            pool,
            queue: JobQueue::new(),
            progress,
            runner,
            jobs: Mutex::new(HashMap::new()),
            timings: Mutex::new(Timings::default()),
            shutdown_tx,
            health_task: Mutex::new(Some(health_task)),
            closed: AtomicBool::new(false),
        });

        info!("vectorizer service started");
        Ok(Self { inner })
    }

    /// Submit a conversion job.
    ///
    /// Validates the input up front, then resolves through the result
    /// cache: a completed entry settles immediately, an in-flight build
    /// with the same fingerprint is joined, and only a genuinely new job
    /// is queued on its stream.
    pub fn submit(
        &self,
        image: ImagePayload,
        config: ConversionConfig,
        options: SubmitOptions,
    ) -> Result<SubmittedJob, ConversionError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ConversionError::ShuttingDown);
        }
        config
            .validate()
            .map_err(|e| ConversionError::validation(e.to_string()))?;

        let job_id = JobId::new();
        let fingerprint = Fingerprint::compute(&image, &config);
        let stream = options
            .stream
            .unwrap_or_else(|| DEFAULT_STREAM.to_string());
        let intensity = self
            .inner
            .config
            .classify_intensity(&image, &config, options.priority);
        let deadline_override = options.timeout_ms.map(Duration::from_millis);
        let ctl = JobCtl::new();
        let (settle_tx, settle_rx) = oneshot::channel();

        if let Some(callback) = options.on_progress {
            self.inner.progress.attach(job_id.clone(), callback);
        }
        {
            let mut jobs = self.inner.jobs.lock().unwrap();
            jobs.insert(
                job_id.clone(),
                JobEntry {
                    stream: stream.clone(),
                    state: JobState::Queued,
                    ctl: ctl.clone(),
                    settle: Some(settle_tx),
                },
            );
        }

        info!(
            job_id = %job_id,
            stream = %stream,
            intensity = ?intensity,
            megapixels = image.megapixels(),
            "job submitted"
        );

        let driver = Arc::clone(&self.inner);
        let driver_job_id = job_id.clone();
        tokio::spawn(async move {
            let result = Arc::clone(&driver)
                .run_cached(
                    driver_job_id.clone(),
                    fingerprint,
                    stream,
                    image,
                    config,
                    intensity,
                    ctl,
                    deadline_override,
                )
                .await;
            driver.settle_job(&driver_job_id, result);
        });

        Ok(SubmittedJob { job_id, rx: settle_rx })
    }

    /// Abort a job. The caller's handle settles immediately; the worker
    /// is signalled cooperatively and reclaimed by the runner.
    pub fn abort(&self, job_id: &JobId) {
        let taken = {
            let mut jobs = self.inner.jobs.lock().unwrap();
            jobs.get_mut(job_id).map(|entry| {
                entry.ctl.request_abort();
                entry.state = JobState::Aborted;
                (entry.stream.clone(), entry.settle.take())
            })
        };

        let Some((stream, settle)) = taken else {
            debug!(job_id = %job_id, "abort for unknown or settled job");
            return;
        };

        if self.inner.queue.remove(&stream, job_id) {
            debug!(job_id = %job_id, "aborted before dispatch");
        }
        if let Some(tx) = settle {
            let _ = tx.send(Err(ConversionError::Aborted));
        }
        self.inner.progress.detach(job_id);
        info!(job_id = %job_id, "job aborted");
    }

    /// Pool and throughput statistics.
    pub fn stats(&self) -> ServiceStats {
        let snapshot = self.inner.pool.snapshot();
        let timings = self.inner.timings.lock().unwrap();
        ServiceStats {
            total_workers: snapshot.total_workers,
            idle: snapshot.idle,
            busy: snapshot.busy,
            error: snapshot.error,
            total_processed: snapshot.total_processed,
            avg_processing_time_ms: if timings.completed > 0 {
                timings.total_ms / timings.completed
            } else {
                0
            },
        }
    }

    /// Drop every cached result and pending marker.
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
    }

    /// Number of completed cache entries.
    pub fn cache_len(&self) -> usize {
        self.inner.cache.len()
    }

    /// Reject unstarted jobs, stop the health loop, terminate all
    /// workers, and clear the cache.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("vectorizer service shutting down");

        let dropped = self.inner.queue.close();

        let pending: Vec<_> = {
            let mut jobs = self.inner.jobs.lock().unwrap();
            jobs.iter_mut()
                .filter_map(|(id, entry)| entry.settle.take().map(|tx| (id.clone(), tx)))
                .collect()
        };
        for (job_id, tx) in pending {
            let _ = tx.send(Err(ConversionError::ShuttingDown));
            self.inner.progress.detach(&job_id);
        }

        let _ = self.inner.shutdown_tx.send(true);
        let health = self.inner.health_task.lock().unwrap().take();
        if let Some(task) = health {
            let _ = task.await;
        }

        self.inner.pool.shutdown();
        self.inner.cache.clear();
        info!(dropped_jobs = dropped, "vectorizer service shut down");
    }
}

impl ServiceShared {
    /// Resolve one submission through the cache; the compute path queues
    /// the job on its stream and runs it to settlement.
    #[allow(clippy::too_many_arguments)]
    async fn run_cached(
        self: Arc<Self>,
        job_id: JobId,
        fingerprint: Fingerprint,
        stream: String,
        image: ImagePayload,
        config: ConversionConfig,
        intensity: IntensityClass,
        ctl: JobCtl,
        deadline_override: Option<Duration>,
    ) -> Result<Arc<VectorResult>, ConversionError> {
        let shared = Arc::clone(&self);
        let compute = async move {
            let (done_tx, done_rx) = oneshot::channel();
            let task_shared = Arc::clone(&shared);
            let task_job_id = job_id.clone();

            let enqueued = shared.queue.enqueue(
                &stream,
                job_id.clone(),
                Box::new(move || {
                    async move {
                        let result = task_shared
                            .execute(task_job_id, image, config, intensity, ctl, deadline_override)
                            .await;
                        let _ = done_tx.send(result);
                    }
                    .boxed()
                }),
            );
            if !enqueued {
                return Err(ConversionError::ShuttingDown);
            }

            match done_rx.await {
                Ok(result) => result,
                // The queued task was dropped before running: either the
                // job was aborted out of the queue or the queue closed.
                Err(_) => {
                    if shared.closed.load(Ordering::SeqCst) {
                        Err(ConversionError::ShuttingDown)
                    } else {
                        Err(ConversionError::Aborted)
                    }
                }
            }
        };

        self.cache.get_or_compute(fingerprint, compute).await
    }

    /// Run one dequeued job through the runner and record its timing.
    async fn execute(
        self: Arc<Self>,
        job_id: JobId,
        image: ImagePayload,
        config: ConversionConfig,
        intensity: IntensityClass,
        ctl: JobCtl,
        deadline_override: Option<Duration>,
    ) -> Result<Arc<VectorResult>, ConversionError> {
        let mut job = RunnerJob {
            id: job_id.clone(),
            image,
            config,
            intensity,
            state: JobState::Queued,
            deadline_override,
        };

        self.set_state(&job_id, JobState::Dispatched);
        let started = Instant::now();
        let result = self.runner.run(&mut job, &ctl).await;
        self.set_state(&job_id, job.state);

        if result.is_ok() {
            let mut timings = self.timings.lock().unwrap();
            timings.completed += 1;
            timings.total_ms += started.elapsed().as_millis() as u64;
        }
        result
    }

    /// Deliver the settlement to the submitter and drop the registry
    /// entry. A no-op for jobs already settled by `abort` or `shutdown`.
    fn settle_job(&self, job_id: &JobId, result: Result<Arc<VectorResult>, ConversionError>) {
        let entry = self.jobs.lock().unwrap().remove(job_id);
        if let Some(entry) = entry {
            if let Some(tx) = entry.settle {
                let _ = tx.send(result);
            }
        }
        self.progress.detach(job_id);
    }

    fn set_state(&self, job_id: &JobId, state: JobState) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(entry) = jobs.get_mut(job_id) {
            if entry.state != JobState::Aborted {
                entry.state = state;
            }
        }
    }
}
