//! Single-job execution state machine.
//!
//! Drives one job through `Dispatched -> Running -> {Completed, Failed,
//! Aborted}` with a single `Retrying` loop back. Normal jobs borrow a
//! pooled worker; high-intensity jobs get a freshly created isolated
//! worker that is terminated unconditionally at terminal state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use vtrace_engine::{
    EngineError, EngineEvent, EngineFactory, EngineHandle, EngineRequest,
};
use vtrace_models::{
    ConversionConfig, ConversionError, CriticalFault, ImagePayload, IntensityClass, JobId,
    JobState, VectorResult,
};
use vtrace_pool::{PoolLease, WorkerPool};

use crate::config::ServiceConfig;
use crate::logging::JobLog;
use crate::progress::ProgressAggregator;

/// Abort signal shared between the service registry and the runner.
#[derive(Clone, Default)]
pub struct JobCtl {
    aborted: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl JobCtl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    async fn wait_aborted(&self) {
        if self.is_aborted() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Mutable job record owned by the runner for one execution.
pub struct RunnerJob {
    pub id: JobId,
    pub image: ImagePayload,
    pub config: ConversionConfig,
    pub intensity: IntensityClass,
    pub state: JobState,
    /// Caller-supplied base-timeout override
    pub deadline_override: Option<Duration>,
}

/// A borrowed pooled worker or a dedicated isolated one.
enum Lease {
    Pooled(PoolLease),
    Isolated(EngineHandle),
}

impl Lease {
    fn handle(&self) -> &EngineHandle {
        match self {
            Lease::Pooled(lease) => &lease.handle,
            Lease::Isolated(handle) => handle,
        }
    }
}

/// What one running attempt ended with.
enum Outcome {
    Completed(VectorResult),
    Failed(EngineError),
    TimedOut,
    ChannelClosed,
    Aborted,
}

pub struct JobRunner {
    pool: Arc<WorkerPool>,
    factory: EngineFactory,
    progress: Arc<ProgressAggregator>,
    config: ServiceConfig,
}

impl JobRunner {
    pub fn new(
        pool: Arc<WorkerPool>,
        factory: EngineFactory,
        progress: Arc<ProgressAggregator>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            pool,
            factory,
            progress,
            config,
        }
    }

    /// Execute one job to a terminal state, retrying internally at most
    /// once.
    pub async fn run(
        &self,
        job: &mut RunnerJob,
        ctl: &JobCtl,
    ) -> Result<Arc<VectorResult>, ConversionError> {
        let log = JobLog::new(&job.id, "conversion");
        let mut config = job.config.clone();
        let mut deadline = self
            .config
            .deadline_for(job.image.megapixels(), job.deadline_override);
        let mut retried = false;

        log.log_start(&format!(
            "{} backend, {:.1} MP, {:?} deadline",
            config.backend,
            job.image.megapixels(),
            deadline
        ));

        loop {
            if ctl.is_aborted() {
                job.state = JobState::Aborted;
                return Err(ConversionError::Aborted);
            }

            job.state = JobState::Dispatched;
            let worker = match self.obtain_worker(job).await {
                Ok(worker) => worker,
                Err(e) => {
                    job.state = JobState::Failed;
                    return Err(e);
                }
            };

            // Capability descriptor consulted once, instead of probing
            // the engine per call.
            if let Some(caps) = worker.handle().capabilities() {
                if !caps.parallel {
                    config.single_threaded = true;
                }
            }

            let request = EngineRequest {
                job_id: job.id.clone(),
                image: job.image.clone(),
                config: config.clone(),
            };
            let mut events = match worker.handle().begin(request).await {
                Ok(events) => events,
                Err(e) => {
                    self.discard(worker);
                    if !retried {
                        retried = true;
                        job.state = JobState::Retrying;
                        log.log_warning("worker unavailable at dispatch, retrying on a fresh one");
                        continue;
                    }
                    job.state = JobState::Failed;
                    return Err(ConversionError::worker_lost(e.to_string()));
                }
            };
            if ctl.is_aborted() {
                worker.handle().request_abort();
            }

            job.state = JobState::Running;
            let started = Instant::now();
            let outcome = self.await_outcome(&job.id, &mut events, deadline, ctl).await;

            match outcome {
                Outcome::Completed(result) => {
                    self.finish(worker);
                    job.state = JobState::Completed;
                    log.log_completion(&format!(
                        "{} paths in {} ms",
                        result.path_count,
                        started.elapsed().as_millis()
                    ));
                    return Ok(Arc::new(result));
                }

                Outcome::Aborted => {
                    job.state = JobState::Aborted;
                    self.reclaim_after_abort(worker, events).await;
                    return Err(ConversionError::Aborted);
                }

                Outcome::Failed(EngineError::Invalid(message)) => {
                    // An application error leaves the worker healthy.
                    self.finish(worker);
                    job.state = JobState::Failed;
                    log.log_error(&format!("rejected by engine: {message}"));
                    return Err(ConversionError::validation(message));
                }

                Outcome::Failed(EngineError::Aborted) => {
                    self.finish(worker);
                    if ctl.is_aborted() {
                        job.state = JobState::Aborted;
                        return Err(ConversionError::Aborted);
                    }
                    // Interrupted from outside the job (pool shrink).
                    if !retried {
                        retried = true;
                        job.state = JobState::Retrying;
                        log.log_warning("worker was interrupted, retrying on a fresh one");
                        continue;
                    }
                    job.state = JobState::Failed;
                    return Err(ConversionError::worker_lost("worker interrupted twice"));
                }

                Outcome::Failed(EngineError::Fault { kind, message }) => {
                    self.discard(worker);
                    if !retried {
                        retried = true;
                        job.state = JobState::Retrying;
                        log.log_warning(&format!(
                            "critical fault ({kind}), retrying with degraded config"
                        ));
                        config = self.config.degrade.degrade(&config);
                        deadline = self
                            .config
                            .degrade
                            .extend_deadline(deadline)
                            .min(self.config.max_deadline);
                        continue;
                    }
                    job.state = JobState::Failed;
                    log.log_error(&format!("second critical fault ({kind}): {message}"));
                    return Err(ConversionError::critical(
                        kind,
                        format!("{message}; reduce input size or settings"),
                    ));
                }

                Outcome::TimedOut => {
                    self.discard(worker);
                    let large = job.image.megapixels() >= self.config.large_image_mp;
                    if !retried {
                        retried = true;
                        job.state = JobState::Retrying;
                        if large {
                            // A large input blowing its scaled deadline is
                            // treated like a critical fault.
                            log.log_warning("deadline exceeded on large input, degrading config");
                            config = self.config.degrade.degrade(&config);
                        } else {
                            log.log_warning("deadline exceeded, retrying with same config");
                        }
                        deadline = self
                            .config
                            .degrade
                            .extend_deadline(deadline)
                            .min(self.config.max_deadline);
                        continue;
                    }
                    job.state = JobState::Failed;
                    if large {
                        return Err(ConversionError::critical(
                            CriticalFault::ResourceExhausted,
                            format!(
                                "timed out after {deadline:?} on a {:.1} MP input; reduce input size or settings",
                                job.image.megapixels()
                            ),
                        ));
                    }
                    return Err(ConversionError::worker_lost(format!(
                        "timed out after {deadline:?}"
                    )));
                }

                Outcome::ChannelClosed => {
                    self.discard(worker);
                    if !retried {
                        retried = true;
                        job.state = JobState::Retrying;
                        log.log_warning("worker dropped its result channel, retrying");
                        continue;
                    }
                    job.state = JobState::Failed;
                    return Err(ConversionError::worker_lost(
                        "worker dropped its result channel twice",
                    ));
                }
            }
        }
    }

    /// Wait for the attempt's terminal event, forwarding progress and
    /// racing the deadline and the caller's abort signal.
    async fn await_outcome(
        &self,
        job_id: &JobId,
        events: &mut mpsc::UnboundedReceiver<EngineEvent>,
        deadline: Duration,
        ctl: &JobCtl,
    ) -> Outcome {
        let deadline_at = tokio::time::Instant::now() + deadline;

        loop {
            tokio::select! {
                _ = ctl.wait_aborted() => return Outcome::Aborted,
                _ = tokio::time::sleep_until(deadline_at) => return Outcome::TimedOut,
                event = events.recv() => match event {
                    None => return Outcome::ChannelClosed,
                    Some(EngineEvent::Progress(raw)) => self.progress.report(job_id, raw),
                    Some(EngineEvent::Completed(result)) => return Outcome::Completed(result),
                    Some(EngineEvent::Failed(err)) => return Outcome::Failed(err),
                },
            }
        }
    }

    async fn obtain_worker(&self, job: &RunnerJob) -> Result<Lease, ConversionError> {
        if job.intensity.is_high() {
            info!(job_id = %job.id, "escalating to an isolated worker");
            let handle = self.spawn_isolated(&job.id).await?;
            Ok(Lease::Isolated(handle))
        } else {
            let lease = self.pool.acquire().await?;
            debug!(job_id = %job.id, worker = %lease.worker_id, "acquired pooled worker");
            Ok(Lease::Pooled(lease))
        }
    }

    /// Create a dedicated worker outside the shared pool, retrying once.
    async fn spawn_isolated(&self, job_id: &JobId) -> Result<EngineHandle, ConversionError> {
        match self.try_isolated(job_id).await {
            Ok(handle) => Ok(handle),
            Err(first) => {
                warn!(job_id = %job_id, error = %first, "isolated worker creation failed, retrying once");
                self.try_isolated(job_id).await
            }
        }
    }

    async fn try_isolated(&self, job_id: &JobId) -> Result<EngineHandle, ConversionError> {
        let handle = EngineHandle::spawn(format!("isolated-{job_id}"), &self.factory)
            .map_err(|e| ConversionError::busy(format!("isolated worker spawn failed: {e}")))?;
        match handle.init(self.config.pool.init_timeout).await {
            Ok(_) => Ok(handle),
            Err(e) => {
                handle.terminate();
                Err(ConversionError::busy(format!(
                    "isolated worker init failed: {e}"
                )))
            }
        }
    }

    /// Return a healthy worker: pooled ones go back to the pool,
    /// isolated ones are terminated unconditionally.
    fn finish(&self, worker: Lease) {
        match worker {
            Lease::Pooled(lease) => self.pool.release(lease),
            Lease::Isolated(handle) => handle.terminate(),
        }
    }

    /// Drop a faulted worker: pooled ones go to the error set for the
    /// pool to recover, isolated ones are terminated.
    fn discard(&self, worker: Lease) {
        match worker {
            Lease::Pooled(lease) => self.pool.report_error(lease),
            Lease::Isolated(handle) => handle.terminate(),
        }
    }

    /// After a caller abort: signal the worker, wait a short grace for it
    /// to yield, then reclaim or forcibly replace it.
    async fn reclaim_after_abort(
        &self,
        worker: Lease,
        mut events: mpsc::UnboundedReceiver<EngineEvent>,
    ) {
        worker.handle().request_abort();

        let yielded = tokio::time::timeout(self.config.abort_grace, async {
            loop {
                match events.recv().await {
                    None => return false,
                    Some(EngineEvent::Progress(_)) => continue,
                    Some(_) => return true,
                }
            }
        })
        .await;

        match yielded {
            Ok(true) => {
                debug!("worker yielded within the abort grace period");
                self.finish(worker);
            }
            Ok(false) | Err(_) => {
                warn!("worker did not yield after abort; replacing it");
                self.discard(worker);
            }
        }
    }
}
