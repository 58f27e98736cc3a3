//! The worker pool.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use vtrace_engine::{EngineFactory, EngineHandle};

use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::worker::{WorkerId, WorkerRecord, WorkerState};

/// Derived view of pool membership; computed on demand, never stored.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolSnapshot {
    pub total_workers: usize,
    pub idle: usize,
    pub busy: usize,
    pub error: usize,
    pub total_processed: u64,
}

/// Exclusive lease on one execution unit for the duration of one job.
///
/// The pool retains ownership of the record; the lease must be returned
/// via [`WorkerPool::release`] or [`WorkerPool::report_error`] before the
/// job settles.
#[derive(Debug)]
pub struct PoolLease {
    pub worker_id: WorkerId,
    pub handle: EngineHandle,
}

struct PoolInner {
    idle: VecDeque<WorkerRecord>,
    busy: HashMap<WorkerId, WorkerRecord>,
    errored: Vec<WorkerRecord>,
    waiters: VecDeque<oneshot::Sender<PoolLease>>,
}

impl PoolInner {
    fn live_total(&self) -> usize {
        self.idle.len() + self.busy.len()
    }

    fn total(&self) -> usize {
        self.live_total() + self.errored.len()
    }
}

/// Bounded pool of conversion execution units.
pub struct WorkerPool {
    factory: EngineFactory,
    config: PoolConfig,
    inner: Mutex<PoolInner>,
    target: AtomicUsize,
    retired_processed: AtomicU64,
    closed: AtomicBool,
}

impl WorkerPool {
    /// Create `config.max_workers` workers in parallel.
    ///
    /// Each slot retries its creation once. Fewer workers than requested
    /// is a degraded start; zero workers is fatal.
    pub async fn initialize(factory: EngineFactory, config: PoolConfig) -> PoolResult<Arc<Self>> {
        let requested = config.max_workers;
        let pool = Arc::new(Self {
            factory,
            target: AtomicUsize::new(requested),
            config,
            inner: Mutex::new(PoolInner {
                idle: VecDeque::new(),
                busy: HashMap::new(),
                errored: Vec::new(),
                waiters: VecDeque::new(),
            }),
            retired_processed: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let spawns = (0..requested).map(|_| pool.create_worker());
        let results = futures::future::join_all(spawns).await;

        let mut created = 0usize;
        {
            let mut inner = pool.inner.lock().unwrap();
            for result in results {
                match result {
                    Ok(record) => {
                        inner.idle.push_back(record);
                        created += 1;
                    }
                    Err(e) => warn!(error = %e, "worker slot failed to start"),
                }
            }
        }

        if created == 0 {
            return Err(PoolError::InitFailed(format!(
                "none of the {requested} requested workers could be created"
            )));
        }
        if created < requested {
            warn!(requested, created, "worker pool started with degraded capacity");
        }
        info!(workers = created, "worker pool initialized");
        Ok(pool)
    }

    /// Acquire an idle worker, recovering an errored one if necessary,
    /// else waiting FIFO up to the wait ceiling.
    pub async fn acquire(&self) -> PoolResult<PoolLease> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::ShuttingDown);
        }

        // Fast path plus one recovery attempt per errored worker taken.
        for _ in 0..2 {
            let dead = {
                let mut inner = self.inner.lock().unwrap();
                if let Some(lease) = Self::lease_idle(&mut inner) {
                    return Ok(lease);
                }
                inner.errored.pop()
            };

            let Some(dead) = dead else { break };

            debug!(worker = %dead.id, "recovering errored worker");
            self.retire(dead);
            match self.create_worker().await {
                Ok(record) => {
                    let mut inner = self.inner.lock().unwrap();
                    inner.idle.push_back(record);
                    if let Some(lease) = Self::lease_idle(&mut inner) {
                        return Ok(lease);
                    }
                }
                Err(e) => warn!(error = %e, "worker recovery failed"),
            }
        }

        // Park on the wait-list; a released worker is handed over directly.
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().unwrap();
            if self.closed.load(Ordering::SeqCst) {
                return Err(PoolError::ShuttingDown);
            }
            inner.waiters.push_back(tx);
        }

        match tokio::time::timeout(self.config.wait_ceiling, rx).await {
            Ok(Ok(lease)) => Ok(lease),
            Ok(Err(_)) => Err(PoolError::ShuttingDown),
            Err(_) => Err(PoolError::Unavailable(self.config.wait_ceiling)),
        }
    }

    /// Return a healthy worker. Hands it directly to the oldest waiter if
    /// one is parked; the worker never transits the idle set in that case.
    pub fn release(&self, lease: PoolLease) {
        let mut inner = self.inner.lock().unwrap();
        // Resized-away or shut-down workers are simply dropped.
        let Some(mut record) = inner.busy.remove(&lease.worker_id) else {
            return;
        };

        record.processed_count += 1;
        record.last_used = Instant::now();

        while let Some(waiter) = inner.waiters.pop_front() {
            let handoff = PoolLease {
                worker_id: record.id.clone(),
                handle: record.handle.clone(),
            };
            if waiter.send(handoff).is_ok() {
                record.state = WorkerState::Busy;
                inner.busy.insert(record.id.clone(), record);
                return;
            }
            // Waiter timed out or dropped; try the next one.
        }

        record.state = WorkerState::Idle;
        inner.idle.push_back(record);
    }

    /// Move a worker to the error set after a critical fault. Recovery is
    /// lazy (next acquire) or periodic (health sweep).
    pub fn report_error(&self, lease: PoolLease) {
        let mut inner = self.inner.lock().unwrap();
        let Some(mut record) = inner.busy.remove(&lease.worker_id) else {
            return;
        };
        warn!(worker = %record.id, "worker moved to error set");
        record.state = WorkerState::Error;
        inner.errored.push(record);
    }

    /// Grow or shrink the pool to `n` workers.
    ///
    /// Shrinking terminates idle workers first, then errored ones, and
    /// only then busy ones (with a warning, since their in-flight jobs
    /// are interrupted cooperatively).
    pub async fn resize(&self, n: usize) {
        self.target.store(n, Ordering::SeqCst);

        let (deficit, victims) = {
            let mut inner = self.inner.lock().unwrap();
            let total = inner.total();
            if total < n {
                (n - total, Vec::new())
            } else {
                let mut excess = total - n;
                let mut victims = Vec::new();

                while excess > 0 {
                    match inner.idle.pop_front() {
                        Some(record) => {
                            victims.push(record);
                            excess -= 1;
                        }
                        None => break,
                    }
                }
                while excess > 0 {
                    match inner.errored.pop() {
                        Some(record) => {
                            victims.push(record);
                            excess -= 1;
                        }
                        None => break,
                    }
                }
                if excess > 0 {
                    warn!(count = excess, "shrinking pool interrupts busy workers");
                    let doomed: Vec<WorkerId> =
                        inner.busy.keys().take(excess).cloned().collect();
                    for id in doomed {
                        if let Some(record) = inner.busy.remove(&id) {
                            record.handle.request_abort();
                            victims.push(record);
                        }
                    }
                }
                (0, victims)
            }
        };

        for victim in victims {
            self.retire(victim);
        }

        for _ in 0..deficit {
            match self.create_worker().await {
                Ok(record) => self.admit(record),
                Err(e) => warn!(error = %e, "worker creation failed during resize"),
            }
        }

        info!(target = n, "pool resized");
    }

    /// One health sweep: ping idle workers, move non-responders to the
    /// error set, then replace errored workers while below target.
    pub async fn health_check(&self) {
        let targets: Vec<(WorkerId, EngineHandle)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .idle
                .iter()
                .map(|r| (r.id.clone(), r.handle.clone()))
                .collect()
        };

        for (id, handle) in targets {
            if handle.ping(self.config.ping_timeout).await.is_err() {
                warn!(worker = %id, "idle worker failed health check");
                let mut inner = self.inner.lock().unwrap();
                if let Some(pos) = inner.idle.iter().position(|r| r.id == id) {
                    let mut record = inner.idle.remove(pos).expect("position just found");
                    record.state = WorkerState::Error;
                    inner.errored.push(record);
                }
            }
        }

        // Replace errored workers until live capacity reaches the target.
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }
            let dead = {
                let mut inner = self.inner.lock().unwrap();
                if inner.live_total() >= self.target.load(Ordering::SeqCst) {
                    return;
                }
                inner.errored.pop()
            };
            if let Some(dead) = dead {
                self.retire(dead);
            }
            match self.create_worker().await {
                Ok(record) => self.admit(record),
                Err(e) => {
                    warn!(error = %e, "worker replacement failed during health sweep");
                    return;
                }
            }
        }
    }

    /// Counts derived from the membership sets.
    pub fn snapshot(&self) -> PoolSnapshot {
        let inner = self.inner.lock().unwrap();
        let processed: u64 = inner
            .idle
            .iter()
            .chain(inner.busy.values())
            .chain(inner.errored.iter())
            .map(|r| r.processed_count)
            .sum();

        PoolSnapshot {
            total_workers: inner.total(),
            idle: inner.idle.len(),
            busy: inner.busy.len(),
            error: inner.errored.len(),
            total_processed: processed + self.retired_processed.load(Ordering::SeqCst),
        }
    }

    /// Terminate every worker and fail parked waiters.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let victims = {
            let mut inner = self.inner.lock().unwrap();
            inner.waiters.clear();
            let mut victims: Vec<WorkerRecord> = inner.idle.drain(..).collect();
            victims.extend(inner.errored.drain(..));
            let ids: Vec<WorkerId> = inner.busy.keys().cloned().collect();
            for id in ids {
                if let Some(record) = inner.busy.remove(&id) {
                    record.handle.request_abort();
                    victims.push(record);
                }
            }
            victims
        };

        for victim in victims {
            self.retire(victim);
        }
        info!("worker pool shut down");
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    // ---- private helpers ----

    fn lease_idle(inner: &mut PoolInner) -> Option<PoolLease> {
        let mut record = inner.idle.pop_front()?;
        record.state = WorkerState::Busy;
        record.last_used = Instant::now();
        let lease = PoolLease {
            worker_id: record.id.clone(),
            handle: record.handle.clone(),
        };
        inner.busy.insert(record.id.clone(), record);
        Some(lease)
    }

    /// Add a fresh worker, preferring a parked waiter over the idle set.
    fn admit(&self, mut record: WorkerRecord) {
        let mut inner = self.inner.lock().unwrap();
        while let Some(waiter) = inner.waiters.pop_front() {
            let handoff = PoolLease {
                worker_id: record.id.clone(),
                handle: record.handle.clone(),
            };
            if waiter.send(handoff).is_ok() {
                record.state = WorkerState::Busy;
                record.last_used = Instant::now();
                inner.busy.insert(record.id.clone(), record);
                return;
            }
        }
        record.state = WorkerState::Idle;
        inner.idle.push_back(record);
    }

    /// Terminate a worker and fold its job count into the retired total.
    fn retire(&self, record: WorkerRecord) {
        record.handle.terminate();
        self.retired_processed
            .fetch_add(record.processed_count, Ordering::SeqCst);
    }

    /// Spawn and handshake one worker, retrying once on failure.
    async fn create_worker(&self) -> PoolResult<WorkerRecord> {
        match self.try_create().await {
            Ok(record) => Ok(record),
            Err(first) => {
                warn!(error = %first, "worker creation failed, retrying once");
                self.try_create().await
            }
        }
    }

    async fn try_create(&self) -> PoolResult<WorkerRecord> {
        let id = WorkerId::new();
        let handle =
            EngineHandle::spawn(id.to_string(), &self.factory).map_err(PoolError::creation)?;
        match handle.init(self.config.init_timeout).await {
            Ok(_) => {
                debug!(worker = %id, "worker ready");
                Ok(WorkerRecord::new(id, handle))
            }
            Err(e) => {
                handle.terminate();
                Err(PoolError::creation(e))
            }
        }
    }
}
