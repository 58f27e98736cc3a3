//! Scripted stub engine.
//!
//! Test double for the real conversion engine: behaviors are queued on a
//! shared script and consumed across worker instances, so a retried job
//! landing on a fresh worker still follows the script.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vtrace_models::{CriticalFault, ProgressStage, VectorResult};

use crate::capabilities::EngineCapabilities;
use crate::engine::{ConversionEngine, EngineError, EngineFactory, ProgressSink};
use crate::protocol::EngineRequest;

/// One scripted `process()` outcome.
#[derive(Debug, Clone)]
pub enum StubBehavior {
    /// Emit `progress_events` updates spread over `duration`, then succeed.
    Succeed {
        progress_events: u32,
        duration: Duration,
    },
    /// Report invalid parameters.
    Invalid(String),
    /// Report a critical fault.
    Fault(CriticalFault),
    /// Panic inside `process()`.
    Panic(String),
    /// Keep running until an abort is requested.
    Hang,
}

/// Shared behavior script driving every engine a factory produces.
#[derive(Clone)]
pub struct StubScript {
    queued: Arc<Mutex<VecDeque<StubBehavior>>>,
    fallback: StubBehavior,
    capabilities: EngineCapabilities,
    remaining_init_failures: Arc<AtomicUsize>,
    init_calls: Arc<AtomicUsize>,
    process_calls: Arc<AtomicUsize>,
}

impl StubScript {
    /// Every `process()` call uses the same behavior.
    pub fn always(fallback: StubBehavior) -> Self {
        Self {
            queued: Arc::new(Mutex::new(VecDeque::new())),
            fallback,
            capabilities: EngineCapabilities::default(),
            remaining_init_failures: Arc::new(AtomicUsize::new(0)),
            init_calls: Arc::new(AtomicUsize::new(0)),
            process_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Consume `behaviors` in order, then fall back to `fallback`.
    pub fn sequence(
        behaviors: impl IntoIterator<Item = StubBehavior>,
        fallback: StubBehavior,
    ) -> Self {
        let script = Self::always(fallback);
        script
            .queued
            .lock()
            .unwrap()
            .extend(behaviors);
        script
    }

    /// Override the capabilities reported at init.
    pub fn with_capabilities(mut self, capabilities: EngineCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Fail the next `n` init handshakes (creation retry tests).
    pub fn fail_next_inits(self, n: usize) -> Self {
        self.remaining_init_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Queue an additional behavior.
    pub fn push(&self, behavior: StubBehavior) {
        self.queued.lock().unwrap().push_back(behavior);
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn process_calls(&self) -> usize {
        self.process_calls.load(Ordering::SeqCst)
    }

    /// Factory producing engines bound to this script.
    pub fn factory(&self) -> EngineFactory {
        let script = self.clone();
        Arc::new(move || {
            Box::new(StubEngine {
                script: script.clone(),
            }) as Box<dyn ConversionEngine>
        })
    }

    fn next_behavior(&self) -> StubBehavior {
        self.queued
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Engine instance bound to a [`StubScript`].
pub struct StubEngine {
    script: StubScript,
}

impl ConversionEngine for StubEngine {
    fn init(&mut self) -> Result<EngineCapabilities, EngineError> {
        self.script.init_calls.fetch_add(1, Ordering::SeqCst);

        let remaining = &self.script.remaining_init_failures;
        if remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EngineError::fault(
                CriticalFault::ResourceExhausted,
                "scripted init failure",
            ));
        }

        Ok(self.script.capabilities)
    }

    fn process(
        &mut self,
        request: &EngineRequest,
        sink: &mut ProgressSink<'_>,
    ) -> Result<VectorResult, EngineError> {
        self.script.process_calls.fetch_add(1, Ordering::SeqCst);

        match self.script.next_behavior() {
            StubBehavior::Succeed {
                progress_events,
                duration,
            } => {
                let steps = progress_events.max(1);
                let stages = [
                    ProgressStage::Preprocessing,
                    ProgressStage::Tracing,
                    ProgressStage::PathFitting,
                    ProgressStage::SvgEmit,
                ];
                for i in 0..steps {
                    std::thread::sleep(duration / steps);
                    let stage = stages[(i as usize * stages.len() / steps as usize).min(3)];
                    let percent = ((i + 1) * 100 / steps) as u8;
                    if !sink.report(stage, percent) {
                        return Err(EngineError::Aborted);
                    }
                }
                Ok(VectorResult {
                    svg: format!("<svg data-job=\"{}\"/>", request.job_id),
                    path_count: request.config.pass_count as usize,
                    node_count: 16,
                    processing_time_ms: duration.as_millis() as u64,
                })
            }
            StubBehavior::Invalid(msg) => Err(EngineError::invalid(msg)),
            StubBehavior::Fault(kind) => Err(EngineError::fault(kind, "scripted fault")),
            StubBehavior::Panic(msg) => panic!("{msg}"),
            StubBehavior::Hang => loop {
                std::thread::sleep(Duration::from_millis(20));
                if !sink.report(ProgressStage::Tracing, 50) {
                    return Err(EngineError::Aborted);
                }
            },
        }
    }
}
