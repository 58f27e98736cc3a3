//! The conversion engine trait and its error surface.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::mpsc;

use vtrace_models::{CriticalFault, ProgressStage, VectorResult};

use crate::capabilities::EngineCapabilities;
use crate::protocol::{EngineEvent, EngineRequest, RawProgress};

/// Errors an engine may report across the boundary.
///
/// A closed tagged set: the coordinator classifies failures by matching
/// these variants, never by inspecting message text.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// The request's parameters or image are unusable.
    #[error("invalid parameters: {0}")]
    Invalid(String),

    /// The engine observed an abort request and stopped early.
    #[error("processing aborted")]
    Aborted,

    /// Unrecoverable execution fault; the hosting worker must be replaced.
    #[error("critical fault ({kind}): {message}")]
    Fault {
        kind: CriticalFault,
        message: String,
    },
}

impl EngineError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    pub fn fault(kind: CriticalFault, msg: impl Into<String>) -> Self {
        Self::Fault {
            kind,
            message: msg.into(),
        }
    }
}

/// Progress reporter handed to `ConversionEngine::process`.
///
/// `report` returns `false` once an abort has been requested; a
/// cooperative engine checks the return value and stops early.
pub struct ProgressSink<'a> {
    events: &'a mpsc::UnboundedSender<EngineEvent>,
    abort: &'a AtomicBool,
    started: Instant,
}

impl<'a> ProgressSink<'a> {
    pub(crate) fn new(
        events: &'a mpsc::UnboundedSender<EngineEvent>,
        abort: &'a AtomicBool,
        started: Instant,
    ) -> Self {
        Self {
            events,
            abort,
            started,
        }
    }

    /// Emit a progress event. Returns `false` if the job should stop.
    pub fn report(&mut self, stage: ProgressStage, percent: u8) -> bool {
        let _ = self.events.send(EngineEvent::Progress(RawProgress {
            stage,
            percent: percent.min(100),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }));
        !self.aborted()
    }

    /// Whether an abort has been requested for the current job.
    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }
}

/// A conversion engine instance.
///
/// One instance lives inside each execution unit and processes one job
/// at a time. Implementations are synchronous; isolation and scheduling
/// belong to the host, not the engine.
pub trait ConversionEngine: Send + 'static {
    /// Prepare the engine and report its capabilities.
    fn init(&mut self) -> Result<EngineCapabilities, EngineError>;

    /// Convert one image, streaming progress through the sink.
    fn process(
        &mut self,
        request: &EngineRequest,
        sink: &mut ProgressSink<'_>,
    ) -> Result<VectorResult, EngineError>;
}

/// Creates fresh engine instances, one per execution unit.
pub type EngineFactory = Arc<dyn Fn() -> Box<dyn ConversionEngine> + Send + Sync>;
