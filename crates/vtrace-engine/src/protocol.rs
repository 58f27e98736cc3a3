//! Messages exchanged between the coordinator and an execution unit.

use tokio::sync::{mpsc, oneshot};

use vtrace_models::{ConversionConfig, ImagePayload, JobId, ProgressStage, VectorResult};

use crate::capabilities::EngineCapabilities;
use crate::engine::EngineError;

/// One conversion request as handed to an execution unit.
#[derive(Debug, Clone)]
pub struct EngineRequest {
    pub job_id: JobId,
    pub image: ImagePayload,
    pub config: ConversionConfig,
}

/// Raw progress as emitted by the engine, before normalization.
#[derive(Debug, Clone, Copy)]
pub struct RawProgress {
    pub stage: ProgressStage,
    pub percent: u8,
    pub elapsed_ms: u64,
}

/// Reply to a health-check ping.
#[derive(Debug, Clone, Copy)]
pub struct EnginePong {
    /// Jobs completed by this execution unit so far.
    pub jobs_done: u64,
}

/// Commands accepted by an execution unit's host loop.
#[derive(Debug)]
pub enum EngineCommand {
    /// Initialize the engine and report its capabilities.
    Init {
        reply: oneshot::Sender<Result<EngineCapabilities, EngineError>>,
    },
    /// Run one conversion; events stream back on the provided channel,
    /// ending with exactly one `Completed` or `Failed`.
    Process {
        request: EngineRequest,
        events: mpsc::UnboundedSender<EngineEvent>,
    },
    /// Lightweight health probe. A busy or dead unit never replies;
    /// the caller times out instead.
    Status { reply: oneshot::Sender<EnginePong> },
}

/// Events emitted by an execution unit while processing.
#[derive(Debug)]
pub enum EngineEvent {
    Progress(RawProgress),
    Completed(VectorResult),
    Failed(EngineError),
}
