//! Caller-facing error taxonomy.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type ConversionResult<T> = Result<T, ConversionError>;

/// Unrecoverable execution faults requiring worker replacement.
///
/// A closed set emitted by the engine boundary itself; classification
/// never depends on matching error message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticalFault {
    /// Panic or other unrecoverable runtime trap inside the engine
    RuntimeTrap,
    /// Out-of-bounds access or memory fault
    MemoryViolation,
    /// Host resource exhaustion (memory budget, thread pool)
    ResourceExhausted,
}

impl fmt::Display for CriticalFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CriticalFault::RuntimeTrap => "runtime trap",
            CriticalFault::MemoryViolation => "memory violation",
            CriticalFault::ResourceExhausted => "resource exhaustion",
        };
        f.write_str(name)
    }
}

/// Error surfaced to job submitters.
///
/// `Clone` so that deduplicated submissions sharing one in-flight
/// computation can all receive the same settlement.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConversionError {
    /// Bad input or configuration; never retried.
    #[error("invalid input: {0}")]
    Validation(String),

    /// Worker timed out or dropped its result channel.
    #[error("worker lost: {0}")]
    WorkerLost(String),

    /// Critical execution fault, surfaced after the degraded retry also failed.
    #[error("conversion failed ({fault}): {message}")]
    Critical {
        fault: CriticalFault,
        message: String,
    },

    /// No worker could be allocated within the wait ceiling.
    #[error("system busy: {0}")]
    Busy(String),

    /// The caller cancelled the job.
    #[error("job aborted")]
    Aborted,

    /// The service is shutting down; the job was never dispatched.
    #[error("service shutting down")]
    ShuttingDown,
}

impl ConversionError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn worker_lost(msg: impl Into<String>) -> Self {
        Self::WorkerLost(msg.into())
    }

    pub fn critical(fault: CriticalFault, msg: impl Into<String>) -> Self {
        Self::Critical {
            fault,
            message: msg.into(),
        }
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        Self::Busy(msg.into())
    }

    /// Machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ConversionError::Validation(_) => "validation",
            ConversionError::WorkerLost(_) => "worker_lost",
            ConversionError::Critical { .. } => "critical_fault",
            ConversionError::Busy(_) => "busy",
            ConversionError::Aborted => "aborted",
            ConversionError::ShuttingDown => "shutting_down",
        }
    }

    /// Guidance attached to errors the caller can act on.
    pub fn guidance(&self) -> Option<&'static str> {
        match self {
            ConversionError::Critical { .. } => Some("reduce input size or settings"),
            ConversionError::Busy(_) => Some("retry once the pool has free workers"),
            _ => None,
        }
    }
}
