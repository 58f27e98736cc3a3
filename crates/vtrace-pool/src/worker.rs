//! Worker records.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use vtrace_engine::EngineHandle;

/// Unique identifier for a pooled execution unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pool-visible state of one execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Busy,
    Error,
}

/// Bookkeeping for one execution unit.
///
/// A record lives in exactly one of the pool's membership collections
/// (idle / busy / errored) matching its `state` at all times.
pub struct WorkerRecord {
    pub id: WorkerId,
    pub handle: EngineHandle,
    pub state: WorkerState,
    pub last_used: Instant,
    pub processed_count: u64,
}

impl WorkerRecord {
    pub fn new(id: WorkerId, handle: EngineHandle) -> Self {
        Self {
            id,
            handle,
            state: WorkerState::Idle,
            last_used: Instant::now(),
            processed_count: 0,
        }
    }
}
