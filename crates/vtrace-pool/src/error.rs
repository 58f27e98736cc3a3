//! Pool error types.

use std::time::Duration;
use thiserror::Error;

pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Debug, Error)]
pub enum PoolError {
    /// No worker became free within the wait ceiling.
    #[error("no worker available within {0:?}")]
    Unavailable(Duration),

    /// The pool could not create a single worker at startup.
    #[error("worker pool initialization failed: {0}")]
    InitFailed(String),

    /// A single worker could not be created.
    #[error("worker creation failed: {0}")]
    Creation(String),

    /// The pool has been shut down.
    #[error("worker pool is shutting down")]
    ShuttingDown,
}

impl PoolError {
    pub fn creation(err: impl std::fmt::Display) -> Self {
        Self::Creation(err.to_string())
    }
}

impl From<PoolError> for vtrace_models::ConversionError {
    fn from(err: PoolError) -> Self {
        use vtrace_models::ConversionError;
        match err {
            PoolError::Unavailable(ceiling) => {
                ConversionError::busy(format!("no worker available within {ceiling:?}"))
            }
            PoolError::ShuttingDown => ConversionError::ShuttingDown,
            PoolError::InitFailed(msg) | PoolError::Creation(msg) => {
                ConversionError::busy(format!("worker allocation failed: {msg}"))
            }
        }
    }
}
