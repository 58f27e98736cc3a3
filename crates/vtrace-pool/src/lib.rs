//! Bounded worker pool.
//!
//! Owns a set of conversion execution units, tracks each as
//! idle/busy/error, recovers failed units, serves waiters in FIFO order,
//! and resizes on demand. All pool mutations are short synchronous
//! critical sections; no lock is ever held across an await point.

pub mod config;
pub mod error;
pub mod health;
pub mod pool;
pub mod worker;

pub use config::PoolConfig;
pub use error::{PoolError, PoolResult};
pub use health::spawn_health_loop;
pub use pool::{PoolLease, PoolSnapshot, WorkerPool};
pub use worker::{WorkerId, WorkerRecord, WorkerState};
