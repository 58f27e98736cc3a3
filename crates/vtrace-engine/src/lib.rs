//! Conversion engine boundary.
//!
//! This crate hosts the external conversion engine behind a strict
//! message-passing boundary: each execution unit is one OS thread running
//! one engine instance, driven by a command channel and answering over an
//! event channel. No shared mutable state crosses the boundary.

pub mod capabilities;
pub mod engine;
pub mod host;
pub mod protocol;
pub mod stub;

pub use capabilities::EngineCapabilities;
pub use engine::{ConversionEngine, EngineError, EngineFactory, ProgressSink};
pub use host::{EngineHandle, HandleError};
pub use protocol::{EngineEvent, EnginePong, EngineRequest, RawProgress};
pub use stub::{StubBehavior, StubEngine, StubScript};
