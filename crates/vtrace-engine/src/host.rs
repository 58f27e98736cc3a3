//! Execution-unit host.
//!
//! [`EngineHandle`] owns the communication side of one execution unit: an
//! OS thread running a [`ConversionEngine`] behind a command channel.
//! Handles are cheap to clone; terminating any clone closes the command
//! channel and lets the thread drain out. Threads cannot be killed, so a
//! forcible replacement simply abandons the unit and spawns a fresh one.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use vtrace_models::CriticalFault;

use crate::capabilities::EngineCapabilities;
use crate::engine::{ConversionEngine, EngineError, EngineFactory, ProgressSink};
use crate::protocol::{EngineCommand, EngineEvent, EnginePong, EngineRequest};

/// Command channel depth per execution unit.
const COMMAND_CHANNEL_CAPACITY: usize = 8;

pub type HostResult<T> = Result<T, HandleError>;

/// Errors from interacting with an execution unit.
#[derive(Debug, Error)]
pub enum HandleError {
    /// The unit's thread has exited or the handle was terminated.
    #[error("execution unit terminated")]
    Terminated,

    /// The unit did not answer within the allotted time.
    #[error("execution unit did not respond within {0:?}")]
    Timeout(Duration),

    /// The unit's thread could not be spawned.
    #[error("failed to spawn execution unit: {0}")]
    Spawn(String),

    /// The engine itself reported an error.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

struct HandleShared {
    label: String,
    cmd_tx: Mutex<Option<mpsc::Sender<EngineCommand>>>,
    abort: AtomicBool,
    capabilities: Mutex<Option<EngineCapabilities>>,
}

/// Communication handle for one execution unit.
#[derive(Clone)]
pub struct EngineHandle {
    inner: Arc<HandleShared>,
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("label", &self.inner.label)
            .finish_non_exhaustive()
    }
}

impl EngineHandle {
    /// Spawn a fresh execution unit running an engine from `factory`.
    ///
    /// The engine is constructed on the unit's own thread so that heavy
    /// setup never blocks the coordinator.
    pub fn spawn(label: impl Into<String>, factory: &EngineFactory) -> HostResult<Self> {
        let label = label.into();
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);

        let inner = Arc::new(HandleShared {
            label: label.clone(),
            cmd_tx: Mutex::new(Some(cmd_tx)),
            abort: AtomicBool::new(false),
            capabilities: Mutex::new(None),
        });

        let factory = Arc::clone(factory);
        let shared = Arc::clone(&inner);
        std::thread::Builder::new()
            .name(format!("vtrace-engine-{label}"))
            .spawn(move || {
                let engine = (factory)();
                run_unit(engine, cmd_rx, shared);
            })
            .map_err(|e| HandleError::Spawn(e.to_string()))?;

        Ok(Self { inner })
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Run the init handshake, bounded by `timeout`.
    pub async fn init(&self, timeout: Duration) -> HostResult<EngineCapabilities> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineCommand::Init { reply: reply_tx }).await?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Err(_) => Err(HandleError::Timeout(timeout)),
            Ok(Err(_)) => Err(HandleError::Terminated),
            Ok(Ok(Err(e))) => Err(HandleError::Engine(e)),
            Ok(Ok(Ok(caps))) => {
                *self.inner.capabilities.lock().unwrap() = Some(caps);
                Ok(caps)
            }
        }
    }

    /// Capabilities reported at init, if the handshake has completed.
    pub fn capabilities(&self) -> Option<EngineCapabilities> {
        *self.inner.capabilities.lock().unwrap()
    }

    /// Submit a job. Events stream back on the returned channel, ending
    /// with exactly one `Completed` or `Failed` (or channel closure if
    /// the unit dies).
    pub async fn begin(
        &self,
        request: EngineRequest,
    ) -> HostResult<mpsc::UnboundedReceiver<EngineEvent>> {
        self.inner.abort.store(false, Ordering::Relaxed);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.send(EngineCommand::Process {
            request,
            events: events_tx,
        })
        .await?;
        Ok(events_rx)
    }

    /// Health probe. An idle unit answers promptly; a busy or dead unit
    /// lets the timeout fire.
    pub async fn ping(&self, timeout: Duration) -> HostResult<EnginePong> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(EngineCommand::Status { reply: reply_tx }).await?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Err(_) => Err(HandleError::Timeout(timeout)),
            Ok(Err(_)) => Err(HandleError::Terminated),
            Ok(Ok(pong)) => Ok(pong),
        }
    }

    /// Request cooperative cancellation of the in-flight job.
    pub fn request_abort(&self) {
        self.inner.abort.store(true, Ordering::Relaxed);
    }

    /// Close the command channel. The unit finishes its current work and
    /// exits; no further commands are accepted.
    pub fn terminate(&self) {
        if self.inner.cmd_tx.lock().unwrap().take().is_some() {
            debug!(worker = %self.inner.label, "execution unit terminated");
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.cmd_tx.lock().unwrap().is_none()
    }

    async fn send(&self, cmd: EngineCommand) -> HostResult<()> {
        let tx = self
            .inner
            .cmd_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or(HandleError::Terminated)?;
        tx.send(cmd).await.map_err(|_| HandleError::Terminated)
    }
}

/// Command loop for one execution unit. Runs on a dedicated thread until
/// the command channel closes.
fn run_unit(
    mut engine: Box<dyn ConversionEngine>,
    mut commands: mpsc::Receiver<EngineCommand>,
    shared: Arc<HandleShared>,
) {
    let mut jobs_done = 0u64;

    while let Some(cmd) = commands.blocking_recv() {
        match cmd {
            EngineCommand::Init { reply } => {
                let _ = reply.send(engine.init());
            }
            EngineCommand::Status { reply } => {
                let _ = reply.send(EnginePong { jobs_done });
            }
            EngineCommand::Process { request, events } => {
                let started = Instant::now();
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    let mut sink = ProgressSink::new(&events, &shared.abort, started);
                    engine.process(&request, &mut sink)
                }));

                let terminal = match outcome {
                    Ok(Ok(result)) => {
                        jobs_done += 1;
                        EngineEvent::Completed(result)
                    }
                    Ok(Err(err)) => EngineEvent::Failed(err),
                    Err(panic) => {
                        error!(
                            worker = %shared.label,
                            job_id = %request.job_id,
                            "engine panicked during processing"
                        );
                        EngineEvent::Failed(EngineError::fault(
                            CriticalFault::RuntimeTrap,
                            panic_message(&panic),
                        ))
                    }
                };
                let _ = events.send(terminal);
            }
        }
    }

    debug!(worker = %shared.label, jobs_done, "engine thread exiting");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "engine panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::{StubBehavior, StubScript};
    use vtrace_models::{ConversionConfig, ImagePayload, JobId};

    fn request() -> EngineRequest {
        EngineRequest {
            job_id: JobId::new(),
            image: ImagePayload::new(2, 2, vec![0u8; 16]).unwrap(),
            config: ConversionConfig::default(),
        }
    }

    async fn drain_terminal(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> EngineEvent {
        loop {
            match rx.recv().await.expect("event stream closed early") {
                EngineEvent::Progress(_) => continue,
                terminal => return terminal,
            }
        }
    }

    #[tokio::test]
    async fn handshake_reports_capabilities() {
        let script = StubScript::always(StubBehavior::Succeed {
            progress_events: 1,
            duration: Duration::from_millis(1),
        });
        let handle = EngineHandle::spawn("t1", &script.factory()).unwrap();

        let caps = handle.init(Duration::from_secs(1)).await.unwrap();
        assert!(caps.supports_abort);
        assert_eq!(handle.capabilities(), Some(caps));
        assert_eq!(script.init_calls(), 1);
    }

    #[tokio::test]
    async fn process_emits_progress_then_result() {
        let script = StubScript::always(StubBehavior::Succeed {
            progress_events: 3,
            duration: Duration::from_millis(10),
        });
        let handle = EngineHandle::spawn("t2", &script.factory()).unwrap();
        handle.init(Duration::from_secs(1)).await.unwrap();

        let mut rx = handle.begin(request()).await.unwrap();
        let mut progress = 0;
        let terminal = loop {
            match rx.recv().await.unwrap() {
                EngineEvent::Progress(_) => progress += 1,
                terminal => break terminal,
            }
        };

        assert_eq!(progress, 3);
        assert!(matches!(terminal, EngineEvent::Completed(_)));
    }

    #[tokio::test]
    async fn panic_surfaces_as_runtime_trap() {
        let script = StubScript::always(StubBehavior::Panic("boom".into()));
        let handle = EngineHandle::spawn("t3", &script.factory()).unwrap();
        handle.init(Duration::from_secs(1)).await.unwrap();

        let mut rx = handle.begin(request()).await.unwrap();
        match drain_terminal(&mut rx).await {
            EngineEvent::Failed(EngineError::Fault { kind, message }) => {
                assert_eq!(kind, CriticalFault::RuntimeTrap);
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // The unit survives a caught panic and still answers pings.
        assert!(handle.ping(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn abort_flag_stops_a_hanging_engine() {
        let script = StubScript::always(StubBehavior::Hang);
        let handle = EngineHandle::spawn("t4", &script.factory()).unwrap();
        handle.init(Duration::from_secs(1)).await.unwrap();

        let mut rx = handle.begin(request()).await.unwrap();
        handle.request_abort();

        match drain_terminal(&mut rx).await {
            EngineEvent::Failed(EngineError::Aborted) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn terminated_handle_rejects_commands() {
        let script = StubScript::always(StubBehavior::Hang);
        let handle = EngineHandle::spawn("t5", &script.factory()).unwrap();
        handle.terminate();

        assert!(handle.is_terminated());
        assert!(matches!(
            handle.ping(Duration::from_millis(100)).await,
            Err(HandleError::Terminated)
        ));
    }
}
