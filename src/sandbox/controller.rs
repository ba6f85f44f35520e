// Sandbox controller
//
// Owns the lifecycle of one isolated context and services its synchronous
// stdin and fetch calls through the shared buffers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::{ContextFactory, ExecutionContext};
use super::error::{Result, SandboxError, StdinClosed};
use super::host::{ControllerObserver, ProgramSource, StandardIo};
use super::stdin::split_input;
use super::transport::FetchTransport;
use crate::bus::{ContextEvent, MessageBus};
use crate::config::BufferConfig;
use crate::heartbeat::SupervisedSandbox;
use crate::playback::{FetchRequest, PlaybackLog};
use crate::protocol::{
    ExecutionState, HeartbeatReport, HostMessage, Program, SandboxMessage, TraceEvent, TraceKind,
};
use crate::shared::SharedBuffers;

/// Written to stderr by [`SandboxController::stop`].
pub const STOPPED_DIAGNOSTIC: &str = "\r\nProgram Stopped.\r\n";

/// Written to stderr when the liveness monitor forces a restart.
pub const RESTART_DIAGNOSTIC: &str = "\r\nSandbox stopped responding, restarting.\r\n";

/// Everything the controller talks to besides the context itself.
#[derive(Clone)]
pub struct Collaborators {
    pub factory: Arc<dyn ContextFactory>,
    pub io: Arc<dyn StandardIo>,
    pub transport: Arc<dyn FetchTransport>,
    pub observer: Arc<dyn ControllerObserver>,
    pub programs: Arc<dyn ProgramSource>,
}

/// Response bytes that did not fit in the fetch buffer yet.
struct PendingFetch {
    bytes: Vec<u8>,
    offset: usize,
    header_len: usize,
    body_len: usize,
}

struct ControllerState {
    generation: u64,
    context: Option<Box<dyn ExecutionContext>>,
    execution: ExecutionState,
    buffers: Option<SharedBuffers>,
    /// Bumped by every start and teardown; host work started under an older
    /// epoch is discarded when it completes.
    run_epoch: u64,
    leftover_input: Option<String>,
    leftover_fetch: Option<PendingFetch>,
    playback: PlaybackLog,
    /// A program has been handed to a context since the last forced restart.
    /// A context respawned by `stop` keeps it; only `restart` clears it.
    program_delivered: bool,
}

struct Inner {
    buffer_config: BufferConfig,
    parts: Collaborators,
    bus: MessageBus,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<ContextEvent>>>,
    state: Mutex<ControllerState>,
    shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(mut context) = state.context.take() {
            context.terminate();
        }
        if let Some(buffers) = state.buffers.take() {
            buffers.close();
        }
    }
}

/// Host side of the bridge. Cheap to clone; clones share one context.
#[derive(Clone)]
pub struct SandboxController {
    inner: Arc<Inner>,
}

impl SandboxController {
    /// Create the controller and an idle context.
    pub fn new(buffer_config: BufferConfig, parts: Collaborators) -> Result<Self> {
        let mut bus = MessageBus::new();
        let inbound = bus.take_inbound_receiver();
        let controller = Self {
            inner: Arc::new(Inner {
                buffer_config,
                parts,
                bus,
                inbound: Mutex::new(inbound),
                state: Mutex::new(ControllerState {
                    generation: 0,
                    context: None,
                    execution: ExecutionState::Disabled,
                    buffers: None,
                    run_epoch: 0,
                    leftover_input: None,
                    leftover_fetch: None,
                    playback: PlaybackLog::new(),
                    program_delivered: false,
                }),
                shutdown: CancellationToken::new(),
            }),
        };
        {
            let mut state = controller.state();
            controller.initialise_context(&mut state)?;
        }
        Ok(controller)
    }

    fn state(&self) -> MutexGuard<'_, ControllerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn initialise_context(&self, state: &mut ControllerState) -> Result<()> {
        if state.context.is_some() {
            return Ok(());
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(SandboxError::NoContext);
        }
        state.generation += 1;
        let context = self
            .inner
            .parts
            .factory
            .spawn(self.inner.bus.outbox(state.generation))?;
        info!(
            context_id = %context.id(),
            generation = state.generation,
            "Sandbox context created"
        );
        state.context = Some(context);
        Ok(())
    }

    fn post(state: &ControllerState, message: HostMessage) -> Result<()> {
        let context = state.context.as_ref().ok_or(SandboxError::NoContext)?;
        debug!(kind = message.kind(), generation = state.generation, "Posting to sandbox");
        context.post(message)
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Real run: fresh buffers, empty playback, then `run`.
    pub fn start(&self, program: Program) -> Result<()> {
        let mut state = self.state();
        self.initialise_context(&mut state)?;

        if let Some(previous) = state.buffers.take() {
            previous.close();
        }
        let buffers = SharedBuffers::allocate(
            self.inner.buffer_config.stdin_cells,
            self.inner.buffer_config.fetch_bytes,
        );
        state.run_epoch += 1;
        state.playback = PlaybackLog::new();
        state.leftover_input = None;
        state.leftover_fetch = None;
        state.buffers = Some(buffers.clone());

        info!(epoch = state.run_epoch, "Starting real run");
        Self::post(&state, HostMessage::Run { program, buffers })?;
        state.program_delivered = true;
        Ok(())
    }

    /// Replay run against the I/O recorded by the last real run.
    pub fn replay(&self, program: Program) -> Result<()> {
        let mut state = self.state();
        let playback = Arc::new(state.playback.clone());
        debug!(
            inputs = playback.inputs().len(),
            requests = playback.request_count(),
            "Starting replay run"
        );
        Self::post(&state, HostMessage::Rerun { program, playback })?;
        state.program_delivered = true;
        Ok(())
    }

    /// Ask the context to preload a dependency.
    pub fn load_module(&self, name: &str) -> Result<()> {
        let state = self.state();
        Self::post(
            &state,
            HostMessage::LoadModule {
                name: name.to_string(),
            },
        )
    }

    pub fn send_heartbeat(&self) -> Result<()> {
        let state = self.state();
        Self::post(&state, HostMessage::Heartbeat)
    }

    /// Unconditionally tear down the context and bring up an idle one.
    ///
    /// The replacement is not reported as awaiting a program, so a running
    /// liveness monitor does not start a new real run on its own.
    pub fn stop(&self) -> Result<()> {
        self.teardown(STOPPED_DIAGNOSTIC)
    }

    /// Forced restart after the context stopped answering heartbeats. The
    /// replacement asks for its program again.
    pub fn restart(&self) -> Result<()> {
        warn!("Restarting unresponsive sandbox");
        self.state().program_delivered = false;
        self.teardown(RESTART_DIAGNOSTIC)
    }

    /// Stop serving and release the context. Further posts fail with
    /// [`SandboxError::NoContext`].
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut state = self.state();
        if let Some(mut context) = state.context.take() {
            info!(context_id = %context.id(), "Shutting down sandbox context");
            context.terminate();
        }
        if let Some(buffers) = state.buffers.take() {
            buffers.close();
        }
        state.run_epoch += 1;
    }

    fn teardown(&self, diagnostic: &str) -> Result<()> {
        self.inner.parts.io.stderr(diagnostic);
        self.state().execution = ExecutionState::Disabled;
        self.inner
            .parts
            .observer
            .on_state_change(ExecutionState::Disabled);

        let mut state = self.state();
        if let Some(mut context) = state.context.take() {
            info!(context_id = %context.id(), generation = state.generation, "Terminating sandbox context");
            context.terminate();
        }
        if let Some(buffers) = state.buffers.take() {
            buffers.close();
        }
        state.run_epoch += 1;
        state.leftover_input = None;
        state.leftover_fetch = None;

        self.initialise_context(&mut state)
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    pub fn execution_state(&self) -> ExecutionState {
        self.state().execution
    }

    /// Generation of the current context; increments with every respawn.
    pub fn generation(&self) -> u64 {
        self.state().generation
    }

    /// Copy of the I/O recorded so far.
    pub fn playback(&self) -> PlaybackLog {
        self.state().playback.clone()
    }

    /// Replace the recorded I/O, e.g. with a log saved by an earlier session.
    /// The next real run clears it again.
    pub fn load_playback(&self, playback: PlaybackLog) {
        self.state().playback = playback;
    }

    /// Buffers handed out with the current real run, if any.
    pub fn shared_buffers(&self) -> Option<SharedBuffers> {
        self.state().buffers.clone()
    }

    pub fn subscribe_heartbeats(&self) -> broadcast::Receiver<HeartbeatReport> {
        self.inner.bus.subscribe_heartbeats()
    }

    fn set_execution(&self, next: ExecutionState) {
        let changed = {
            let mut state = self.state();
            let changed = state.execution != next;
            state.execution = next;
            changed
        };
        if changed {
            debug!(state = ?next, "Execution state changed");
            self.inner.parts.observer.on_state_change(next);
        }
    }

    // ---------------------------------------------------------------------
    // Inbound traffic
    // ---------------------------------------------------------------------

    /// Pump inbound messages until [`shutdown`](Self::shutdown) or until the
    /// last other handle is dropped. Stdin and fetch requests are serviced on
    /// their own tasks so the pump never waits.
    pub async fn serve(self) {
        let receiver = self
            .inner
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut receiver) = receiver else {
            warn!("Controller is already being served");
            return;
        };

        let shutdown = self.inner.shutdown.clone();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        drop(self);

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = receiver.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let this = SandboxController { inner };
            if event.generation != this.generation() {
                debug!(
                    generation = event.generation,
                    kind = event.message.kind(),
                    "Dropping message from retired context"
                );
                continue;
            }
            match event.message {
                message @ (SandboxMessage::Stdin | SandboxMessage::Fetch(_)) => {
                    tokio::spawn(async move { this.handle_message(message).await });
                }
                message => this.handle_message(message).await,
            }
        }
        debug!("Controller pump stopped");
    }

    /// Handle one message from the current context.
    pub async fn handle_message(&self, message: SandboxMessage) {
        match message {
            SandboxMessage::Ready => self.set_execution(ExecutionState::Ready),
            SandboxMessage::Heartbeat(mut report) => {
                if report.awaiting_program && self.state().program_delivered {
                    debug!("Idle context after stop; not requesting the program again");
                    report.awaiting_program = false;
                }
                self.set_execution(report.state);
                self.inner.bus.publish_heartbeat(report);
            }
            SandboxMessage::Stdin => self.provide_stdin().await,
            SandboxMessage::InputValue { value } => {
                debug!(len = value.len(), "Sandbox consumed input value");
            }
            SandboxMessage::Fetch(request) => self.handle_fetch(request).await,
            SandboxMessage::ContinueFetch => self.continue_fetch(),
            SandboxMessage::Stdout { stdout } => self.inner.parts.io.stdout(&stdout),
            SandboxMessage::Stderr { stderr } => self.inner.parts.io.stderr(&stderr),
            SandboxMessage::RuntimeCapture { payload } => self.forward_trace(TraceKind::RuntimeCapture, payload),
            SandboxMessage::ModuleInfo { payload } => self.forward_trace(TraceKind::ModuleInfo, payload),
            SandboxMessage::Finished => {
                self.set_execution(ExecutionState::Ready);
                self.inner.parts.observer.on_finished();
            }
            SandboxMessage::Unrecognised => {
                warn!("Unrecognised message from sandbox");
            }
        }
    }

    fn forward_trace(&self, kind: TraceKind, payload: serde_json::Value) {
        self.inner.parts.observer.on_trace(TraceEvent {
            kind,
            payload,
            received_at: Utc::now(),
        });
    }

    // ---------------------------------------------------------------------
    // stdin bridge
    // ---------------------------------------------------------------------

    async fn provide_stdin(&self) {
        let (epoch, buffers, leftover) = {
            let mut state = self.state();
            (state.run_epoch, state.buffers.clone(), state.leftover_input.take())
        };
        let Some(buffers) = buffers else {
            warn!("stdin requested without shared buffers");
            return;
        };

        let (value, fresh) = match leftover {
            Some(rest) => (rest, false),
            None => match self.inner.parts.io.stdin().await {
                Ok(value) => (value, true),
                Err(StdinClosed) => {
                    warn!("Standard input closed, stopping sandbox");
                    if self.state().run_epoch == epoch {
                        if let Err(e) = self.stop() {
                            error!("Failed to stop sandbox: {}", e);
                        }
                    }
                    return;
                }
            },
        };

        let chunk = split_input(&value, buffers.stdin.max_payload());
        {
            let mut state = self.state();
            if state.run_epoch != epoch {
                debug!("Discarding input for an abandoned run");
                return;
            }
            state.leftover_input = chunk.remainder;
            if fresh {
                state.playback.record_input(value);
            }
        }

        match buffers.stdin.deliver(&chunk.bytes) {
            Ok(cursor) => debug!(bytes = chunk.bytes.len(), cursor, "Delivered input"),
            Err(e) => warn!("Failed to deliver input: {}", e),
        }
    }

    // ---------------------------------------------------------------------
    // fetch bridge
    // ---------------------------------------------------------------------

    async fn handle_fetch(&self, request: FetchRequest) {
        let (epoch, buffers) = {
            let state = self.state();
            (state.run_epoch, state.buffers.clone())
        };

        let record = match self.inner.parts.transport.fetch(&request).await {
            Ok(response) => response.into_record(),
            Err(e) => {
                warn!(url = %request.url, "Fetch failed: {}", e);
                e.into_record()
            }
        };
        let header = match record.header_block() {
            Ok(header) => header,
            Err(e) => {
                error!("Failed to encode response header: {}", e);
                return;
            }
        };
        let header_len = header.len();
        let body_len = record.body.len();
        let mut bytes = header;
        bytes.extend_from_slice(&record.body);

        let first = {
            let mut state = self.state();
            if state.run_epoch != epoch {
                debug!(url = %request.url, "Discarding response for an abandoned run");
                return;
            }
            state.playback.record_response(&request, record);

            let Some(buffers) = buffers.as_ref() else {
                warn!("fetch requested without shared buffers");
                return;
            };
            let capacity = buffers.fetch.capacity();
            if bytes.len() > capacity {
                let first = bytes[..capacity].to_vec();
                state.leftover_fetch = Some(PendingFetch {
                    bytes,
                    offset: capacity,
                    header_len,
                    body_len,
                });
                first
            } else {
                bytes
            }
        };

        if let Some(buffers) = buffers {
            match buffers.fetch.publish(&first, header_len, body_len) {
                Ok(()) => debug!(
                    url = %request.url,
                    header_len,
                    body_len,
                    sent = first.len(),
                    "Published fetch response"
                ),
                Err(e) => warn!("Failed to publish fetch response: {}", e),
            }
        }
    }

    fn continue_fetch(&self) {
        let (buffers, slice, header_len, body_len) = {
            let mut state = self.state();
            let Some(buffers) = state.buffers.clone() else {
                warn!("continueFetch without shared buffers");
                return;
            };
            let Some(pending) = state.leftover_fetch.as_mut() else {
                warn!("continueFetch with nothing staged");
                return;
            };
            let end = (pending.offset + buffers.fetch.capacity()).min(pending.bytes.len());
            let slice = pending.bytes[pending.offset..end].to_vec();
            pending.offset = end;
            let lens = (pending.header_len, pending.body_len);
            if end == pending.bytes.len() {
                state.leftover_fetch = None;
            }
            (buffers, slice, lens.0, lens.1)
        };

        if let Err(e) = buffers.fetch.publish(&slice, header_len, body_len) {
            warn!("Failed to publish fetch continuation: {}", e);
        }
    }
}

#[async_trait]
impl SupervisedSandbox for SandboxController {
    async fn send_probe(&self) {
        if let Err(e) = self.send_heartbeat() {
            warn!("Failed to send heartbeat probe: {}", e);
        }
    }

    async fn push_program(&self, initial: bool) {
        let program = self.inner.parts.programs.current_program();
        let result = if initial {
            self.start(program)
        } else {
            self.replay(program)
        };
        if let Err(e) = result {
            warn!(initial, "Failed to push program: {}", e);
        }
    }

    async fn restart(&self) {
        if let Err(e) = SandboxController::restart(self) {
            error!("Sandbox restart failed: {}", e);
        }
    }
}
