//! Common test utilities and helpers for integration tests.
//!
//! This module provides shared test infrastructure including:
//! - proptest configuration presets
//! - in-memory fakes for every controller collaborator
//! - a context factory that captures what the controller posts
#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use proptest::prelude::*;
use tokio::sync::Notify;
use uuid::Uuid;

use sandbox_bridge::bus::SandboxOutbox;
use sandbox_bridge::playback::FetchRequest;
use sandbox_bridge::protocol::{ExecutionState, HostMessage, Program, TraceEvent};
use sandbox_bridge::sandbox::{
    Collaborators, ContextFactory, ControllerObserver, ExecutionContext, FetchTransport,
    ProgramSource, Result, SandboxError, StandardIo, StdinClosed, TransportError,
    TransportResponse,
};

/// Standard proptest configuration with 100 iterations.
pub fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 100,
        ..ProptestConfig::default()
    }
}

/// Arbitrary text mixing ASCII with 2-, 3- and 4-byte codepoints.
pub fn mixed_text() -> impl Strategy<Value = String> {
    prop::collection::vec(
        prop_oneof![
            "[a-z \n]",
            Just("é".to_string()),
            Just("€".to_string()),
            Just("😀".to_string()),
        ],
        0..64,
    )
    .prop_map(|parts| parts.concat())
}

// ---------------------------------------------------------------------------
// Standard I/O
// ---------------------------------------------------------------------------

/// Serves queued input lines and collects everything written.
/// Reports closed stdin once the queue runs dry.
#[derive(Default)]
pub struct ScriptedIo {
    inputs: Mutex<VecDeque<String>>,
    stdout: Mutex<String>,
    stderr: Mutex<String>,
    stdin_calls: AtomicUsize,
}

impl ScriptedIo {
    pub fn with_inputs<I, S>(inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inputs: Mutex::new(inputs.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn push_input(&self, line: impl Into<String>) {
        self.inputs.lock().unwrap().push_back(line.into());
    }

    pub fn stdout(&self) -> String {
        self.stdout.lock().unwrap().clone()
    }

    pub fn stderr(&self) -> String {
        self.stderr.lock().unwrap().clone()
    }

    pub fn stdin_calls(&self) -> usize {
        self.stdin_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StandardIo for ScriptedIo {
    async fn stdin(&self) -> std::result::Result<String, StdinClosed> {
        self.stdin_calls.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().unwrap().pop_front().ok_or(StdinClosed)
    }

    fn stdout(&self, text: &str) {
        self.stdout.lock().unwrap().push_str(text);
    }

    fn stderr(&self, text: &str) {
        self.stderr.lock().unwrap().push_str(text);
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

/// Answers fetches from a queue and counts every call.
#[derive(Default)]
pub struct FakeTransport {
    responses: Mutex<VecDeque<std::result::Result<TransportResponse, TransportError>>>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl FakeTransport {
    pub fn respond(&self, status: u16, body: impl Into<Vec<u8>>) {
        self.responses.lock().unwrap().push_back(Ok(TransportResponse {
            status,
            reason: if status == 200 { "OK" } else { "Error" }.to_string(),
            headers: BTreeMap::from([("content-type".to_string(), "text/plain".to_string())]),
            body: body.into(),
        }));
    }

    pub fn fail(&self, error: TransportError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl FetchTransport for FakeTransport {
    async fn fetch(
        &self,
        request: &FetchRequest,
    ) -> std::result::Result<TransportResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Network("no scripted response".into())))
    }
}

// ---------------------------------------------------------------------------
// Observer & program source
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingObserver {
    states: Mutex<Vec<ExecutionState>>,
    traces: Mutex<Vec<TraceEvent>>,
    finished_count: AtomicUsize,
    finished: Notify,
}

impl RecordingObserver {
    pub fn states(&self) -> Vec<ExecutionState> {
        self.states.lock().unwrap().clone()
    }

    pub fn traces(&self) -> Vec<TraceEvent> {
        self.traces.lock().unwrap().clone()
    }

    pub fn finished_count(&self) -> usize {
        self.finished_count.load(Ordering::SeqCst)
    }

    /// Wait for the next `finished`, failing the test after five seconds.
    pub async fn wait_finished(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.finished.notified())
            .await
            .expect("program did not finish in time");
    }
}

impl ControllerObserver for RecordingObserver {
    fn on_state_change(&self, state: ExecutionState) {
        self.states.lock().unwrap().push(state);
    }

    fn on_trace(&self, event: TraceEvent) {
        self.traces.lock().unwrap().push(event);
    }

    fn on_finished(&self) {
        self.finished_count.fetch_add(1, Ordering::SeqCst);
        self.finished.notify_one();
    }
}

pub struct StaticProgram(pub Program);

impl ProgramSource for StaticProgram {
    fn current_program(&self) -> Program {
        self.0.clone()
    }
}

// ---------------------------------------------------------------------------
// Capturing context
// ---------------------------------------------------------------------------

/// What one spawned context saw.
#[derive(Clone)]
pub struct ContextRecord {
    pub id: Uuid,
    pub outbox: SandboxOutbox,
    pub posted: Arc<Mutex<Vec<HostMessage>>>,
    pub terminated: Arc<AtomicBool>,
}

impl ContextRecord {
    pub fn posted(&self) -> Vec<HostMessage> {
        self.posted.lock().unwrap().clone()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

struct CapturedContext {
    record: ContextRecord,
}

impl ExecutionContext for CapturedContext {
    fn id(&self) -> Uuid {
        self.record.id
    }

    fn post(&self, message: HostMessage) -> Result<()> {
        if self.record.is_terminated() {
            return Err(SandboxError::Terminated);
        }
        self.record.posted.lock().unwrap().push(message);
        Ok(())
    }

    fn terminate(&mut self) {
        self.record.terminated.store(true, Ordering::SeqCst);
    }
}

/// Context factory that runs nothing and records every post.
#[derive(Default)]
pub struct CapturingFactory {
    contexts: Mutex<Vec<ContextRecord>>,
}

impl CapturingFactory {
    pub fn contexts(&self) -> Vec<ContextRecord> {
        self.contexts.lock().unwrap().clone()
    }

    pub fn latest(&self) -> ContextRecord {
        self.contexts
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no context spawned")
    }
}

impl ContextFactory for CapturingFactory {
    fn spawn(&self, outbox: SandboxOutbox) -> Result<Box<dyn ExecutionContext>> {
        let record = ContextRecord {
            id: Uuid::new_v4(),
            outbox,
            posted: Arc::new(Mutex::new(Vec::new())),
            terminated: Arc::new(AtomicBool::new(false)),
        };
        self.contexts.lock().unwrap().push(record.clone());
        Ok(Box::new(CapturedContext { record }))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Fakes wired into a [`Collaborators`] set, with handles kept for asserts.
pub struct Harness<F: ContextFactory + 'static> {
    pub factory: Arc<F>,
    pub io: Arc<ScriptedIo>,
    pub transport: Arc<FakeTransport>,
    pub observer: Arc<RecordingObserver>,
    pub program: Program,
}

impl<F: ContextFactory + 'static> Harness<F> {
    pub fn new(factory: F, io: ScriptedIo, program: Program) -> Self {
        Self {
            factory: Arc::new(factory),
            io: Arc::new(io),
            transport: Arc::new(FakeTransport::default()),
            observer: Arc::new(RecordingObserver::default()),
            program,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            factory: self.factory.clone(),
            io: self.io.clone(),
            transport: self.transport.clone(),
            observer: self.observer.clone(),
            programs: Arc::new(StaticProgram(self.program.clone())),
        }
    }
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn eventually<C: Fn() -> bool>(check: C, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn empty_program() -> Program {
    Program::new(serde_json::json!({ "steps": [] }))
}
