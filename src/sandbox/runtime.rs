// In-process reference context
//
// Each context owns two OS threads. The dispatcher drains host messages and
// answers heartbeats itself, so probes are served even while user code is
// blocked on stdin or fetch. The executor runs one program at a time.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::context::{ContextFactory, ExecutionContext};
use super::error::{Result, SandboxError};
use super::script::{execute, LiveIo, ReplayIo, SandboxIo, Script};
use crate::bus::{context_channel, SandboxOutbox};
use crate::playback::{PlaybackLog, ReplayCursor};
use crate::protocol::{ExecutionState, HeartbeatReport, HostMessage, Program, SandboxMessage};
use crate::shared::SharedBuffers;

/// Spawns [`ThreadContext`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadContextFactory;

impl ContextFactory for ThreadContextFactory {
    fn spawn(&self, outbox: SandboxOutbox) -> Result<Box<dyn ExecutionContext>> {
        let id = Uuid::new_v4();
        let (tx, rx) = context_channel();
        let flags = Arc::new(Flags::default());

        let dispatcher_flags = flags.clone();
        thread::Builder::new()
            .name(format!("sandbox-{}", &id.simple().to_string()[..8]))
            .spawn(move || dispatch(rx, outbox, dispatcher_flags))
            .map_err(|e| SandboxError::ContextCreation(e.to_string()))?;

        Ok(Box::new(ThreadContext {
            id,
            tx: Some(tx),
            flags,
        }))
    }
}

#[derive(Default)]
struct Flags {
    cancelled: AtomicBool,
    running: AtomicBool,
    has_program: AtomicBool,
}

pub struct ThreadContext {
    id: Uuid,
    tx: Option<mpsc::UnboundedSender<HostMessage>>,
    flags: Arc<Flags>,
}

impl ExecutionContext for ThreadContext {
    fn id(&self) -> Uuid {
        self.id
    }

    fn post(&self, message: HostMessage) -> Result<()> {
        let tx = self.tx.as_ref().ok_or(SandboxError::Terminated)?;
        tx.send(message).map_err(|_| SandboxError::Terminated)
    }

    fn terminate(&mut self) {
        // Threads are not joined: a program stuck in a busy step is
        // abandoned and exits at its next cancellation check.
        self.flags.cancelled.store(true, Ordering::SeqCst);
        if self.tx.take().is_some() {
            debug!(context_id = %self.id, "Context terminated");
        }
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        self.terminate();
    }
}

enum Job {
    Live {
        program: Program,
        buffers: SharedBuffers,
    },
    Replay {
        program: Program,
        playback: Arc<PlaybackLog>,
    },
}

fn dispatch(
    mut inbox: mpsc::UnboundedReceiver<HostMessage>,
    outbox: SandboxOutbox,
    flags: Arc<Flags>,
) {
    let (job_tx, job_rx) = std_mpsc::channel::<Job>();
    let executor_outbox = outbox.clone();
    let executor_flags = flags.clone();
    if let Err(e) = thread::Builder::new()
        .name(format!("sandbox-exec-{}", outbox.generation()))
        .spawn(move || run_jobs(job_rx, executor_outbox, executor_flags))
    {
        warn!("Failed to spawn executor thread: {}", e);
        return;
    }

    if outbox.send(SandboxMessage::Ready).is_err() {
        return;
    }

    let mut active: Option<SharedBuffers> = None;
    let mut modules = BTreeSet::new();

    while let Some(message) = inbox.blocking_recv() {
        let delivered = match message {
            HostMessage::Heartbeat => {
                let state = if flags.running.load(Ordering::SeqCst) {
                    ExecutionState::Running
                } else {
                    ExecutionState::Ready
                };
                outbox
                    .send(SandboxMessage::Heartbeat(HeartbeatReport {
                        state,
                        awaiting_program: !flags.has_program.load(Ordering::SeqCst),
                    }))
                    .is_ok()
            }
            HostMessage::LoadModule { name } => {
                let fresh = modules.insert(name.clone());
                outbox
                    .send(SandboxMessage::ModuleInfo {
                        payload: json!({
                            "module": name,
                            "status": if fresh { "loaded" } else { "cached" },
                        }),
                    })
                    .is_ok()
            }
            HostMessage::Run { program, buffers } => {
                flags.has_program.store(true, Ordering::SeqCst);
                active = Some(buffers.clone());
                job_tx.send(Job::Live { program, buffers }).is_ok()
            }
            HostMessage::Rerun { program, playback } => {
                flags.has_program.store(true, Ordering::SeqCst);
                job_tx.send(Job::Replay { program, playback }).is_ok()
            }
        };
        if !delivered {
            break;
        }
    }

    // Host side is gone: wake anything blocked on the buffers.
    flags.cancelled.store(true, Ordering::SeqCst);
    if let Some(buffers) = active {
        buffers.close();
    }
    debug!(generation = outbox.generation(), "Dispatcher exiting");
}

fn run_jobs(jobs: std_mpsc::Receiver<Job>, outbox: SandboxOutbox, flags: Arc<Flags>) {
    for job in jobs {
        if flags.cancelled.load(Ordering::SeqCst) {
            break;
        }
        flags.running.store(true, Ordering::SeqCst);
        let outcome = run_job(job, &outbox, &flags.cancelled);
        flags.running.store(false, Ordering::SeqCst);

        match outcome {
            Ok(()) => {}
            // Buffers were closed under us by a new run or a teardown; that
            // run reports for itself.
            Err(SandboxError::Terminated) => {
                debug!(generation = outbox.generation(), "Run abandoned");
                continue;
            }
            Err(e) => {
                let _ = outbox.send(SandboxMessage::Stderr {
                    stderr: format!("{}\n", e),
                });
            }
        }
        if outbox.send(SandboxMessage::Finished).is_err() {
            break;
        }
    }
}

fn run_job(job: Job, outbox: &SandboxOutbox, cancelled: &AtomicBool) -> Result<()> {
    let (program, mut io): (Program, Box<dyn SandboxIo>) = match job {
        Job::Live { program, buffers } => {
            info!(generation = outbox.generation(), "Executing program");
            (program, Box::new(LiveIo::new(outbox.clone(), buffers)))
        }
        Job::Replay { program, playback } => {
            debug!(generation = outbox.generation(), "Replaying program");
            (program, Box::new(ReplayIo::new(ReplayCursor::new(playback))))
        }
    };
    let script = Script::from_program(&program)?;
    execute(&script, io.as_mut(), outbox, cancelled)
}
