//! Run command - execute one program against this terminal.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tracing::{info, warn};

use super::terminal::TerminalIo;
use crate::config;
use crate::heartbeat::LivenessMonitor;
use crate::logging;
use crate::playback::PlaybackLog;
use crate::protocol::{ExecutionState, Program, TraceEvent};
use crate::sandbox::{
    Collaborators, ControllerObserver, ProgramSource, ReqwestTransport, SandboxController,
    StandardIo, ThreadContextFactory,
};

pub struct RunOptions {
    pub program: PathBuf,
    pub config: Option<PathBuf>,
    pub replay: bool,
    pub save_playback: Option<PathBuf>,
    pub playback: Option<PathBuf>,
}

struct FixedProgram(Program);

impl ProgramSource for FixedProgram {
    fn current_program(&self) -> Program {
        self.0.clone()
    }
}

#[derive(Default)]
struct RunObserver {
    finished: Notify,
}

impl ControllerObserver for RunObserver {
    fn on_state_change(&self, state: ExecutionState) {
        info!(?state, "Sandbox state");
    }

    fn on_trace(&self, event: TraceEvent) {
        info!(kind = ?event.kind, payload = %event.payload, "Sandbox trace");
    }

    fn on_finished(&self) {
        self.finished.notify_one();
    }
}

enum Outcome {
    Finished,
    InputClosed,
    Interrupted,
}

pub async fn cmd_run(opts: RunOptions) -> Result<()> {
    let cfg = config::load_config(opts.config.as_deref())?;
    let _log_guard = logging::init_logging(&cfg.log)?;

    let text = std::fs::read_to_string(&opts.program)
        .with_context(|| format!("reading program from {}", opts.program.display()))?;
    let program = Program::new(
        serde_json::from_str(&text)
            .with_context(|| format!("parsing program from {}", opts.program.display()))?,
    );

    let io = Arc::new(TerminalIo::new());
    let observer = Arc::new(RunObserver::default());
    let transport = ReqwestTransport::new(
        &cfg.fetch.user_agent,
        cfg.fetch.connect_timeout_secs.map(Duration::from_secs),
    )?;

    let controller = SandboxController::new(
        cfg.buffers,
        Collaborators {
            factory: Arc::new(ThreadContextFactory),
            io: io.clone(),
            transport: Arc::new(transport),
            observer: observer.clone(),
            programs: Arc::new(FixedProgram(program.clone())),
        },
    )?;

    tokio::spawn(controller.clone().serve());

    let monitor = LivenessMonitor::new(Arc::new(controller.clone()), cfg.heartbeat.timings());
    let heartbeats = controller.subscribe_heartbeats();
    let runner = monitor.clone();
    tokio::spawn(async move { runner.run(heartbeats).await });

    if let Some(path) = &opts.playback {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading playback from {}", path.display()))?;
        let log: PlaybackLog = serde_json::from_str(&text)
            .with_context(|| format!("parsing playback from {}", path.display()))?;
        controller.load_playback(log);
        controller.replay(program.clone())?;
    } else {
        // The reply reports a context waiting for its first program, which
        // makes the monitor push it.
        controller.send_heartbeat()?;
    }

    let mut outcome = wait_for_run(&observer, &io).await;

    if matches!(outcome, Outcome::Finished) && opts.replay {
        io.stderr("\r\n--- replay ---\r\n");
        controller.replay(program)?;
        outcome = wait_for_run(&observer, &io).await;
    }

    match outcome {
        Outcome::Finished => info!("Program finished"),
        Outcome::InputClosed => info!("Standard input closed"),
        Outcome::Interrupted => {
            warn!("Interrupted");
            controller.stop()?;
        }
    }

    if let Some(path) = &opts.save_playback {
        let json = serde_json::to_string_pretty(&controller.playback())?;
        std::fs::write(path, json)
            .with_context(|| format!("writing playback to {}", path.display()))?;
        info!(path = %path.display(), "Playback saved");
    }

    monitor.stop();
    controller.shutdown();
    Ok(())
}

async fn wait_for_run(observer: &RunObserver, io: &TerminalIo) -> Outcome {
    tokio::select! {
        _ = observer.finished.notified() => Outcome::Finished,
        _ = io.closed() => Outcome::InputClosed,
        _ = tokio::signal::ctrl_c() => Outcome::Interrupted,
    }
}
