//! Liveness monitor: probes the sandbox, declares it dead on silence and
//! drives a full restart. Also rate-limits program pushes.
//!
//! The decisions live in [`HeartbeatTracker`], a pure state machine fed
//! with the current time and the last heartbeat report. [`LivenessMonitor`]
//! wires it to a clock, the heartbeat channel and the supervised sandbox.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HeartbeatConfig;
use crate::protocol::HeartbeatReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessState {
    Dead,
    RequestingInitialFiles,
    Live,
    /// Terminal: the monitor has been stopped.
    Unmounted,
}

impl From<HeartbeatReport> for LivenessState {
    fn from(report: HeartbeatReport) -> Self {
        if report.awaiting_program {
            LivenessState::RequestingInitialFiles
        } else {
            LivenessState::Live
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatTimings {
    pub check_interval: Duration,
    pub probe_interval: Duration,
    pub timeout: Duration,
    pub push_rate_limit: Duration,
}

impl Default for HeartbeatTimings {
    fn default() -> Self {
        HeartbeatConfig::default().timings()
    }
}

/// Side effect requested by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorAction {
    SendProbe,
    PushProgram { initial: bool },
    Restart,
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HeartbeatTracker {
    state: LivenessState,
    timings: HeartbeatTimings,
    last_heartbeat: Instant,
    needs_update: bool,
    last_push: Option<Instant>,
}

impl HeartbeatTracker {
    pub fn new(timings: HeartbeatTimings, now: Instant) -> Self {
        Self {
            state: LivenessState::RequestingInitialFiles,
            timings,
            last_heartbeat: now,
            needs_update: false,
            last_push: None,
        }
    }

    pub fn state(&self) -> LivenessState {
        self.state
    }

    pub fn needs_update(&self) -> bool {
        self.needs_update
    }

    /// Adopt a heartbeat reply. A context still waiting for its first
    /// program gets it immediately.
    pub fn on_heartbeat(&mut self, report: HeartbeatReport, now: Instant) -> Option<MonitorAction> {
        if self.state == LivenessState::Unmounted {
            return None;
        }
        self.state = report.into();
        self.last_heartbeat = now;
        if self.state == LivenessState::RequestingInitialFiles {
            self.needs_update = false;
            self.last_push = Some(now);
            return Some(MonitorAction::PushProgram { initial: true });
        }
        None
    }

    /// Periodic check.
    pub fn tick(&mut self, now: Instant) -> Vec<MonitorAction> {
        if self.state == LivenessState::Unmounted {
            return Vec::new();
        }
        let silent_for = now.saturating_duration_since(self.last_heartbeat);
        if silent_for > self.timings.timeout {
            self.state = LivenessState::Dead;
        }

        let mut actions = Vec::new();
        match self.state {
            LivenessState::RequestingInitialFiles => {
                if silent_for > self.timings.probe_interval {
                    actions.push(MonitorAction::SendProbe);
                }
            }
            LivenessState::Live => {
                if self.needs_update {
                    self.needs_update = false;
                    self.last_push = Some(now);
                    actions.push(MonitorAction::PushProgram { initial: false });
                }
                if silent_for > self.timings.probe_interval {
                    actions.push(MonitorAction::SendProbe);
                }
            }
            LivenessState::Dead => {
                warn!(silent_secs = silent_for.as_secs(), "Sandbox is dead, restarting");
                self.state = LivenessState::RequestingInitialFiles;
                self.last_heartbeat = now;
                actions.push(MonitorAction::Restart);
            }
            LivenessState::Unmounted => {}
        }
        actions
    }

    /// Mark the program as changed. Delivery happens in [`push_if_due`]
    /// or on a later tick.
    ///
    /// [`push_if_due`]: HeartbeatTracker::push_if_due
    pub fn request_update(&mut self) {
        if self.state != LivenessState::Unmounted {
            self.needs_update = true;
        }
    }

    /// Push a pending update unless the previous push was too recent.
    pub fn push_if_due(&mut self, now: Instant) -> Option<MonitorAction> {
        if !self.needs_update || self.state == LivenessState::Unmounted {
            return None;
        }
        let due = self
            .last_push
            .map_or(true, |at| now.saturating_duration_since(at) >= self.timings.push_rate_limit);
        if !due {
            return None;
        }
        self.needs_update = false;
        self.last_push = Some(now);
        Some(MonitorAction::PushProgram { initial: false })
    }

    pub fn unmount(&mut self) {
        self.state = LivenessState::Unmounted;
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// What the monitor supervises.
#[async_trait]
pub trait SupervisedSandbox: Send + Sync {
    async fn send_probe(&self);

    /// Send the latest program; `initial` when the context has none yet.
    async fn push_program(&self, initial: bool);

    async fn restart(&self);
}

#[derive(Clone)]
pub struct LivenessMonitor {
    tracker: Arc<Mutex<HeartbeatTracker>>,
    target: Arc<dyn SupervisedSandbox>,
    timings: HeartbeatTimings,
    shutdown: CancellationToken,
}

impl LivenessMonitor {
    pub fn new(target: Arc<dyn SupervisedSandbox>, timings: HeartbeatTimings) -> Self {
        Self {
            tracker: Arc::new(Mutex::new(HeartbeatTracker::new(timings, Instant::now()))),
            target,
            timings,
            shutdown: CancellationToken::new(),
        }
    }

    fn tracker(&self) -> MutexGuard<'_, HeartbeatTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> LivenessState {
        self.tracker().state()
    }

    /// The program changed; push it soon, at most once per rate-limit window.
    pub fn request_update(&self) {
        self.tracker().request_update();
        let this = self.clone();
        tokio::spawn(async move {
            let action = this.tracker().push_if_due(Instant::now());
            match action {
                Some(action) => this.perform(action).await,
                None => debug!("Program push deferred by rate limit"),
            }
        });
    }

    /// Run until [`stop`](LivenessMonitor::stop) is called.
    pub async fn run(&self, mut heartbeats: broadcast::Receiver<HeartbeatReport>) {
        info!(
            check_ms = self.timings.check_interval.as_millis() as u64,
            timeout_ms = self.timings.timeout.as_millis() as u64,
            "Liveness monitor started"
        );
        let mut ticker = tokio::time::interval(self.timings.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeats_open = true;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let actions = self.tracker().tick(Instant::now());
                    for action in actions {
                        self.perform(action).await;
                    }
                }
                report = heartbeats.recv(), if heartbeats_open => match report {
                    Ok(report) => {
                        let action = self.tracker().on_heartbeat(report, Instant::now());
                        if let Some(action) = action {
                            self.perform(action).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Heartbeat receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Heartbeat channel closed");
                        heartbeats_open = false;
                    }
                },
            }
            if self.state() == LivenessState::Unmounted {
                break;
            }
        }
        info!("Liveness monitor stopped");
    }

    async fn perform(&self, action: MonitorAction) {
        debug!(?action, "Liveness action");
        match action {
            MonitorAction::SendProbe => self.target.send_probe().await,
            MonitorAction::PushProgram { initial } => self.target.push_program(initial).await,
            MonitorAction::Restart => self.target.restart().await,
        }
    }

    /// Terminal: no further probes, pushes or restarts.
    pub fn stop(&self) {
        self.tracker().unmount();
        self.shutdown.cancel();
    }
}
