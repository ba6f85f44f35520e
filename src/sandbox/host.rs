// Collaborators supplied by the host application

use async_trait::async_trait;

use super::error::StdinClosed;
use crate::protocol::{ExecutionState, Program, TraceEvent};

/// The host's terminal.
#[async_trait]
pub trait StandardIo: Send + Sync {
    /// Produce one line of input, trailing newline included.
    async fn stdin(&self) -> Result<String, StdinClosed>;

    fn stdout(&self, text: &str);

    fn stderr(&self, text: &str);
}

/// Receives notifications the controller passes upward.
pub trait ControllerObserver: Send + Sync {
    fn on_state_change(&self, state: ExecutionState);

    /// Runtime captures and module info, forwarded unchanged.
    fn on_trace(&self, _event: TraceEvent) {}

    fn on_finished(&self) {}
}

/// Supplies the latest program representation from the editor.
pub trait ProgramSource: Send + Sync {
    fn current_program(&self) -> Program;
}
