// Isolated execution context abstraction

use uuid::Uuid;

use super::error::Result;
use crate::bus::SandboxOutbox;
use crate::protocol::HostMessage;

/// One isolated execution context.
///
/// Implementations run user code on their own thread of control and talk to
/// the host only through [`post`](ExecutionContext::post) and the
/// [`SandboxOutbox`] they were spawned with.
pub trait ExecutionContext: Send {
    /// Identifier used in logs.
    fn id(&self) -> Uuid;

    /// Queue a message for the context. Never blocks.
    fn post(&self, message: HostMessage) -> Result<()>;

    /// Tear the context down immediately, abandoning whatever it is doing.
    fn terminate(&mut self);
}

/// Creates fresh contexts; the controller asks for a new one after every
/// teardown.
pub trait ContextFactory: Send + Sync {
    fn spawn(&self, outbox: SandboxOutbox) -> Result<Box<dyn ExecutionContext>>;
}
