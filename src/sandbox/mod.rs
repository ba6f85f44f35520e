// Sandbox bridge
//
// Host-side control of one isolated execution context: lifecycle, the
// synchronous stdin and fetch bridges, and record/replay of their traffic.

pub mod context;
pub mod controller;
pub mod error;
pub mod host;
pub mod runtime;
pub mod script;
pub mod stdin;
pub mod transport;

// Re-export commonly used types
pub use context::{ContextFactory, ExecutionContext};
pub use controller::{Collaborators, SandboxController, RESTART_DIAGNOSTIC, STOPPED_DIAGNOSTIC};
pub use error::{ConfigError, Result, SandboxError, StdinClosed, TransportError};
pub use host::{ControllerObserver, ProgramSource, StandardIo};
pub use runtime::{ThreadContext, ThreadContextFactory};
pub use script::{Script, Step};
pub use stdin::{split_input, InputChunk};
pub use transport::{FetchTransport, ReqwestTransport, TransportResponse};
