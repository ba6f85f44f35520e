//! # sandbox-bridge
//!
//! Runs untrusted programs inside an isolated execution context and gives
//! them blocking `input()` and `fetch()` even though the host side is fully
//! asynchronous.
//!
//! ## How it works
//!
//! - The host hands each real run a pair of shared buffers. A sandbox that
//!   wants input posts `stdin` and parks on the stdin ring; the host writes
//!   the bytes and wakes it. Fetch works the same way through a byte buffer,
//!   chunked when the response is larger than the buffer.
//! - Every input value and network outcome of a real run is recorded in a
//!   [`playback::PlaybackLog`]. Replay runs are served from that log and
//!   never touch stdin or the network.
//! - A [`heartbeat::LivenessMonitor`] probes the context, restarts it when
//!   it stops answering and rate-limits program pushes.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sandbox_bridge::config::BufferConfig;
//! use sandbox_bridge::protocol::Program;
//! use sandbox_bridge::sandbox::{Collaborators, SandboxController, ThreadContextFactory};
//! # fn parts() -> Collaborators { unimplemented!() }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let controller = SandboxController::new(BufferConfig::default(), parts())?;
//!     let server = controller.clone();
//!     tokio::spawn(async move { server.serve().await });
//!
//!     controller.start(Program::new(serde_json::json!({
//!         "steps": [{"op": "input", "prompt": "Name? "}, {"op": "print", "text": "Hi {input}\n"}]
//!     })))?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`sandbox`] - controller, context abstraction and the in-process reference context
//! - [`shared`] - shared stdin ring and fetch buffer with blocking wait/notify
//! - [`playback`] - recorded I/O and replay
//! - [`heartbeat`] - liveness monitor
//! - [`protocol`] - host/sandbox message vocabulary
//! - [`config`] - configuration management

pub mod bus;
pub mod cli;
pub mod config;
pub mod heartbeat;
pub mod logging;
pub mod playback;
pub mod protocol;
pub mod sandbox;
pub mod shared;
