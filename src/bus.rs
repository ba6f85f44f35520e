//! Message channel between the host and isolated contexts.
//!
//! Every context gets its own host->sandbox queue. Traffic in the other
//! direction from all contexts lands in one inbound queue owned by the
//! controller, tagged with the generation of the context that sent it so
//! messages from a torn-down context can be told apart and dropped.

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::protocol::{HeartbeatReport, HostMessage, SandboxMessage};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("message channel closed")]
pub struct ChannelClosed;

/// An inbound message and the generation of the context that sent it.
#[derive(Debug, Clone)]
pub struct ContextEvent {
    pub generation: u64,
    pub message: SandboxMessage,
}

/// Handle a context uses to talk to the host.
#[derive(Debug, Clone)]
pub struct SandboxOutbox {
    generation: u64,
    tx: mpsc::UnboundedSender<ContextEvent>,
}

impl SandboxOutbox {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Non-blocking; safe to call from the sandbox thread.
    pub fn send(&self, message: SandboxMessage) -> Result<(), ChannelClosed> {
        self.tx
            .send(ContextEvent {
                generation: self.generation,
                message,
            })
            .map_err(|_| ChannelClosed)
    }

    /// Send a JSON wire frame. A frame that does not decode is delivered as
    /// [`SandboxMessage::Unrecognised`].
    pub fn send_frame(&self, raw: &str) -> Result<(), ChannelClosed> {
        let message = SandboxMessage::from_json(raw).unwrap_or_else(|e| {
            warn!(generation = self.generation, "Undecodable frame from sandbox: {}", e);
            SandboxMessage::Unrecognised
        });
        self.send(message)
    }
}

/// Host->sandbox queue for one context.
pub fn context_channel() -> (
    mpsc::UnboundedSender<HostMessage>,
    mpsc::UnboundedReceiver<HostMessage>,
) {
    mpsc::unbounded_channel()
}

/// Capacity of the heartbeat fan-out.
const HEARTBEAT_CAPACITY: usize = 64;

#[derive(Debug)]
pub struct MessageBus {
    inbound_tx: mpsc::UnboundedSender<ContextEvent>,
    inbound_rx: Option<mpsc::UnboundedReceiver<ContextEvent>>,
    heartbeat_tx: broadcast::Sender<HeartbeatReport>,
}

impl MessageBus {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (heartbeat_tx, _) = broadcast::channel(HEARTBEAT_CAPACITY);
        Self {
            inbound_tx,
            inbound_rx: Some(inbound_rx),
            heartbeat_tx,
        }
    }

    /// Outbox for the context spawned as `generation`.
    pub fn outbox(&self, generation: u64) -> SandboxOutbox {
        SandboxOutbox {
            generation,
            tx: self.inbound_tx.clone(),
        }
    }

    /// Take the inbound receiver (only once; the controller's pump owns it).
    pub fn take_inbound_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<ContextEvent>> {
        self.inbound_rx.take()
    }

    /// Re-publish a heartbeat reply to every subscriber.
    pub fn publish_heartbeat(&self, report: HeartbeatReport) {
        let _ = self.heartbeat_tx.send(report);
    }

    pub fn subscribe_heartbeats(&self) -> broadcast::Receiver<HeartbeatReport> {
        self.heartbeat_tx.subscribe()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
