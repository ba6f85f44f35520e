//! Memory shared between the host and one isolated context.
//!
//! Only two cells are ever written by both sides: the stdin cursor and the
//! fetch ready flag. Every other field has a single writer, so the buffers
//! need no lock beyond the wait/notify pairing in [`WaitCell`].

pub mod fetch_buffer;
pub mod stdin_ring;
pub mod wait_cell;

use std::sync::Arc;

use thiserror::Error;

pub use fetch_buffer::FetchBuffer;
pub use stdin_ring::StdinRing;
pub use wait_cell::WaitCell;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SharedBufferError {
    /// The owning context was torn down while a side was waiting.
    #[error("shared buffer closed")]
    Closed,

    #[error("payload of {needed} bytes does not fit in {capacity} bytes")]
    Overflow { needed: usize, capacity: usize },

    #[error("length {0} does not fit in a 32-bit cell")]
    LengthOutOfRange(usize),
}

/// The regions handed to a context with every real run.
#[derive(Debug, Clone)]
pub struct SharedBuffers {
    pub stdin: Arc<StdinRing>,
    pub fetch: Arc<FetchBuffer>,
}

impl SharedBuffers {
    /// Allocate fresh regions; nothing is reused across runs.
    pub fn allocate(stdin_cells: usize, fetch_bytes: usize) -> Self {
        Self {
            stdin: Arc::new(StdinRing::new(stdin_cells)),
            fetch: Arc::new(FetchBuffer::new(fetch_bytes)),
        }
    }

    /// Wake every waiter with [`SharedBufferError::Closed`].
    pub fn close(&self) {
        self.stdin.close();
        self.fetch.close();
    }
}
