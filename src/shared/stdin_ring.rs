//! Stdin ring: a cursor cell followed by one byte per cell.

use std::sync::atomic::{AtomicI32, Ordering};

use super::{SharedBufferError, WaitCell};

/// Cursor value meaning "nothing pending".
pub const EMPTY: i32 = -1;

/// Cell 0 is the cursor; cells `1..capacity` carry UTF-8 bytes.
///
/// A non-negative cursor is the index of the last valid byte, so a delivered
/// empty line leaves the cursor at `0`.
#[derive(Debug)]
pub struct StdinRing {
    cursor: WaitCell,
    // Index 0 is never written; the cursor lives in `cursor`.
    cells: Box<[AtomicI32]>,
}

impl StdinRing {
    pub fn new(capacity: usize) -> Self {
        let cells = (0..capacity).map(|_| AtomicI32::new(0)).collect();
        Self {
            cursor: WaitCell::new(EMPTY),
            cells,
        }
    }

    /// Number of cells, cursor included.
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    pub fn cursor(&self) -> i32 {
        self.cursor.load()
    }

    /// Raw view of cell `index`, for inspection.
    pub fn cell(&self, index: usize) -> Option<i32> {
        if index == 0 {
            Some(self.cursor.load())
        } else {
            self.cells.get(index).map(|c| c.load(Ordering::Acquire))
        }
    }

    /// Offset the next delivery starts at.
    pub fn start_offset(&self) -> usize {
        match self.cursor.load() {
            c if c > 0 => c as usize,
            _ => 1,
        }
    }

    /// Largest payload the next delivery can carry.
    pub fn max_payload(&self) -> usize {
        self.capacity().saturating_sub(self.start_offset())
    }

    // ---------------------------------------------------------------------
    // host side
    // ---------------------------------------------------------------------

    /// Write `bytes` after the cursor, publish the new cursor and wake one
    /// waiter. Returns the published cursor.
    pub fn deliver(&self, bytes: &[u8]) -> Result<i32, SharedBufferError> {
        if self.cursor.is_closed() {
            return Err(SharedBufferError::Closed);
        }
        let start = self.start_offset();
        if start + bytes.len() > self.capacity() {
            return Err(SharedBufferError::Overflow {
                needed: bytes.len(),
                capacity: self.max_payload(),
            });
        }
        for (i, byte) in bytes.iter().enumerate() {
            self.cells[start + i].store(i32::from(*byte), Ordering::Release);
        }
        let cursor = i32::try_from(start + bytes.len() - 1)
            .map_err(|_| SharedBufferError::LengthOutOfRange(start + bytes.len()))?;
        self.cursor.store_and_notify(cursor);
        Ok(cursor)
    }

    // ---------------------------------------------------------------------
    // sandbox side
    // ---------------------------------------------------------------------

    /// Block until the host delivers, then take the bytes and reset the cursor.
    pub fn receive(&self) -> Result<Vec<u8>, SharedBufferError> {
        let cursor = self.cursor.wait_while(EMPTY)?;
        let last = (cursor.max(0) as usize).min(self.capacity() - 1);
        let bytes = (1..=last)
            .map(|i| self.cells[i].load(Ordering::Acquire) as u8)
            .collect();
        self.cursor.store(EMPTY);
        Ok(bytes)
    }

    pub fn close(&self) {
        self.cursor.close();
    }
}
