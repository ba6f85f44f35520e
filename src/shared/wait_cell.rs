//! A single `i32` cell with blocking wait and notify.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

use super::SharedBufferError;

/// An atomic cell one side can block on until the other side changes it.
///
/// Writers store first and notify second; waiters re-check the value under
/// the lock, so a notify issued between the check and the wait is not lost.
#[derive(Debug)]
pub struct WaitCell {
    value: AtomicI32,
    closed: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitCell {
    pub fn new(initial: i32) -> Self {
        Self {
            value: AtomicI32::new(initial),
            closed: AtomicBool::new(false),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn load(&self) -> i32 {
        self.value.load(Ordering::SeqCst)
    }

    /// Store without waking anyone.
    pub fn store(&self, value: i32) {
        self.value.store(value, Ordering::SeqCst);
    }

    /// Wake at most one waiter.
    pub fn notify_one(&self) {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.cond.notify_one();
    }

    pub fn store_and_notify(&self, value: i32) {
        self.store(value);
        self.notify_one();
    }

    /// Block the calling thread while the cell holds `current`.
    /// Returns the new value.
    pub fn wait_while(&self, current: i32) -> Result<i32, SharedBufferError> {
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(SharedBufferError::Closed);
            }
            let value = self.load();
            if value != current {
                return Ok(value);
            }
            guard = self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
