//! The process's own terminal as the sandbox's standard I/O.

use std::io::Write;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::{Mutex, Notify};

use crate::sandbox::{StandardIo, StdinClosed};

pub struct TerminalIo {
    lines: Mutex<Lines<BufReader<Stdin>>>,
    closed: Notify,
}

impl TerminalIo {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
            closed: Notify::new(),
        }
    }

    /// Resolves once standard input has reached end of file.
    pub async fn closed(&self) {
        self.closed.notified().await;
    }
}

impl Default for TerminalIo {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StandardIo for TerminalIo {
    async fn stdin(&self) -> Result<String, StdinClosed> {
        let mut lines = self.lines.lock().await;
        match lines.next_line().await {
            Ok(Some(line)) => Ok(format!("{}\n", line)),
            Ok(None) | Err(_) => {
                self.closed.notify_one();
                Err(StdinClosed)
            }
        }
    }

    fn stdout(&self, text: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }

    fn stderr(&self, text: &str) {
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(text.as_bytes());
        let _ = err.flush();
    }
}
