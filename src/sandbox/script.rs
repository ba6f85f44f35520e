// Step-list programs understood by the reference context
//
// A program is `{"steps": [...]}` where every step is tagged with `op`.
// `print` and `eprint` text may reference `{input}`, `{status}` and `{body}`,
// the most recent input line and fetch outcome.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::Result;
use crate::bus::SandboxOutbox;
use crate::playback::{FetchErrorKind, FetchRequest, ReplayCursor, ResponseHead, ResponseRecord};
use crate::protocol::{Program, SandboxMessage};
use crate::shared::SharedBuffers;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Print {
        text: String,
    },
    Eprint {
        text: String,
    },
    Input {
        #[serde(default)]
        prompt: Option<String>,
    },
    Fetch {
        url: String,
        #[serde(default = "default_method")]
        method: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        body: Option<String>,
    },
    Sleep {
        ms: u64,
    },
    Trace {
        payload: serde_json::Value,
    },
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub steps: Vec<Step>,
}

impl Script {
    pub fn from_program(program: &Program) -> Result<Self> {
        Ok(serde_json::from_value(program.as_value().clone())?)
    }
}

// ---------------------------------------------------------------------------
// Sandbox-side I/O
// ---------------------------------------------------------------------------

/// Blocking I/O as seen by code running inside the context.
pub trait SandboxIo {
    /// One line without its terminator, or `None` at end of input.
    fn read_line(&mut self) -> Result<Option<String>>;

    fn fetch(&mut self, request: &FetchRequest) -> Result<ResponseRecord>;
}

/// Real run: every call blocks this thread on the shared buffers.
pub struct LiveIo {
    outbox: SandboxOutbox,
    buffers: SharedBuffers,
}

impl LiveIo {
    pub fn new(outbox: SandboxOutbox, buffers: SharedBuffers) -> Self {
        Self { outbox, buffers }
    }
}

impl SandboxIo for LiveIo {
    fn read_line(&mut self) -> Result<Option<String>> {
        // A long line arrives in several chunks; keep asking until the
        // terminator shows up.
        let mut bytes = Vec::new();
        loop {
            self.outbox.send(SandboxMessage::Stdin)?;
            let chunk = self.buffers.stdin.receive()?;
            bytes.extend_from_slice(&chunk);
            if chunk.is_empty() || chunk.ends_with(b"\n") {
                break;
            }
        }
        let line = trim_line(String::from_utf8_lossy(&bytes).into_owned());
        self.outbox.send(SandboxMessage::InputValue {
            value: line.clone(),
        })?;
        Ok(Some(line))
    }

    fn fetch(&mut self, request: &FetchRequest) -> Result<ResponseRecord> {
        self.outbox.send(SandboxMessage::Fetch(request.clone()))?;
        let outbox = &self.outbox;
        let received = self.buffers.fetch.receive(|| {
            let _ = outbox.send(SandboxMessage::ContinueFetch);
        })?;
        Ok(ResponseRecord::from_parts(&received.header, received.body)?)
    }
}

/// Replay run: answers come from the recorded log, nothing blocks.
pub struct ReplayIo {
    cursor: ReplayCursor,
}

impl ReplayIo {
    pub fn new(cursor: ReplayCursor) -> Self {
        Self { cursor }
    }
}

impl SandboxIo for ReplayIo {
    fn read_line(&mut self) -> Result<Option<String>> {
        Ok(self.cursor.next_input().map(trim_line))
    }

    fn fetch(&mut self, request: &FetchRequest) -> Result<ResponseRecord> {
        Ok(self.cursor.next_response(request).unwrap_or_else(|| {
            ResponseRecord::error(
                FetchErrorKind::Other,
                format!("no recorded response for {} {}", request.method, request.url),
            )
        }))
    }
}

fn trim_line(mut line: String) -> String {
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    line
}

// ---------------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Registers {
    input: String,
    status: String,
    body: String,
}

impl Registers {
    fn render(&self, text: &str) -> String {
        text.replace("{input}", &self.input)
            .replace("{status}", &self.status)
            .replace("{body}", &self.body)
    }
}

/// Run `script` to completion or until `cancelled` is raised.
pub fn execute(
    script: &Script,
    io: &mut dyn SandboxIo,
    outbox: &SandboxOutbox,
    cancelled: &AtomicBool,
) -> Result<()> {
    let mut regs = Registers::default();

    for step in &script.steps {
        if cancelled.load(Ordering::SeqCst) {
            break;
        }
        match step {
            Step::Print { text } => outbox.send(SandboxMessage::Stdout {
                stdout: regs.render(text),
            })?,
            Step::Eprint { text } => outbox.send(SandboxMessage::Stderr {
                stderr: regs.render(text),
            })?,
            Step::Input { prompt } => {
                if let Some(prompt) = prompt {
                    outbox.send(SandboxMessage::Stdout {
                        stdout: regs.render(prompt),
                    })?;
                }
                match io.read_line()? {
                    Some(line) => regs.input = line,
                    None => {
                        outbox.send(SandboxMessage::Stderr {
                            stderr: "EOFError: EOF when reading a line\n".to_string(),
                        })?;
                        break;
                    }
                }
            }
            Step::Fetch {
                url,
                method,
                headers,
                body,
            } => {
                let request = FetchRequest {
                    method: method.clone(),
                    url: url.clone(),
                    headers: headers.clone(),
                    body: body.as_ref().map(|b| b.as_bytes().to_vec()),
                };
                let record = io.fetch(&request)?;
                match &record.head {
                    ResponseHead::CompletedResponse(done) => {
                        regs.status = format!("{} {}", done.status, done.reason);
                    }
                    ResponseHead::Error(failure) => {
                        regs.status = "error".to_string();
                        outbox.send(SandboxMessage::Stderr {
                            stderr: format!("FetchError: {}\n", failure.message),
                        })?;
                    }
                }
                regs.body = String::from_utf8_lossy(&record.body).into_owned();
            }
            Step::Sleep { ms } => {
                let mut remaining = Duration::from_millis(*ms);
                let slice = Duration::from_millis(10);
                while !remaining.is_zero() && !cancelled.load(Ordering::SeqCst) {
                    let nap = remaining.min(slice);
                    thread::sleep(nap);
                    remaining -= nap;
                }
            }
            Step::Trace { payload } => outbox.send(SandboxMessage::RuntimeCapture {
                payload: payload.clone(),
            })?,
        }
    }
    Ok(())
}
