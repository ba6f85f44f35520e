//! Message vocabulary exchanged between the host and an isolated context.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::playback::{FetchRequest, PlaybackLog};
use crate::shared::SharedBuffers;

// ---------------------------------------------------------------------------
// Program representation
// ---------------------------------------------------------------------------

/// Opaque program payload produced by the editor. Cheap to clone.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Program(Arc<serde_json::Value>);

impl Program {
    pub fn new(value: serde_json::Value) -> Self {
        Self(Arc::new(value))
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Programs can be large; only show their shape.
        match self.0.as_ref() {
            serde_json::Value::Object(map) => write!(f, "Program({} keys)", map.len()),
            serde_json::Value::Array(items) => write!(f, "Program({} items)", items.len()),
            other => write!(f, "Program({})", other),
        }
    }
}

impl From<serde_json::Value> for Program {
    fn from(value: serde_json::Value) -> Self {
        Self::new(value)
    }
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Execution state reported by the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    #[default]
    Disabled,
    Ready,
    Running,
}

/// Payload of a heartbeat reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatReport {
    pub state: ExecutionState,
    /// True until the context has been handed its first program.
    #[serde(default)]
    pub awaiting_program: bool,
}

// ---------------------------------------------------------------------------
// host -> sandbox
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum HostMessage {
    /// Real run with freshly allocated shared buffers.
    Run {
        program: Program,
        buffers: SharedBuffers,
    },
    /// Replay run against recorded I/O.
    Rerun {
        program: Program,
        playback: Arc<PlaybackLog>,
    },
    LoadModule {
        name: String,
    },
    Heartbeat,
}

impl HostMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            HostMessage::Run { .. } => "run",
            HostMessage::Rerun { .. } => "rerun",
            HostMessage::LoadModule { .. } => "loadModule",
            HostMessage::Heartbeat => "heartbeat",
        }
    }
}

// ---------------------------------------------------------------------------
// sandbox -> host
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SandboxMessage {
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "heartbeat")]
    Heartbeat(HeartbeatReport),
    #[serde(rename = "stdin")]
    Stdin,
    #[serde(rename = "inputValue")]
    InputValue { value: String },
    #[serde(rename = "fetch")]
    Fetch(FetchRequest),
    #[serde(rename = "continueFetch")]
    ContinueFetch,
    #[serde(rename = "stdout")]
    Stdout { stdout: String },
    #[serde(rename = "stderr")]
    Stderr { stderr: String },
    #[serde(rename = "runtime_capture")]
    RuntimeCapture { payload: serde_json::Value },
    #[serde(rename = "module_info")]
    ModuleInfo { payload: serde_json::Value },
    #[serde(rename = "finished")]
    Finished,
    /// Any message type this host does not understand.
    #[serde(other)]
    Unrecognised,
}

impl SandboxMessage {
    /// Decode a wire frame. Unknown `type` tags decode to `Unrecognised`.
    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SandboxMessage::Ready => "ready",
            SandboxMessage::Heartbeat(_) => "heartbeat",
            SandboxMessage::Stdin => "stdin",
            SandboxMessage::InputValue { .. } => "inputValue",
            SandboxMessage::Fetch(_) => "fetch",
            SandboxMessage::ContinueFetch => "continueFetch",
            SandboxMessage::Stdout { .. } => "stdout",
            SandboxMessage::Stderr { .. } => "stderr",
            SandboxMessage::RuntimeCapture { .. } => "runtime_capture",
            SandboxMessage::ModuleInfo { .. } => "module_info",
            SandboxMessage::Finished => "finished",
            SandboxMessage::Unrecognised => "unrecognised",
        }
    }
}

// ---------------------------------------------------------------------------
// Trace pass-through
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    RuntimeCapture,
    ModuleInfo,
}

/// Trace payload forwarded unchanged to the editor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub kind: TraceKind,
    pub payload: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sandbox_message_tags() {
        let json = serde_json::to_string(&SandboxMessage::ContinueFetch).unwrap();
        assert_eq!(json, r#"{"type":"continueFetch"}"#);

        let json = serde_json::to_string(&SandboxMessage::InputValue {
            value: "abc".to_string(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"inputValue""#));
        assert!(json.contains(r#""value":"abc""#));
    }

    #[test]
    fn test_heartbeat_reply_decoding() {
        let msg = SandboxMessage::from_json(r#"{"type":"heartbeat","state":"running"}"#).unwrap();
        assert_eq!(
            msg,
            SandboxMessage::Heartbeat(HeartbeatReport {
                state: ExecutionState::Running,
                awaiting_program: false,
            })
        );

        let msg = SandboxMessage::from_json(
            r#"{"type":"heartbeat","state":"disabled","awaitingProgram":true}"#,
        )
        .unwrap();
        match msg {
            SandboxMessage::Heartbeat(report) => assert!(report.awaiting_program),
            other => panic!("Expected heartbeat, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_decodes_as_unrecognised() {
        let msg = SandboxMessage::from_json(r#"{"type":"teleport"}"#).unwrap();
        assert_eq!(msg, SandboxMessage::Unrecognised);
        assert_eq!(msg.kind(), "unrecognised");
    }

    #[test]
    fn test_fetch_message_flattens_request() {
        let raw = r#"{"type":"fetch","method":"GET","url":"https://example.com/a","headers":{"accept":"text/plain"}}"#;
        match SandboxMessage::from_json(raw).unwrap() {
            SandboxMessage::Fetch(req) => {
                assert_eq!(req.method, "GET");
                assert_eq!(req.url, "https://example.com/a");
                assert_eq!(req.headers.get("accept").map(String::as_str), Some("text/plain"));
                assert!(req.body.is_none());
            }
            other => panic!("Expected fetch, got {:?}", other),
        }
    }

    #[test]
    fn test_program_debug_is_compact() {
        let program = Program::new(json!({"steps": [], "name": "demo"}));
        assert_eq!(format!("{:?}", program), "Program(2 keys)");
    }

    #[test]
    fn test_program_serializes_transparently() {
        let program: Program = serde_json::from_str(r#"{"steps":[{"op":"input"}]}"#).unwrap();
        assert_eq!(program.as_value()["steps"][0]["op"], "input");
        assert_eq!(
            serde_json::to_string(&program).unwrap(),
            r#"{"steps":[{"op":"input"}]}"#
        );
    }
}
