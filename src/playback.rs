//! Recorded I/O for replay runs.
//!
//! A real run appends every host-supplied input and every fetch outcome to a
//! [`PlaybackLog`]. A replay run receives a frozen snapshot of that log and
//! walks it with a [`ReplayCursor`], so identical requests get their recorded
//! answers back in the order they were first observed.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes::option")]
    pub body: Option<Vec<u8>>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    /// Key under which outcomes of this request are recorded. Header order
    /// never matters and the method is compared case-insensitively.
    pub fn canonical_key(&self) -> String {
        let canonical = FetchRequest {
            method: self.method.to_ascii_uppercase(),
            ..self.clone()
        };
        serde_json::to_string(&canonical).unwrap_or_else(|_| format!("{} {}", canonical.method, canonical.url))
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    /// The request never produced a response (DNS, connect, reset, ...).
    Network,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedResponse {
    pub status: u16,
    pub reason: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFailure {
    #[serde(rename = "type")]
    pub kind: FetchErrorKind,
    pub message: String,
}

/// The JSON header block written ahead of the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseHead {
    CompletedResponse(CompletedResponse),
    Error(FetchFailure),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub head: ResponseHead,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
}

impl ResponseRecord {
    pub fn completed(
        status: u16,
        reason: impl Into<String>,
        headers: BTreeMap<String, String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            head: ResponseHead::CompletedResponse(CompletedResponse {
                status,
                reason: reason.into(),
                headers,
            }),
            body,
        }
    }

    pub fn error(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            head: ResponseHead::Error(FetchFailure {
                kind,
                message: message.into(),
            }),
            body: Vec::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.head, ResponseHead::Error(_))
    }

    /// Serialized header block as sent through the fetch buffer.
    pub fn header_block(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.head)
    }

    /// Rebuild a record from the two halves read out of the fetch buffer.
    pub fn from_parts(header: &[u8], body: Vec<u8>) -> serde_json::Result<Self> {
        Ok(Self {
            head: serde_json::from_slice(header)?,
            body,
        })
    }
}

// ---------------------------------------------------------------------------
// Log
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackLog {
    inputs: Vec<String>,
    requests: HashMap<String, Vec<ResponseRecord>>,
}

impl PlaybackLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_input(&mut self, value: impl Into<String>) {
        self.inputs.push(value.into());
    }

    pub fn record_response(&mut self, request: &FetchRequest, record: ResponseRecord) {
        self.requests
            .entry(request.canonical_key())
            .or_default()
            .push(record);
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn responses_for(&self, request: &FetchRequest) -> &[ResponseRecord] {
        self.requests
            .get(&request.canonical_key())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of distinct request keys recorded.
    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.requests.is_empty()
    }
}

/// Read-only walk over a frozen [`PlaybackLog`].
#[derive(Debug, Clone)]
pub struct ReplayCursor {
    log: Arc<PlaybackLog>,
    next_input: usize,
    next_response: HashMap<String, usize>,
}

impl ReplayCursor {
    pub fn new(log: Arc<PlaybackLog>) -> Self {
        Self {
            log,
            next_input: 0,
            next_response: HashMap::new(),
        }
    }

    /// Next recorded input, or `None` once the log is exhausted.
    pub fn next_input(&mut self) -> Option<String> {
        let value = self.log.inputs.get(self.next_input).cloned()?;
        self.next_input += 1;
        Some(value)
    }

    /// Next recorded outcome for `request`, first in first out.
    pub fn next_response(&mut self, request: &FetchRequest) -> Option<ResponseRecord> {
        let key = request.canonical_key();
        let recorded = self.log.requests.get(&key)?;
        let index = self.next_response.entry(key).or_insert(0);
        let record = recorded.get(*index).cloned()?;
        *index += 1;
        Some(record)
    }
}

// ---------------------------------------------------------------------------
// serde helpers
// ---------------------------------------------------------------------------

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            bytes: &Option<Vec<u8>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match bytes {
                Some(bytes) => super::serialize(bytes, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<u8>>, D::Error> {
            let encoded = Option::<String>::deserialize(deserializer)?;
            encoded
                .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
