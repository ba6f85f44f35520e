// Real network calls made on behalf of the sandbox

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::error::TransportError;
use crate::playback::{FetchErrorKind, FetchRequest, ResponseRecord};

/// A response as received from the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub reason: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl TransportResponse {
    pub fn into_record(self) -> ResponseRecord {
        ResponseRecord::completed(self.status, self.reason, self.headers, self.body)
    }
}

impl TransportError {
    pub fn into_record(self) -> ResponseRecord {
        match self {
            TransportError::Network(message) => ResponseRecord::error(FetchErrorKind::Network, message),
            TransportError::Other(message) => ResponseRecord::error(FetchErrorKind::Other, message),
        }
    }
}

/// Performs the real request behind a sandbox `fetch`.
#[async_trait]
pub trait FetchTransport: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<TransportResponse, TransportError>;
}

// ---------------------------------------------------------------------------
// reqwest
// ---------------------------------------------------------------------------

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(user_agent: &str, connect_timeout: Option<Duration>) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder().user_agent(user_agent);
        if let Some(timeout) = connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| TransportError::Other(format!("building HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn classify(err: reqwest::Error) -> TransportError {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            TransportError::Network(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

#[async_trait]
impl FetchTransport for ReqwestTransport {
    async fn fetch(&self, request: &FetchRequest) -> Result<TransportResponse, TransportError> {
        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| TransportError::Other(format!("invalid method: {}", request.method)))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(Self::classify)?;
        let status = response.status();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(Self::classify)?.to_vec();

        debug!(
            url = %request.url,
            status = status.as_u16(),
            body_len = body.len(),
            "Fetch completed"
        );

        Ok(TransportResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_become_typed_records() {
        let record = TransportError::Network("refused".into()).into_record();
        assert_eq!(
            record,
            ResponseRecord::error(FetchErrorKind::Network, "refused")
        );
        let record = TransportError::Other("bad url".into()).into_record();
        assert!(record.is_error());
    }

    #[tokio::test]
    async fn test_invalid_method_is_other_error() {
        let transport = ReqwestTransport::new("sandbox-bridge-test", None).unwrap();
        let mut request = FetchRequest::get("http://127.0.0.1:9/");
        request.method = "NOT A METHOD".into();
        match transport.fetch(&request).await {
            Err(TransportError::Other(message)) => assert!(message.contains("invalid method")),
            other => panic!("Expected Other error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        let transport = ReqwestTransport::new("sandbox-bridge-test", Some(Duration::from_secs(2))).unwrap();
        // Port 9 (discard) on loopback is closed on any sane test machine.
        let request = FetchRequest::get("http://127.0.0.1:9/");
        match transport.fetch(&request).await {
            Err(TransportError::Network(_)) => {}
            other => panic!("Expected network error, got {:?}", other),
        }
    }
}
