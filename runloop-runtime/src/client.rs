//! Lambda Runtime API client
//!
//! Speaks the runtime side of the invocation protocol: long-poll for the next
//! event, then report either a response or an error for that request id.

use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use runloop_core::ErrorEnvelope;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub const API_VERSION: &str = "2018-06-01";

pub const REQUEST_ID_HEADER: &str = "Lambda-Runtime-Aws-Request-Id";
pub const DEADLINE_HEADER: &str = "Lambda-Runtime-Deadline-Ms";
pub const FUNCTION_ARN_HEADER: &str = "Lambda-Runtime-Invoked-Function-Arn";
pub const TRACE_ID_HEADER: &str = "Lambda-Runtime-Trace-Id";
pub const ERROR_TYPE_HEADER: &str = "Lambda-Runtime-Function-Error-Type";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Runtime API returned status {status} for {path}")]
    Status { status: StatusCode, path: String },

    #[error("Next invocation is missing the Lambda-Runtime-Aws-Request-Id header")]
    MissingRequestId,

    #[error("Failed to encode request body: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Event payload for request {request_id} is not valid JSON: {source}")]
    MalformedEvent {
        request_id: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ClientError {
    /// Request id the failure belongs to, when one had already been read
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::MalformedEvent { request_id, .. } => Some(request_id),
            _ => None,
        }
    }

    /// Stable name used as `errorType` when this failure is reported
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Http(_) => "Runtime.HttpError",
            Self::Status { .. } => "Runtime.UnexpectedStatus",
            Self::MissingRequestId => "Runtime.MissingRequestId",
            Self::MalformedEvent { .. } => "Runtime.MalformedEvent",
            Self::Encode(_) => "Runtime.SerializationError",
        }
    }
}

/// An event delivered by `GET /runtime/invocation/next`
#[derive(Debug, Clone)]
pub struct NextInvocation {
    pub request_id: String,
    pub deadline_ms: i64,
    pub invoked_function_arn: Option<String>,
    pub trace_id: Option<String>,
    pub event: Value,
}

/// Client for the Runtime API at a fixed `host:port`
#[derive(Debug, Clone)]
pub struct RuntimeApiClient {
    base_url: String,
    client: Client,
}

impl RuntimeApiClient {
    /// Create a client for `host:port` (the value of `AWS_LAMBDA_RUNTIME_API`)
    ///
    /// No request timeout is set: fetching the next event blocks until the
    /// platform has one.
    pub fn new(runtime_api: &str) -> Result<Self, ClientError> {
        let client = Client::builder().build()?;
        Ok(Self::with_client(runtime_api, client))
    }

    pub fn with_client(runtime_api: &str, client: Client) -> Self {
        let host = runtime_api
            .trim_start_matches("http://")
            .trim_end_matches('/');

        Self {
            base_url: format!("http://{}/{}/runtime", host, API_VERSION),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET /runtime/invocation/next
    pub async fn next_invocation(&self) -> Result<NextInvocation, ClientError> {
        let path = "/invocation/next";
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                status,
                path: path.to_string(),
            });
        }

        let headers = response.headers();
        let request_id =
            header_str(headers, REQUEST_ID_HEADER).ok_or(ClientError::MissingRequestId)?;
        let deadline_ms = parse_deadline(header_str(headers, DEADLINE_HEADER).as_deref());
        let invoked_function_arn = header_str(headers, FUNCTION_ARN_HEADER);
        let trace_id = header_str(headers, TRACE_ID_HEADER);

        let body = response.bytes().await?;
        let event = serde_json::from_slice(&body).map_err(|source| ClientError::MalformedEvent {
            request_id: request_id.clone(),
            source,
        })?;

        debug!(request_id = %request_id, deadline_ms, "Received invocation");

        Ok(NextInvocation {
            request_id,
            deadline_ms,
            invoked_function_arn,
            trace_id,
            event,
        })
    }

    /// POST /runtime/invocation/{requestId}/response
    pub async fn post_response(&self, request_id: &str, result: &Value) -> Result<(), ClientError> {
        let path = format!("/invocation/{}/response", request_id);
        let body = serde_json::to_vec(result).map_err(ClientError::Encode)?;

        self.post(&path, body, None).await
    }

    /// POST /runtime/invocation/{requestId}/error
    pub async fn post_error(
        &self,
        request_id: &str,
        envelope: &ErrorEnvelope,
    ) -> Result<(), ClientError> {
        let path = format!("/invocation/{}/error", request_id);
        let body = envelope.to_json().map_err(ClientError::Encode)?;
        self.post(&path, body.into_bytes(), Some(&envelope.error_type))
            .await
    }

    /// POST /runtime/init/error
    pub async fn post_init_error(&self, envelope: &ErrorEnvelope) -> Result<(), ClientError> {
        let body = envelope.to_json().map_err(ClientError::Encode)?;
        self.post("/init/error", body.into_bytes(), Some(&envelope.error_type))
            .await
    }

    async fn post(
        &self,
        path: &str,
        body: Vec<u8>,
        error_type: Option<&str>,
    ) -> Result<(), ClientError> {
        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header(CONTENT_TYPE, "application/json")
            .body(body);

        if let Some(error_type) = error_type {
            request = request.header(ERROR_TYPE_HEADER, error_type);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                status,
                path: path.to_string(),
            });
        }

        debug!(path = %path, status = %status, "Runtime API accepted report");
        Ok(())
    }
}

/// Parse the deadline header; missing or malformed values become `0`
pub fn parse_deadline(value: Option<&str>) -> i64 {
    value
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(0)
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        let client = RuntimeApiClient::new("127.0.0.1:9001").unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:9001/2018-06-01/runtime");

        let prefixed = RuntimeApiClient::new("http://localhost:9001/").unwrap();
        assert_eq!(prefixed.base_url(), "http://localhost:9001/2018-06-01/runtime");
    }

    #[test]
    fn test_parse_deadline() {
        assert_eq!(parse_deadline(Some("1700000000123")), 1_700_000_000_123);
        assert_eq!(parse_deadline(Some(" 42 ")), 42);
        assert_eq!(parse_deadline(Some("soon")), 0);
        assert_eq!(parse_deadline(Some("")), 0);
        assert_eq!(parse_deadline(None), 0);
    }

    #[test]
    fn test_error_request_id() {
        let source = serde_json::from_str::<Value>("{").unwrap_err();
        let err = ClientError::MalformedEvent {
            request_id: "req-1".to_string(),
            source,
        };
        assert_eq!(err.request_id(), Some("req-1"));
        assert_eq!(err.error_type(), "Runtime.MalformedEvent");
        assert_eq!(ClientError::MissingRequestId.request_id(), None);
    }

    #[test]
    fn test_header_str_ignores_blank_values() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, "  ".parse().unwrap());
        headers.insert(TRACE_ID_HEADER, "Root=1-abc".parse().unwrap());

        assert_eq!(header_str(&headers, REQUEST_ID_HEADER), None);
        assert_eq!(header_str(&headers, TRACE_ID_HEADER).as_deref(), Some("Root=1-abc"));
        assert_eq!(header_str(&headers, DEADLINE_HEADER), None);
    }
}
