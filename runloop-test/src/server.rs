//! Mock Lambda Runtime API
//!
//! Serves scripted invocations on `GET /runtime/invocation/next` and records
//! every request the runtime makes, in arrival order.

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::debug;

/// Default time budget given to scripted invocations
pub const DEFAULT_TIMEOUT_MS: i64 = 3_000;

/// One event to hand out on the next poll
#[derive(Debug, Clone)]
pub struct ScriptedInvocation {
    pub request_id: Option<String>,
    pub deadline: Option<String>,
    pub function_arn: Option<String>,
    pub status: u16,
    pub body: String,
}

impl ScriptedInvocation {
    /// JSON event with a fresh request id and a deadline a few seconds out
    pub fn json(event: &Value) -> Self {
        let deadline = chrono::Utc::now().timestamp_millis() + DEFAULT_TIMEOUT_MS;
        Self {
            request_id: Some(uuid::Uuid::new_v4().to_string()),
            deadline: Some(deadline.to_string()),
            function_arn: Some("arn:aws:lambda:us-east-1:000000000000:function:test".to_string()),
            status: 200,
            body: event.to_string(),
        }
    }

    /// Event whose body is sent verbatim
    pub fn raw(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Self::json(&Value::Null)
        }
    }

    /// Poll answered with `status` and no invocation headers
    pub fn failing(status: u16) -> Self {
        Self {
            request_id: None,
            deadline: None,
            function_arn: None,
            status,
            body: String::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn without_request_id(mut self) -> Self {
        self.request_id = None;
        self
    }

    pub fn with_deadline(mut self, deadline: impl Into<String>) -> Self {
        self.deadline = Some(deadline.into());
        self
    }

    pub fn without_deadline(mut self) -> Self {
        self.deadline = None;
        self
    }
}

/// A request received by the mock
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCall {
    Next,
    Response {
        request_id: String,
        content_type: Option<String>,
        body: Value,
    },
    Error {
        request_id: String,
        error_type: Option<String>,
        body: Value,
    },
    InitError {
        error_type: Option<String>,
        body: Value,
    },
}

impl RecordedCall {
    pub fn is_next(&self) -> bool {
        matches!(self, Self::Next)
    }
}

struct MockState {
    invocation_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ScriptedInvocation>>,
    calls: Mutex<Vec<RecordedCall>>,
    changed: Notify,
}

impl MockState {
    fn record(&self, call: RecordedCall) {
        debug!(call = ?call, "Mock Runtime API received call");
        self.calls.lock().push(call);
        self.changed.notify_waiters();
    }
}

/// A running mock Runtime API bound to a random local port
pub struct MockRuntimeApi {
    addr: SocketAddr,
    invocation_tx: mpsc::UnboundedSender<ScriptedInvocation>,
    state: Arc<MockState>,
    handle: JoinHandle<()>,
}

impl MockRuntimeApi {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let (invocation_tx, invocation_rx) = mpsc::unbounded_channel();
        let state = Arc::new(MockState {
            invocation_rx: tokio::sync::Mutex::new(invocation_rx),
            calls: Mutex::new(Vec::new()),
            changed: Notify::new(),
        });

        let app = router(state.clone());
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "Mock Runtime API stopped");
            }
        });

        Ok(Self {
            addr,
            invocation_tx,
            state,
            handle,
        })
    }

    /// Value for `AWS_LAMBDA_RUNTIME_API`
    pub fn runtime_api(&self) -> String {
        self.addr.to_string()
    }

    /// Queue an invocation; returns its request id if it has one
    pub fn push(&self, invocation: ScriptedInvocation) -> Option<String> {
        let request_id = invocation.request_id.clone();
        // The receiver lives as long as the server state
        let _ = self.invocation_tx.send(invocation);
        request_id
    }

    pub fn push_json(&self, event: &Value) -> String {
        let invocation = ScriptedInvocation::json(event);
        let request_id = invocation.request_id.clone().unwrap_or_default();
        self.push(invocation);
        request_id
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.calls.lock().clone()
    }

    /// Wait until at least `count` calls were recorded, or `timeout` elapses
    pub async fn wait_for_calls(&self, count: usize, timeout: Duration) -> Vec<RecordedCall> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let changed = self.state.changed.notified();
            let calls = self.calls();
            if calls.len() >= count {
                return calls;
            }
            if tokio::time::timeout_at(deadline, changed).await.is_err() {
                return self.calls();
            }
        }
    }
}

impl Drop for MockRuntimeApi {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn router(state: Arc<MockState>) -> Router {
    Router::new()
        .route("/2018-06-01/runtime/invocation/next", get(next_invocation))
        .route(
            "/2018-06-01/runtime/invocation/:request_id/response",
            post(invocation_response),
        )
        .route(
            "/2018-06-01/runtime/invocation/:request_id/error",
            post(invocation_error),
        )
        .route("/2018-06-01/runtime/init/error", post(init_error))
        .with_state(state)
}

/// GET /runtime/invocation/next
///
/// Blocks until an invocation is queued.
async fn next_invocation(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    state.record(RecordedCall::Next);

    let invocation = {
        let mut rx = state.invocation_rx.lock().await;
        match rx.recv().await {
            Some(invocation) => invocation,
            None => {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    HeaderMap::new(),
                    Body::from("Invocation channel closed"),
                );
            }
        }
    };

    let mut headers = HeaderMap::new();
    insert_header(&mut headers, "lambda-runtime-aws-request-id", invocation.request_id);
    insert_header(&mut headers, "lambda-runtime-deadline-ms", invocation.deadline);
    insert_header(
        &mut headers,
        "lambda-runtime-invoked-function-arn",
        invocation.function_arn,
    );

    let status =
        StatusCode::from_u16(invocation.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, headers, Body::from(invocation.body))
}

/// POST /runtime/invocation/{requestId}/response
async fn invocation_response(
    State(state): State<Arc<MockState>>,
    Path(request_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    state.record(RecordedCall::Response {
        request_id,
        content_type: header_value(&headers, "content-type"),
        body: parse_body(&body),
    });
    StatusCode::ACCEPTED
}

/// POST /runtime/invocation/{requestId}/error
async fn invocation_error(
    State(state): State<Arc<MockState>>,
    Path(request_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    state.record(RecordedCall::Error {
        request_id,
        error_type: header_value(&headers, "lambda-runtime-function-error-type"),
        body: parse_body(&body),
    });
    StatusCode::ACCEPTED
}

/// POST /runtime/init/error
async fn init_error(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    state.record(RecordedCall::InitError {
        error_type: header_value(&headers, "lambda-runtime-function-error-type"),
        body: parse_body(&body),
    });
    StatusCode::ACCEPTED
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: Option<String>) {
    if let Some(value) = value.and_then(|v| HeaderValue::from_str(&v).ok()) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn parse_body(body: &[u8]) -> Value {
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}
