//! Invocation loop
//!
//! Fetches one event at a time, invokes the handler and reports the outcome.
//! A failed cycle never stops the loop.

use futures::FutureExt;
use runloop_core::{ErrorEnvelope, FunctionMetadata, HandlerError, InvocationContext};
use std::any::Any;
use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info_span, warn, Instrument};

use crate::client::{ClientError, NextInvocation, RuntimeApiClient};
use crate::loader::Handler;

/// Error type reported for a handler that panicked
pub const PANIC_ERROR_TYPE: &str = "Runtime.HandlerPanic";

/// What a single fetch/invoke/report cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The handler succeeded and its result was posted
    Succeeded { request_id: String },
    /// An error envelope was posted for the request
    Failed { request_id: String },
    /// The fetch failed before a request id was known; nothing was posted
    Unreported,
}

/// Process-wide runtime state, built once at startup
pub struct Runtime {
    client: RuntimeApiClient,
    handler: Arc<dyn Handler>,
    metadata: Arc<FunctionMetadata>,
}

impl Runtime {
    pub fn new(
        client: RuntimeApiClient,
        handler: Arc<dyn Handler>,
        metadata: Arc<FunctionMetadata>,
    ) -> Self {
        Self {
            client,
            handler,
            metadata,
        }
    }

    /// Serve invocations forever
    pub async fn run(&self) -> Infallible {
        loop {
            self.run_once().await;
        }
    }

    /// Run one fetch/invoke/report cycle
    pub async fn run_once(&self) -> CycleOutcome {
        let invocation = match self.client.next_invocation().await {
            Ok(invocation) => invocation,
            Err(err) => return self.report_fetch_failure(err).await,
        };

        let span = info_span!("invocation", request_id = %invocation.request_id);
        self.invoke(invocation).instrument(span).await
    }

    async fn invoke(&self, invocation: NextInvocation) -> CycleOutcome {
        let NextInvocation {
            request_id,
            deadline_ms,
            invoked_function_arn,
            trace_id,
            event,
        } = invocation;

        let context = InvocationContext::new(self.metadata.clone(), request_id.clone(), deadline_ms)
            .with_invoked_function_arn(invoked_function_arn)
            .with_trace_id(trace_id);

        debug!(deadline_ms, "Invoking handler");

        let result = AssertUnwindSafe(self.handler.call(event, context))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(panic_error(panic.as_ref())));

        let envelope = match result {
            Ok(value) => match self.client.post_response(&request_id, &value).await {
                Ok(()) => return CycleOutcome::Succeeded { request_id },
                Err(ClientError::Encode(e)) => ErrorEnvelope::from_error(&e),
                Err(e) => {
                    warn!(error = %e, "Failed to post invocation response");
                    return CycleOutcome::Succeeded { request_id };
                }
            },
            Err(err) => {
                debug!(error_type = %err.error_type, error = %err.message, "Handler failed");
                ErrorEnvelope::from(err)
            }
        };

        self.post_error(&request_id, &envelope).await;
        CycleOutcome::Failed { request_id }
    }

    async fn report_fetch_failure(&self, err: ClientError) -> CycleOutcome {
        match err.request_id() {
            Some(request_id) => {
                let request_id = request_id.to_string();
                warn!(request_id = %request_id, error = %err, "Failed to read invocation");

                let envelope = ErrorEnvelope::new(err.error_type(), err.to_string());
                self.post_error(&request_id, &envelope).await;
                CycleOutcome::Failed { request_id }
            }
            None => {
                // No request id to report against
                error!(error = %err, "Failed to fetch next invocation");
                CycleOutcome::Unreported
            }
        }
    }

    async fn post_error(&self, request_id: &str, envelope: &ErrorEnvelope) {
        if let Err(e) = self.client.post_error(request_id, envelope).await {
            warn!(request_id = %request_id, error = %e, "Failed to post invocation error");
        }
    }
}

fn panic_error(payload: &(dyn Any + Send)) -> HandlerError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string());

    HandlerError::new(message).with_type(PANIC_ERROR_TYPE)
}
