//! Handler errors and the error envelope reported to the Runtime API

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type reported when nothing more specific is known
pub const DEFAULT_ERROR_TYPE: &str = "Error";

/// Error raised by a handler during an invocation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub error_type: String,
    pub message: String,
    pub stack_trace: Vec<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error_type: DEFAULT_ERROR_TYPE.to_string(),
            message: message.into(),
            stack_trace: Vec::new(),
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    /// Attach a multi-line stack trace; empty lines are dropped
    pub fn with_stack(mut self, stack: &str) -> Self {
        self.stack_trace = split_stack(stack);
        self
    }

    /// Capture a Rust error: its type name, its message, and its source chain
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error,
    {
        let mut stack_trace = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            stack_trace.push(format!("caused by: {}", cause));
            source = cause.source();
        }

        Self {
            error_type: short_type_name(std::any::type_name::<E>()).to_string(),
            message: err.to_string(),
            stack_trace,
        }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// Body of `POST /runtime/invocation/{requestId}/error`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEnvelope {
    pub error_type: String,
    pub error_message: String,
    #[serde(default)]
    pub stack_trace: Vec<String>,
}

impl ErrorEnvelope {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        let error_type = error_type.into();
        Self {
            error_type: if error_type.is_empty() {
                DEFAULT_ERROR_TYPE.to_string()
            } else {
                error_type
            },
            error_message: error_message.into(),
            stack_trace: Vec::new(),
        }
    }

    pub fn with_stack_trace(mut self, stack_trace: Vec<String>) -> Self {
        self.stack_trace = stack_trace;
        self
    }

    /// Envelope for a Rust error value
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error,
    {
        HandlerError::from_error(err).into()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<HandlerError> for ErrorEnvelope {
    fn from(err: HandlerError) -> Self {
        Self::new(err.error_type, err.message).with_stack_trace(err.stack_trace)
    }
}

impl From<ErrorEnvelope> for HandlerError {
    fn from(envelope: ErrorEnvelope) -> Self {
        Self {
            error_type: envelope.error_type,
            message: envelope.error_message,
            stack_trace: envelope.stack_trace,
        }
    }
}

/// Last path segment of a type name, without generic arguments
pub fn short_type_name(full: &str) -> &str {
    let base = full.split('<').next().unwrap_or(full);
    match base.rsplit("::").next() {
        Some(name) if !name.is_empty() => name,
        _ => DEFAULT_ERROR_TYPE,
    }
}

fn split_stack(stack: &str) -> Vec<String> {
    stack
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
