//! Invocation context passed to handlers

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const FUNCTION_NAME_ENV: &str = "AWS_LAMBDA_FUNCTION_NAME";
pub const FUNCTION_VERSION_ENV: &str = "AWS_LAMBDA_FUNCTION_VERSION";
pub const FUNCTION_MEMORY_SIZE_ENV: &str = "AWS_LAMBDA_FUNCTION_MEMORY_SIZE";
pub const LOG_GROUP_NAME_ENV: &str = "AWS_LAMBDA_LOG_GROUP_NAME";
pub const LOG_STREAM_NAME_ENV: &str = "AWS_LAMBDA_LOG_STREAM_NAME";

/// Function metadata that stays fixed for the lifetime of the process
///
/// Values are taken verbatim from the environment; unset variables are empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionMetadata {
    pub function_name: String,
    pub function_version: String,
    pub memory_limit_in_mb: String,
    pub log_group_name: String,
    pub log_stream_name: String,
}

impl FunctionMetadata {
    /// Snapshot the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build metadata from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).unwrap_or_default();

        Self {
            function_name: get(FUNCTION_NAME_ENV),
            function_version: get(FUNCTION_VERSION_ENV),
            memory_limit_in_mb: get(FUNCTION_MEMORY_SIZE_ENV),
            log_group_name: get(LOG_GROUP_NAME_ENV),
            log_stream_name: get(LOG_STREAM_NAME_ENV),
        }
    }
}

/// Context for a single invocation
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub aws_request_id: String,
    pub invoked_function_arn: Option<String>,
    pub trace_id: Option<String>,
    /// Epoch milliseconds; `0` when the platform did not send a usable deadline
    pub deadline_ms: i64,
    metadata: Arc<FunctionMetadata>,
}

impl InvocationContext {
    pub fn new(
        metadata: Arc<FunctionMetadata>,
        request_id: impl Into<String>,
        deadline_ms: i64,
    ) -> Self {
        Self {
            aws_request_id: request_id.into(),
            invoked_function_arn: None,
            trace_id: None,
            deadline_ms,
            metadata,
        }
    }

    pub fn with_invoked_function_arn(mut self, arn: Option<String>) -> Self {
        self.invoked_function_arn = arn;
        self
    }

    pub fn with_trace_id(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn function_name(&self) -> &str {
        &self.metadata.function_name
    }

    pub fn function_version(&self) -> &str {
        &self.metadata.function_version
    }

    pub fn memory_limit_in_mb(&self) -> &str {
        &self.metadata.memory_limit_in_mb
    }

    pub fn metadata(&self) -> &FunctionMetadata {
        &self.metadata
    }

    /// Get remaining time in milliseconds
    ///
    /// Reads the clock on every call, so successive calls never increase.
    pub fn get_remaining_time_in_millis(&self) -> u64 {
        remaining_millis(self.deadline_ms, Utc::now().timestamp_millis())
    }

    /// Wire form handed across a process boundary
    pub fn to_payload(&self) -> ContextPayload {
        let optional = |value: &str| (!value.is_empty()).then(|| value.to_string());

        ContextPayload {
            aws_request_id: self.aws_request_id.clone(),
            function_name: self.metadata.function_name.clone(),
            function_version: self.metadata.function_version.clone(),
            memory_limit_in_mb: self.metadata.memory_limit_in_mb.clone(),
            deadline_ms: self.deadline_ms,
            invoked_function_arn: self.invoked_function_arn.clone(),
            trace_id: self.trace_id.clone(),
            log_group_name: optional(&self.metadata.log_group_name),
            log_stream_name: optional(&self.metadata.log_stream_name),
        }
    }
}

/// `max(0, deadline - now)`
pub fn remaining_millis(deadline_ms: i64, now_ms: i64) -> u64 {
    u64::try_from(deadline_ms.saturating_sub(now_ms)).unwrap_or(0)
}

/// Serialized context, as seen by out-of-process handlers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextPayload {
    pub aws_request_id: String,
    pub function_name: String,
    pub function_version: String,
    #[serde(rename = "memoryLimitInMB")]
    pub memory_limit_in_mb: String,
    pub deadline_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoked_function_arn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_group_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_stream_name: Option<String>,
}
