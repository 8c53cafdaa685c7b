//! Test utilities for runloop
//!
//! - [`MockRuntimeApi`]: a local Runtime API that hands out scripted events
//!   and records every call the runtime makes
//! - [`fixtures`]: shell-script handler modules for the subprocess loader
//!
//! ## Usage
//!
//! ```rust,no_run
//! use runloop_test::MockRuntimeApi;
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn example() -> std::io::Result<()> {
//! let api = MockRuntimeApi::start().await?;
//! let request_id = api.push_json(&json!({"hello": "world"}));
//!
//! // point AWS_LAMBDA_RUNTIME_API at api.runtime_api() and run the runtime
//!
//! let calls = api.wait_for_calls(2, Duration::from_secs(5)).await;
//! # let _ = (request_id, calls);
//! # Ok(())
//! # }
//! ```

pub mod fixtures;
pub mod server;

pub use server::{MockRuntimeApi, RecordedCall, ScriptedInvocation};

/// How long tests wait for the runtime to reach the mock
pub const CALL_TIMEOUT_SECS: u64 = 10;
