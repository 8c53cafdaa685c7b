//! Core types for runloop
//!
//! Shared by the runtime, the binary and the test-suite: the handler
//! specification, the invocation context and the error envelope.

pub mod context;
pub mod error;
pub mod handler_spec;

pub use context::{ContextPayload, FunctionMetadata, InvocationContext};
pub use error::{ErrorEnvelope, HandlerError};
pub use handler_spec::{HandlerSpec, SpecError};
