//! Function runtime for runloop
//!
//! Implements the runtime side of the Lambda Runtime API: resolve a handler
//! once, then fetch, invoke and report forever.

pub mod client;
pub mod dispatcher;
pub mod loader;
pub mod process;
pub mod registry;
pub mod resolver;

pub use client::{ClientError, NextInvocation, RuntimeApiClient};
pub use dispatcher::{CycleOutcome, Runtime};
pub use loader::{handler_fn, Export, Handler, LoadError, Module, ModuleLoader};
pub use process::ProcessLoader;
pub use registry::{ModuleRegistry, StaticModule};
pub use resolver::{HandlerResolver, ResolveError};
