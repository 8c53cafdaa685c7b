//! Handler loading
//!
//! A [`ModuleLoader`] turns a module file path into a [`Module`], whose named
//! or default export may be an invocable [`Handler`]. The resolver only sees
//! these traits, so handlers can live in-process ([`crate::registry`]) or
//! behind a subprocess boundary ([`crate::process`]).

use async_trait::async_trait;
use runloop_core::{HandlerError, InvocationContext};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// A user function invoked once per event
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, event: Value, context: InvocationContext) -> Result<Value, HandlerError>;
}

/// Value found under an export name
#[derive(Clone)]
pub enum Export {
    /// Something that can be invoked with `(event, context)`
    Callable(Arc<dyn Handler>),
    /// Any other value; `kind` describes it for diagnostics
    Opaque { kind: String },
}

impl Export {
    pub fn callable(handler: impl Handler + 'static) -> Self {
        Self::Callable(Arc::new(handler))
    }

    pub fn opaque(kind: impl Into<String>) -> Self {
        Self::Opaque { kind: kind.into() }
    }

    pub fn into_handler(self) -> Option<Arc<dyn Handler>> {
        match self {
            Self::Callable(handler) => Some(handler),
            Self::Opaque { .. } => None,
        }
    }
}

impl std::fmt::Debug for Export {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Callable(_) => f.write_str("Export::Callable"),
            Self::Opaque { kind } => write!(f, "Export::Opaque({})", kind),
        }
    }
}

/// A loaded module
pub trait Module: Send + Sync {
    /// Named export
    fn export(&self, name: &str) -> Option<Export>;

    /// Default export, consulted when the named export is absent
    fn default_export(&self) -> Option<Export>;
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Module not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to load {}: {reason}", .path.display())]
    Invalid { path: PathBuf, reason: String },

    #[error("IO error loading {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LoadError {
    pub fn invalid(path: &Path, reason: impl Into<String>) -> Self {
        Self::Invalid {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// Strategy for loading a module from a file path
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    async fn load(&self, path: &Path) -> Result<Arc<dyn Module>, LoadError>;
}

/// Module file extension with its leading dot (`"ts"` becomes `".ts"`);
/// an empty extension stays empty and names the bare module file
pub fn normalize_extension(extension: &str) -> String {
    let extension = extension.trim();
    if extension.is_empty() || extension.starts_with('.') {
        extension.to_string()
    } else {
        format!(".{}", extension)
    }
}

/// Handler built from an async closure by [`handler_fn`]
pub struct HandlerFn<F, T> {
    f: F,
    _output: PhantomData<fn() -> T>,
}

/// Wrap an async closure as a [`Handler`]
///
/// The closure may return any serializable value; a value that fails to
/// encode as JSON is reported as a handler error.
///
/// ```
/// use runloop_runtime::loader::handler_fn;
/// use runloop_core::{HandlerError, InvocationContext};
/// use serde_json::{json, Value};
///
/// let handler = handler_fn(|event: Value, _ctx: InvocationContext| async move {
///     Ok::<_, HandlerError>(json!({ "echo": event }))
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut, T, E>(f: F) -> HandlerFn<F, T>
where
    F: Fn(Value, InvocationContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Serialize + Send + 'static,
    E: Into<HandlerError> + Send + 'static,
{
    HandlerFn {
        f,
        _output: PhantomData,
    }
}

#[async_trait]
impl<F, Fut, T, E> Handler for HandlerFn<F, T>
where
    F: Fn(Value, InvocationContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Serialize + Send + 'static,
    E: Into<HandlerError> + Send + 'static,
{
    async fn call(&self, event: Value, context: InvocationContext) -> Result<Value, HandlerError> {
        let output = (self.f)(event, context).await.map_err(Into::into)?;
        serde_json::to_value(output).map_err(|e| HandlerError::from_error(&e))
    }
}
