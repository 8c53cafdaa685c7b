//! Handler resolution
//!
//! Turns a [`HandlerSpec`] into an invocable handler by probing
//! `<root>/<module><ext>` for each candidate extension in order.

use runloop_core::HandlerSpec;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::loader::{normalize_extension, Export, Handler, Module, ModuleLoader};

/// Candidate extensions, in the order they are tried
pub const DEFAULT_EXTENSIONS: &[&str] = &[".ts", ".js", ".mjs"];

/// Handler root used by the platform
pub const DEFAULT_TASK_ROOT: &str = "/var/task";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Handler \"{export}\" not found in {module}")]
    NotFound {
        export: String,
        module: String,
        /// One line per candidate explaining why it did not match
        attempts: Vec<String>,
    },
}

impl ResolveError {
    pub fn attempts(&self) -> &[String] {
        match self {
            Self::NotFound { attempts, .. } => attempts,
        }
    }
}

/// Resolves handler specifications against a task root
pub struct HandlerResolver {
    root: PathBuf,
    extensions: Vec<String>,
    loader: Arc<dyn ModuleLoader>,
    cache: HashMap<PathBuf, Arc<dyn Module>>,
}

impl HandlerResolver {
    pub fn new(root: impl Into<PathBuf>, loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            root: root.into(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            loader,
            cache: HashMap::new(),
        }
    }

    /// Replace the candidate extensions; order is preserved and a missing
    /// leading dot is added
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extensions = extensions
            .into_iter()
            .map(|ext| normalize_extension(ext.as_ref()))
            .collect();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Candidate module paths for a specification, in probe order
    pub fn candidates(&self, spec: &HandlerSpec) -> Vec<PathBuf> {
        self.extensions
            .iter()
            .map(|ext| self.root.join(format!("{}{}", spec.module_name(), ext)))
            .collect()
    }

    /// Resolve the handler, stopping at the first candidate with an
    /// invocable export
    pub async fn resolve(&mut self, spec: &HandlerSpec) -> Result<Arc<dyn Handler>, ResolveError> {
        let mut attempts = Vec::new();

        for path in self.candidates(spec) {
            let module = match self.cached_or_load(&path).await {
                Ok(module) => module,
                Err(reason) => {
                    debug!(path = %path.display(), reason = %reason, "Skipping handler candidate");
                    attempts.push(format!("{}: {}", path.display(), reason));
                    continue;
                }
            };

            match pick_export(module.as_ref(), spec.export_name()) {
                Ok(handler) => {
                    info!(handler = %spec, path = %path.display(), "Resolved handler");
                    return Ok(handler);
                }
                Err(reason) => {
                    debug!(path = %path.display(), reason = %reason, "Skipping handler candidate");
                    attempts.push(format!("{}: {}", path.display(), reason));
                }
            }
        }

        Err(ResolveError::NotFound {
            export: spec.export_name().to_string(),
            module: spec.module_name().to_string(),
            attempts,
        })
    }

    async fn cached_or_load(&mut self, path: &Path) -> Result<Arc<dyn Module>, String> {
        if let Some(module) = self.cache.get(path) {
            return Ok(module.clone());
        }

        let module = self
            .loader
            .load(path)
            .await
            .map_err(|e| e.to_string())?;
        self.cache.insert(path.to_path_buf(), module.clone());
        Ok(module)
    }
}

/// Named export first, then the default export
fn pick_export(module: &dyn Module, name: &str) -> Result<Arc<dyn Handler>, String> {
    let export = module
        .export(name)
        .or_else(|| module.default_export())
        .ok_or_else(|| format!("no export \"{}\" and no default export", name))?;

    match export {
        Export::Callable(handler) => Ok(handler),
        Export::Opaque { kind } => Err(format!("export \"{}\" is a {}, not a function", name, kind)),
    }
}
