//! In-process handler registry
//!
//! Rust handlers compiled into the bootstrap binary are registered under the
//! module path the resolver would probe, so a handler specification selects
//! them the same way it selects a script on disk.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::loader::{Export, Handler, LoadError, Module, ModuleLoader};

/// A module assembled in Rust
#[derive(Default)]
pub struct StaticModule {
    exports: HashMap<String, Export>,
    default: Option<Export>,
}

impl StaticModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_export(mut self, name: impl Into<String>, export: Export) -> Self {
        self.exports.insert(name.into(), export);
        self
    }

    pub fn with_handler(self, name: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.with_export(name, Export::callable(handler))
    }

    pub fn with_default(mut self, export: Export) -> Self {
        self.default = Some(export);
        self
    }

    pub fn with_default_handler(self, handler: impl Handler + 'static) -> Self {
        self.with_default(Export::callable(handler))
    }
}

impl Module for StaticModule {
    fn export(&self, name: &str) -> Option<Export> {
        self.exports.get(name).cloned()
    }

    fn default_export(&self) -> Option<Export> {
        self.default.clone()
    }
}

enum Entry {
    Loaded(Arc<StaticModule>),
    Broken(String),
}

/// [`ModuleLoader`] backed by modules registered in memory
#[derive(Default)]
pub struct ModuleRegistry {
    entries: HashMap<PathBuf, Entry>,
    attempts: Mutex<Vec<PathBuf>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module under a path such as `/var/task/mod.ts`
    pub fn register(mut self, path: impl Into<PathBuf>, module: StaticModule) -> Self {
        self.entries
            .insert(path.into(), Entry::Loaded(Arc::new(module)));
        self
    }

    /// Register a path whose load always fails, as a source file with a
    /// syntax or import error would
    pub fn register_broken(mut self, path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        self.entries.insert(path.into(), Entry::Broken(reason.into()));
        self
    }

    /// Paths passed to [`ModuleLoader::load`], in call order
    pub fn attempts(&self) -> Vec<PathBuf> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl ModuleLoader for ModuleRegistry {
    async fn load(&self, path: &Path) -> Result<Arc<dyn Module>, LoadError> {
        self.attempts.lock().push(path.to_path_buf());

        match self.entries.get(path) {
            Some(Entry::Loaded(module)) => {
                debug!(path = %path.display(), "Loaded registered module");
                let module: Arc<dyn Module> = module.clone();
                Ok(module)
            }
            Some(Entry::Broken(reason)) => Err(LoadError::invalid(path, reason.clone())),
            None => Err(LoadError::NotFound(path.to_path_buf())),
        }
    }
}
