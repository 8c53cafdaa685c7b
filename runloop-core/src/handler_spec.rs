//! Handler specification parsing
//!
//! A handler specification names the module to load and the export to call,
//! written as `module.export` (for example `mod.handler`).

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Export used when the specification names only a module
pub const DEFAULT_EXPORT: &str = "handler";

/// Specification used when the platform does not provide one
pub const DEFAULT_HANDLER: &str = "mod.handler";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("Handler specification is empty")]
    Empty,

    #[error("Handler specification {0:?} has no module name")]
    MissingModule(String),
}

/// Parsed `module.export` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerSpec {
    module_name: String,
    export_name: String,
}

impl HandlerSpec {
    /// Parse a specification, splitting on the first `.`
    pub fn parse(spec: &str) -> Result<Self, SpecError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(SpecError::Empty);
        }

        let (module, export) = match spec.split_once('.') {
            Some((module, export)) => (module, export),
            None => (spec, ""),
        };

        if module.is_empty() {
            return Err(SpecError::MissingModule(spec.to_string()));
        }

        let export = if export.is_empty() {
            DEFAULT_EXPORT
        } else {
            export
        };

        Ok(Self {
            module_name: module.to_string(),
            export_name: export.to_string(),
        })
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn export_name(&self) -> &str {
        &self.export_name
    }
}

impl Default for HandlerSpec {
    fn default() -> Self {
        Self {
            module_name: "mod".to_string(),
            export_name: DEFAULT_EXPORT.to_string(),
        }
    }
}

impl FromStr for HandlerSpec {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for HandlerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module_name, self.export_name)
    }
}
