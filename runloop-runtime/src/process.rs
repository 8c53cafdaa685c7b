//! Subprocess handler execution
//!
//! Handler modules that are not compiled into the runtime are run as child
//! processes. The module file is executed through an interpreter chosen by its
//! extension (`.ts` through Deno, `.js`/`.mjs` through Node by default); files
//! with an unmapped extension are executed directly.
//!
//! An interpreter command may contain the `{adapter}` argument. It is replaced
//! by the path of a bundled ES module adapter that imports the handler module
//! and speaks the protocol below on its behalf, so plain
//! `export async function handler(event, context)` modules load unchanged and
//! see a callable `context.getRemainingTimeInMillis()`. Commands without it run
//! the module file itself, which must then speak the protocol directly.
//!
//! The child speaks a small line-oriented JSON protocol selected by the
//! `RUNLOOP_MODE` environment variable:
//!
//! - `describe`: print `{"exports": {"<name>": "<kind>"}, "default": "<kind>"|null}`
//!   where `<kind>` is `"function"` for invocable exports.
//! - `invoke`: read `{"event": ..., "context": ...}` from stdin, call the
//!   export named by `RUNLOOP_EXPORT`, and print either `{"result": ...}` or
//!   `{"error": {"errorType", "errorMessage", "stackTrace"}}` as the last line
//!   of stdout. Earlier stdout lines are treated as handler logs.
//!
//! Handler stderr is inherited so its output reaches the platform logs.

use async_trait::async_trait;
use runloop_core::{ErrorEnvelope, HandlerError, InvocationContext};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::loader::{normalize_extension, Export, Handler, LoadError, Module, ModuleLoader};

pub const MODE_ENV: &str = "RUNLOOP_MODE";
pub const EXPORT_ENV: &str = "RUNLOOP_EXPORT";

/// Export name used when invoking a module's default export
pub const DEFAULT_EXPORT_NAME: &str = "default";

/// Interpreter argument replaced by the path of the module adapter
pub const ADAPTER_ARG: &str = "{adapter}";

const ADAPTER_SOURCE: &str = include_str!("adapter.mjs");

const FUNCTION_KIND: &str = "function";

/// Interpreter table used when nothing is configured
pub fn default_interpreters() -> HashMap<String, Vec<String>> {
    [
        (".ts", vec!["deno", "run", "-A", ADAPTER_ARG]),
        (".js", vec!["node", ADAPTER_ARG]),
        (".mjs", vec!["node", ADAPTER_ARG]),
    ]
    .into_iter()
    .map(|(ext, cmd)| (ext.to_string(), cmd.into_iter().map(String::from).collect()))
    .collect()
}

/// [`ModuleLoader`] that runs handler modules as child processes
#[derive(Debug, Clone)]
pub struct ProcessLoader {
    interpreters: HashMap<String, Vec<String>>,
    adapter: Arc<OnceCell<Arc<TempPath>>>,
}

impl Default for ProcessLoader {
    fn default() -> Self {
        Self::new(default_interpreters())
    }
}

impl ProcessLoader {
    /// `interpreters` maps an extension (with its leading dot) to a command
    /// prefix; the module path is appended as the final argument
    pub fn new(interpreters: HashMap<String, Vec<String>>) -> Self {
        let interpreters = interpreters
            .into_iter()
            .filter(|(_, cmd)| !cmd.is_empty())
            .map(|(ext, cmd)| (normalize_extension(&ext), cmd))
            .collect();

        Self {
            interpreters,
            adapter: Arc::new(OnceCell::new()),
        }
    }

    /// Map an extension to a command prefix; an empty command removes the
    /// mapping so matching files are executed directly
    pub fn with_interpreter(mut self, extension: &str, command: Vec<String>) -> Self {
        let extension = normalize_extension(extension);
        if command.is_empty() {
            self.interpreters.remove(&extension);
        } else {
            self.interpreters.insert(extension, command);
        }
        self
    }

    /// Full command line for a module path, before `{adapter}` substitution
    pub fn command_for(&self, path: &Path) -> Vec<String> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e));

        let mut command = extension
            .and_then(|ext| self.interpreters.get(&ext))
            .cloned()
            .unwrap_or_default();
        command.push(path.display().to_string());
        command
    }

    /// Path of the module adapter, written to a temporary file on first use
    pub async fn adapter_path(&self) -> std::io::Result<Arc<TempPath>> {
        let adapter = self
            .adapter
            .get_or_try_init(|| async {
                let file = tempfile::Builder::new()
                    .prefix("runloop-adapter-")
                    .suffix(".mjs")
                    .tempfile()?;
                let path = file.into_temp_path();
                tokio::fs::write(&path, ADAPTER_SOURCE).await?;
                debug!(path = %path.display(), "Wrote module adapter");
                Ok::<_, std::io::Error>(Arc::new(path))
            })
            .await?;

        Ok(adapter.clone())
    }
}

/// Output of the `describe` mode
#[derive(Debug, Default, Deserialize)]
struct Description {
    #[serde(default)]
    exports: HashMap<String, String>,
    #[serde(default)]
    default: Option<String>,
}

#[async_trait]
impl ModuleLoader for ProcessLoader {
    async fn load(&self, path: &Path) -> Result<Arc<dyn Module>, LoadError> {
        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => {}
            Ok(_) => return Err(LoadError::NotFound(path.to_path_buf())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LoadError::NotFound(path.to_path_buf()));
            }
            Err(source) => {
                return Err(LoadError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }

        let mut command = self.command_for(path);
        let adapter = if command.iter().any(|arg| arg.as_str() == ADAPTER_ARG) {
            let adapter = self.adapter_path().await.map_err(|source| LoadError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            let adapter_arg = adapter.display().to_string();
            for arg in command.iter_mut().filter(|arg| arg.as_str() == ADAPTER_ARG) {
                arg.clone_from(&adapter_arg);
            }
            Some(adapter)
        } else {
            None
        };

        let command: Arc<[String]> = command.into();
        debug!(command = ?command, "Describing handler module");

        let output = Command::new(&command[0])
            .args(&command[1..])
            .env(MODE_ENV, "describe")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| LoadError::invalid(path, format!("failed to start {}: {}", command[0], e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = match stderr.trim() {
                "" => format!("describe exited with {}", output.status),
                detail => detail.to_string(),
            };
            return Err(LoadError::invalid(path, reason));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = last_line(&stdout)
            .ok_or_else(|| LoadError::invalid(path, "describe produced no output"))?;
        let description: Description = serde_json::from_str(line)
            .map_err(|e| LoadError::invalid(path, format!("invalid describe output: {}", e)))?;

        debug!(
            path = %path.display(),
            exports = ?description.exports.keys().collect::<Vec<_>>(),
            "Loaded handler module"
        );

        let module: Arc<dyn Module> = Arc::new(ProcessModule {
            command,
            adapter,
            description,
        });
        Ok(module)
    }
}

struct ProcessModule {
    command: Arc<[String]>,
    adapter: Option<Arc<TempPath>>,
    description: Description,
}

impl ProcessModule {
    fn export_of(&self, name: &str, kind: &str) -> Export {
        if kind == FUNCTION_KIND {
            Export::callable(ProcessHandler {
                command: self.command.clone(),
                _adapter: self.adapter.clone(),
                export: name.to_string(),
            })
        } else {
            Export::opaque(kind)
        }
    }
}

impl Module for ProcessModule {
    fn export(&self, name: &str) -> Option<Export> {
        self.description
            .exports
            .get(name)
            .map(|kind| self.export_of(name, kind))
    }

    fn default_export(&self) -> Option<Export> {
        self.description
            .default
            .as_deref()
            .map(|kind| self.export_of(DEFAULT_EXPORT_NAME, kind))
    }
}

/// One export of a subprocess module
pub struct ProcessHandler {
    command: Arc<[String]>,
    // Keeps the adapter file on disk while the handler is in use
    _adapter: Option<Arc<TempPath>>,
    export: String,
}

#[async_trait]
impl Handler for ProcessHandler {
    async fn call(&self, event: Value, context: InvocationContext) -> Result<Value, HandlerError> {
        let request_id = context.aws_request_id.clone();
        let input = serde_json::to_vec(&json!({
            "event": event,
            "context": context.to_payload(),
        }))
        .map_err(|e| HandlerError::from_error(&e))?;

        let mut child = Command::new(&self.command[0])
            .args(&self.command[1..])
            .env(MODE_ENV, "invoke")
            .env(EXPORT_ENV, &self.export)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                HandlerError::new(format!("failed to start {}: {}", self.command[0], e))
                    .with_type("Runtime.ProcessSpawnError")
            })?;

        // Stdin is fed while stdout drains; either pipe can fill up
        let stdin = child.stdin.take();
        let write_input = async {
            if let Some(mut stdin) = stdin {
                // The child may exit without reading its input
                if let Err(e) = stdin.write_all(&input).await {
                    debug!(request_id = %request_id, error = %e, "Handler did not read its input");
                }
            }
        };
        let ((), output) = tokio::join!(write_input, child.wait_with_output());

        let output = output.map_err(|e| {
            HandlerError::new(format!("failed waiting for handler process: {}", e))
                .with_type("Runtime.ProcessError")
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let outcome = last_line(&stdout);

        for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if Some(line) != outcome {
                info!(request_id = %request_id, "{}", line);
            }
        }

        match outcome {
            Some(line) => parse_outcome(line, output.status),
            None => Err(missing_outcome(output.status)),
        }
    }
}

fn last_line(output: &str) -> Option<&str> {
    output.lines().rev().map(str::trim).find(|l| !l.is_empty())
}

fn parse_outcome(line: &str, status: ExitStatus) -> Result<Value, HandlerError> {
    let mut outcome = match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(map)) => map,
        _ if !status.success() => return Err(missing_outcome(status)),
        _ => {
            return Err(HandlerError::new(format!("invalid handler output: {}", line))
                .with_type("Runtime.InvalidResponse"));
        }
    };

    if let Some(error) = outcome.remove("error") {
        let envelope: ErrorEnvelope = serde_json::from_value(error).unwrap_or_else(|e| {
            warn!(error = %e, "Handler reported a malformed error");
            ErrorEnvelope::new("Error", "handler reported a malformed error")
        });
        return Err(envelope.into());
    }

    match outcome.remove("result") {
        Some(result) => Ok(result),
        None if !status.success() => Err(missing_outcome(status)),
        None => Err(HandlerError::new(format!("invalid handler output: {}", line))
            .with_type("Runtime.InvalidResponse")),
    }
}

fn missing_outcome(status: ExitStatus) -> HandlerError {
    if status.success() {
        HandlerError::new("handler process produced no result").with_type("Runtime.NoResult")
    } else {
        HandlerError::new(format!("handler process exited with {}", status))
            .with_type("Runtime.ExitError")
    }
}
