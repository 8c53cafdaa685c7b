//! Configuration management

use runloop_runtime::process::ProcessLoader;
use runloop_runtime::resolver::DEFAULT_EXTENSIONS;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Loader settings, read from `<task root>/runloop.toml` and `RUNLOOP_*`
/// environment variables
///
/// ```toml
/// extensions = [".ts", ".js"]
///
/// [interpreters]
/// ts = ["deno", "run", "-A", "--no-prompt", "{adapter}"]
/// py = ["python3"]
/// ```
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Extension -> command prefix, merged over the built-in table
    #[serde(default)]
    pub interpreters: HashMap<String, Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            interpreters: HashMap::new(),
        }
    }
}

fn default_extensions() -> Vec<String> {
    DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect()
}

impl Config {
    /// Load configuration from file and environment
    pub fn load(task_root: &Path) -> anyhow::Result<Self> {
        let file = task_root.join("runloop");

        let config = config::Config::builder()
            .add_source(config::File::with_name(&file.to_string_lossy()).required(false))
            .add_source(
                config::Environment::with_prefix("RUNLOOP")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("extensions"),
            )
            .build()?;

        Ok(config.try_deserialize::<Config>()?)
    }

    pub fn process_loader(&self) -> ProcessLoader {
        self.interpreters
            .iter()
            .fold(ProcessLoader::default(), |loader, (ext, command)| {
                loader.with_interpreter(ext, command.clone())
            })
    }
}
