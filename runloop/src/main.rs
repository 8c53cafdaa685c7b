//! runloop - custom function runtime
//!
//! Resolves the configured handler once, then serves invocations from the
//! Lambda Runtime API until the platform stops the process.

mod config;

use anyhow::Context as _;
use clap::Parser;
use runloop_core::handler_spec::DEFAULT_HANDLER;
use runloop_core::{ErrorEnvelope, FunctionMetadata, HandlerSpec};
use runloop_runtime::resolver::DEFAULT_TASK_ROOT;
use runloop_runtime::{Handler, HandlerResolver, Runtime, RuntimeApiClient};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Error type posted to `/runtime/init/error` when startup fails
const INIT_ERROR_TYPE: &str = "Runtime.InitError";

#[derive(Parser, Debug)]
#[command(name = "runloop")]
#[command(about = "Custom runtime for the Lambda Runtime API", long_about = None)]
struct Args {
    /// Runtime API endpoint (host:port)
    #[arg(long, env = "AWS_LAMBDA_RUNTIME_API")]
    runtime_api: String,

    /// Handler specification (module.export)
    #[arg(long, default_value = DEFAULT_HANDLER, env = "_HANDLER")]
    handler: String,

    /// Directory handler modules are loaded from
    #[arg(long, default_value = DEFAULT_TASK_ROOT, env = "LAMBDA_TASK_ROOT")]
    task_root: PathBuf,

    /// Candidate extensions in probe order, e.g. ".ts,.js" (overrides config)
    #[arg(long, value_delimiter = ',')]
    extensions: Option<Vec<String>>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUNLOOP_LOG_LEVEL")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout belongs to the function
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "runloop={level},runloop_runtime={level},runloop_core={level}",
                    level = args.log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let client = RuntimeApiClient::new(&args.runtime_api)
        .context("Failed to create Runtime API client")?;

    info!("Starting runloop...");
    info!("  Runtime API: {}", args.runtime_api);
    info!("  Handler: {}", args.handler);
    info!("  Task root: {}", args.task_root.display());

    let handler = match load_handler(&args).await {
        Ok(handler) => handler,
        Err(err) => {
            error!(error = %format!("{:#}", err), "Runtime initialization failed");

            let envelope = ErrorEnvelope::new(INIT_ERROR_TYPE, format!("{:#}", err));
            if let Err(e) = client.post_init_error(&envelope).await {
                warn!(error = %e, "Failed to report initialization error");
            }
            return Err(err);
        }
    };

    let metadata = Arc::new(FunctionMetadata::from_env());
    info!(
        function_name = %metadata.function_name,
        function_version = %metadata.function_version,
        "Serving invocations"
    );

    let runtime = Runtime::new(client, handler, metadata);
    match runtime.run().await {}
}

async fn load_handler(args: &Args) -> anyhow::Result<Arc<dyn Handler>> {
    let spec: HandlerSpec = args
        .handler
        .parse()
        .with_context(|| format!("Invalid handler {:?}", args.handler))?;

    let config = config::Config::load(&args.task_root).context("Failed to load configuration")?;
    let extensions = args
        .extensions
        .clone()
        .unwrap_or_else(|| config.extensions.clone());

    let mut resolver = HandlerResolver::new(&args.task_root, Arc::new(config.process_loader()))
        .with_extensions(extensions);

    let handler = resolver.resolve(&spec).await.map_err(|err| {
        for attempt in err.attempts() {
            warn!("  {}", attempt);
        }
        err
    })?;

    Ok(handler)
}
