//! StreamHouse Archiver Binary
//!
//! Runs one invocation: reads the platform event, handles it and prints the
//! result as JSON on stdout. Logs go to stderr.
//!
//! # Environment Variables
//!
//! - `QUEUE_BACKEND`: `kafka` or `memory` (default: kafka)
//! - `QUEUE_ENDPOINT`, `QUEUE_CLUSTER`, `QUEUE_ENVIRONMENT`, `QUEUE_TOPIC`,
//!   `QUEUE_SUBSCRIPTION`: queue location (required)
//! - `BUCKET_NAME`, `BUCKET_REGION`: archive bucket (required)
//! - `INVOKE_ENDPOINT`: platform invoke API, required for timer events
//! - `FUNCTION_NAME`, `FUNCTION_NAMESPACE`, `FUNCTION_VERSION`,
//!   `TIME_LIMIT_MS`, `REQUEST_ID`: invocation context
//! - `CLOUD_SECRET_ID`, `CLOUD_SECRET_KEY`, `CLOUD_SESSION_TOKEN`: temporary
//!   storage credentials
//! - `RUST_LOG`: log level (default: info)
//!
//! # Example
//!
//! ```bash
//! export TIME_LIMIT_MS=900000
//! echo '{"invoke_type":"ConsumeGroupByPartition","topic_partition":"orders-partition-0"}' \
//!   | cargo run --bin archiver
//! ```

use std::io::Read;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use streamhouse_archiver::error::InvocationKind;
use streamhouse_archiver::sinks::Credentials;
use streamhouse_archiver::{
    ArchiverConfig, ArchiverError, InvocationContext, InvocationEvent, InvocationHandler,
    InvocationResult, PlatformBackends,
};
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "archiver")]
#[command(about = "Drain queue partitions into object storage", long_about = None)]
struct Cli {
    /// Event JSON, `@path` to read it from a file, or `-` for stdin
    #[arg(short, long, default_value = "-")]
    event: String,

    /// Context JSON or `@path`; fields set here override the environment
    #[arg(short, long)]
    context: Option<String>,
}

/// Resolve an inline, `@file` or `-` argument to its text.
fn read_arg(value: &str) -> Result<String> {
    if value == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read event from stdin")?;
        Ok(buf)
    } else if let Some(path) = value.strip_prefix('@') {
        std::fs::read_to_string(path).with_context(|| format!("failed to read '{}'", path))
    } else {
        Ok(value.to_string())
    }
}

fn load_context(arg: Option<&str>) -> Result<InvocationContext, ArchiverError> {
    let context = InvocationContext::from_env()?;
    match arg {
        Some(raw) => {
            let text = read_arg(raw).map_err(|e| ArchiverError::ConfigError(e.to_string()))?;
            let overlay: InvocationContext = serde_json::from_str(&text)?;
            Ok(context.overlay(overlay))
        }
        None => Ok(context),
    }
}

async fn run(cli: Cli, started_at: Instant) -> Result<InvocationResult> {
    let event_text = read_arg(&cli.event)?;
    let event = match InvocationEvent::from_json(&event_text) {
        Ok(event) => event,
        Err(e) => return Ok(InvocationResult::from_error(&e, InvocationKind::Consumer)),
    };
    let kind = event.invoke_type.kind();

    let context = match load_context(cli.context.as_deref()) {
        Ok(context) => context,
        Err(e) => return Ok(InvocationResult::from_error(&e, kind)),
    };
    let config = match ArchiverConfig::from_env() {
        Ok(config) => config,
        Err(e) => return Ok(InvocationResult::from_error(&e, kind)),
    };

    info!(
        invoke_type = ?event.invoke_type,
        request_id = %context.request_id,
        topic = %config.queue.topic,
        "StreamHouse archiver invoked"
    );

    let backends = PlatformBackends::new(&config, Credentials::from_env());
    let handler = InvocationHandler::new(config, backends);
    Ok(handler.handle(&event, &context, started_at).await)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let started_at = Instant::now();
    let cli = Cli::parse();

    streamhouse_observability::logging::init()?;
    streamhouse_observability::init_metrics();

    let result = run(cli, started_at).await?;
    println!("{}", serde_json::to_string(&result)?);

    match streamhouse_observability::encode_text() {
        Ok(snapshot) => debug!(%snapshot, "Metrics snapshot"),
        Err(e) => debug!(error = %e, "Failed to encode metrics"),
    }

    Ok(if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
