use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Parse a level from a `RUST_LOG`-style value, falling back to `INFO`.
pub fn parse_level(value: Option<&str>) -> Level {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(Level::INFO)
}

/// Install the global `tracing` subscriber.
///
/// The level comes from `RUST_LOG` (default `info`). Output goes to stderr so
/// stdout stays free for the invocation result.
pub fn init() -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let log_level = parse_level(std::env::var("RUST_LOG").ok().as_deref());

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
}
