//! StreamHouse Observability
//!
//! Metrics and logging for the StreamHouse archiver.
//!
//! # Features
//!
//! - Prometheus metrics registry for the consumer worker, uploads and fan-out
//! - Text-format snapshot of all metrics
//! - `tracing` subscriber setup
//!
//! # Usage
//!
//! ```no_run
//! use streamhouse_observability::{exporter, logging, metrics};
//!
//! logging::init().expect("subscriber installed once");
//! metrics::init();
//!
//! // ... handle the invocation ...
//!
//! let snapshot = exporter::encode_text().unwrap_or_default();
//! tracing::debug!(%snapshot, "metrics");
//! ```

pub mod exporter;
pub mod logging;
pub mod metrics;

// Re-export commonly used items
pub use exporter::encode_text;
pub use metrics::{init as init_metrics, REGISTRY};

/// Initialize all observability components except the log subscriber,
/// which the binary installs itself.
pub fn init() {
    metrics::init();
}
