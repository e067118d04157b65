use prometheus::{Encoder, TextEncoder};

use crate::metrics::REGISTRY;

/// Encode every registered metric in the Prometheus text format.
///
/// The archiver runs as a short-lived function and has no scrape endpoint;
/// it logs this snapshot at the end of an invocation instead.
pub fn encode_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
