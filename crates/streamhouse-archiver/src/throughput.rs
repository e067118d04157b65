//! Upload throughput estimate.
//!
//! Holds the single bytes/second figure the flush policy uses to predict how
//! long the next upload will take. The estimate starts at a conservative seed
//! and is overwritten (not averaged) after every successful upload, so it
//! tracks the most recent transfer conditions.

use std::time::Duration;

/// Default seed: 10 MiB/s.
pub const DEFAULT_UPLOAD_BYTES_PER_SEC: f64 = 10.0 * 1024.0 * 1024.0;

/// Uploads shorter than this are measured as if they took this long.
const MIN_MEASURED_ELAPSED: Duration = Duration::from_secs(1);

/// Owned, per-worker estimate of sustained upload speed.
#[derive(Debug, Clone)]
pub struct ThroughputEstimator {
    bytes_per_sec: f64,
}

impl ThroughputEstimator {
    /// Create an estimator seeded with `initial_bytes_per_sec`.
    ///
    /// Non-positive or non-finite seeds fall back to the default.
    pub fn new(initial_bytes_per_sec: f64) -> Self {
        let bytes_per_sec = if initial_bytes_per_sec.is_finite() && initial_bytes_per_sec > 0.0 {
            initial_bytes_per_sec
        } else {
            DEFAULT_UPLOAD_BYTES_PER_SEC
        };
        Self { bytes_per_sec }
    }

    /// Current estimate in bytes/second.
    pub fn bytes_per_sec(&self) -> f64 {
        self.bytes_per_sec
    }

    /// Predicted wall time to upload `bytes` at the current estimate.
    ///
    /// Saturates at `Duration::MAX` when the estimate is too small to
    /// represent the result.
    pub fn predict(&self, bytes: u64) -> Duration {
        Duration::try_from_secs_f64(bytes as f64 / self.bytes_per_sec).unwrap_or(Duration::MAX)
    }

    /// Overwrite the estimate with the observed transfer rate.
    ///
    /// `elapsed` is floored to one second.
    pub fn record(&mut self, bytes: u64, elapsed: Duration) {
        let elapsed = elapsed.max(MIN_MEASURED_ELAPSED);
        let observed = bytes as f64 / elapsed.as_secs_f64();
        if observed > 0.0 {
            self.bytes_per_sec = observed;
        }
        tracing::debug!(
            bytes,
            elapsed_ms = elapsed.as_millis() as u64,
            mib_per_sec = self.bytes_per_sec / 1024.0 / 1024.0,
            "Upload throughput estimate updated"
        );
    }
}

impl Default for ThroughputEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_UPLOAD_BYTES_PER_SEC)
    }
}
