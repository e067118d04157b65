use lazy_static::lazy_static;
use prometheus::{
    GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Consumer Worker Metrics
    // ============================================================================

    /// Messages received from the queue (including the seek probe)
    pub static ref ARCHIVER_MESSAGES_RECEIVED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("streamhouse_archiver_messages_received_total", "Total messages received"),
        &["partition"]
    ).expect("metric can be created");

    /// Messages acknowledged after a successful upload
    pub static ref ARCHIVER_MESSAGES_ACKED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("streamhouse_archiver_messages_acked_total", "Total messages acknowledged"),
        &["partition"]
    ).expect("metric can be created");

    /// Acknowledgement failures after a successful upload
    pub static ref ARCHIVER_ACK_FAILURES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("streamhouse_archiver_ack_failures_total", "Total failed acknowledgements"),
        &["partition"]
    ).expect("metric can be created");

    /// Buffered messages left unacknowledged when the worker had to return
    pub static ref ARCHIVER_MESSAGES_ABANDONED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "streamhouse_archiver_messages_abandoned_total",
            "Total buffered messages abandoned for redelivery"
        ),
        &["partition", "reason"]
    ).expect("metric can be created");

    /// Flush attempts by outcome (uploaded, failed, skipped)
    pub static ref ARCHIVER_FLUSHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("streamhouse_archiver_flushes_total", "Total flush attempts"),
        &["partition", "outcome"]
    ).expect("metric can be created");

    // ============================================================================
    // Upload Metrics
    // ============================================================================

    /// Bytes written to object storage
    pub static ref ARCHIVER_UPLOAD_BYTES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("streamhouse_archiver_upload_bytes_total", "Total bytes uploaded"),
        &["partition"]
    ).expect("metric can be created");

    /// Upload latency
    pub static ref ARCHIVER_UPLOAD_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("streamhouse_archiver_upload_latency_seconds", "Upload latency in seconds")
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["method"]
    ).expect("metric can be created");

    /// Current upload throughput estimate
    pub static ref ARCHIVER_UPLOAD_THROUGHPUT: GaugeVec = GaugeVec::new(
        Opts::new(
            "streamhouse_archiver_upload_throughput_bytes_per_second",
            "Upload throughput estimate in bytes per second"
        ),
        &["partition"]
    ).expect("metric can be created");

    /// Upload errors
    pub static ref ARCHIVER_UPLOAD_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("streamhouse_archiver_upload_errors_total", "Total upload errors"),
        &["stage"]
    ).expect("metric can be created");

    // ============================================================================
    // Scheduler / Invocation Metrics
    // ============================================================================

    /// Fan-out dispatches by outcome (accepted, failed)
    pub static ref ARCHIVER_DISPATCHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("streamhouse_archiver_dispatches_total", "Total partition dispatches"),
        &["outcome"]
    ).expect("metric can be created");

    /// Invocations handled, by event type and result code
    pub static ref ARCHIVER_INVOCATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("streamhouse_archiver_invocations_total", "Total invocations handled"),
        &["invoke_type", "code"]
    ).expect("metric can be created");
}

/// Register all metrics with the global registry. Safe to call repeatedly.
pub fn init() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(ARCHIVER_MESSAGES_RECEIVED_TOTAL.clone()))
            .expect("messages_received_total can be registered");
        REGISTRY
            .register(Box::new(ARCHIVER_MESSAGES_ACKED_TOTAL.clone()))
            .expect("messages_acked_total can be registered");
        REGISTRY
            .register(Box::new(ARCHIVER_ACK_FAILURES_TOTAL.clone()))
            .expect("ack_failures_total can be registered");
        REGISTRY
            .register(Box::new(ARCHIVER_MESSAGES_ABANDONED_TOTAL.clone()))
            .expect("messages_abandoned_total can be registered");
        REGISTRY
            .register(Box::new(ARCHIVER_FLUSHES_TOTAL.clone()))
            .expect("flushes_total can be registered");

        REGISTRY
            .register(Box::new(ARCHIVER_UPLOAD_BYTES_TOTAL.clone()))
            .expect("upload_bytes_total can be registered");
        REGISTRY
            .register(Box::new(ARCHIVER_UPLOAD_LATENCY.clone()))
            .expect("upload_latency can be registered");
        REGISTRY
            .register(Box::new(ARCHIVER_UPLOAD_THROUGHPUT.clone()))
            .expect("upload_throughput can be registered");
        REGISTRY
            .register(Box::new(ARCHIVER_UPLOAD_ERRORS_TOTAL.clone()))
            .expect("upload_errors_total can be registered");

        REGISTRY
            .register(Box::new(ARCHIVER_DISPATCHES_TOTAL.clone()))
            .expect("dispatches_total can be registered");
        REGISTRY
            .register(Box::new(ARCHIVER_INVOCATIONS_TOTAL.clone()))
            .expect("invocations_total can be registered");
    });
}
