//! Consumer worker.
//!
//! Drains one partition into object storage within one invocation's time
//! budget.
//!
//! ## States
//!
//! ```text
//! Connecting ─→ Seeking ─→ Consuming ⇄ Flushing
//!                  │           │
//!                  │           └─→ Draining ─→ Done
//!                  └─ no traffic ────────────→ Done
//! (any error) ─→ Fatal
//! ```
//!
//! Messages are appended to the spool in receive order. A flush uploads the
//! spool and only then acknowledges every id it holds, so an id is never
//! acknowledged before its bytes are stored. When the budget runs out the
//! buffered messages are left unacknowledged and will be redelivered to the
//! next invocation.
//!
//! The subscription is closed and the spool deleted on every exit path.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ArchiverConfig;
use crate::error::{ArchiverError, Result};
use crate::key::UploadKey;
use crate::policy::{FlushDecision, FlushPolicy, RunBudget, StopReason};
use crate::seek::{SeekOutcome, SeekPolicy};
use crate::spool::BufferSpool;
use crate::throughput::ThroughputEstimator;
use crate::traits::{ArchiveSink, Message, MessageSource, QueueConnector};

use streamhouse_observability::metrics::{
    ARCHIVER_ACK_FAILURES_TOTAL, ARCHIVER_FLUSHES_TOTAL, ARCHIVER_MESSAGES_ABANDONED_TOTAL,
    ARCHIVER_MESSAGES_ACKED_TOTAL, ARCHIVER_MESSAGES_RECEIVED_TOTAL,
};

/// Where the worker is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Connecting,
    Seeking,
    Consuming,
    Flushing,
    Draining,
    Done,
    Fatal,
}

/// Why a run ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitReason {
    /// The partition was drained and everything buffered was flushed.
    Drained,
    /// The seek probe received nothing.
    NoTraffic,
    /// The budget ran out; the buffer was abandoned.
    Deadline,
    /// The next upload would not have finished in time; the buffer was abandoned.
    UploadWouldOverrun,
}

impl From<StopReason> for ExitReason {
    fn from(reason: StopReason) -> Self {
        match reason {
            StopReason::Deadline => ExitReason::Deadline,
            StopReason::UploadWouldOverrun => ExitReason::UploadWouldOverrun,
        }
    }
}

impl ExitReason {
    fn label(&self) -> &'static str {
        match self {
            ExitReason::Drained => "drained",
            ExitReason::NoTraffic => "no_traffic",
            ExitReason::Deadline => "deadline",
            ExitReason::UploadWouldOverrun => "upload_would_overrun",
        }
    }
}

/// Summary of one worker run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub partition: String,
    /// Messages received, including a kept seek probe.
    pub received: u64,
    pub acked: u64,
    /// Acks that failed after their upload succeeded.
    pub ack_failures: u64,
    pub flushes: u64,
    /// Buffered messages left unacknowledged at the end.
    pub abandoned: u64,
    pub exit: ExitReason,
    pub uploaded_keys: Vec<String>,
}

impl WorkerReport {
    fn new(partition: &str) -> Self {
        Self {
            partition: partition.to_string(),
            received: 0,
            acked: 0,
            ack_failures: 0,
            flushes: 0,
            abandoned: 0,
            exit: ExitReason::Drained,
            uploaded_keys: Vec::new(),
        }
    }
}

/// Everything a worker needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub cluster: String,
    pub environment: String,
    pub topic: String,
    pub subscription: String,
    pub key_prefix: String,
    pub request_id: String,
    pub seek_policy: SeekPolicy,
    pub receive_timeout: Duration,
    pub probe_timeout: Duration,
    pub spool_path: PathBuf,
    pub flush_policy: FlushPolicy,
}

impl WorkerSettings {
    pub fn from_config(config: &ArchiverConfig, request_id: impl Into<String>) -> Self {
        Self {
            cluster: config.queue.cluster.clone(),
            environment: config.queue.environment.clone(),
            topic: config.queue.topic.clone(),
            subscription: config.queue.subscription.clone(),
            key_prefix: config.storage.key_prefix.clone(),
            request_id: request_id.into(),
            seek_policy: config.seek_policy,
            receive_timeout: config.flush.receive_timeout,
            probe_timeout: config.flush.probe_timeout,
            spool_path: config.flush.spool_path.clone(),
            flush_policy: FlushPolicy::new(
                config.flush.max_bytes_per_flush,
                config.flush.max_messages_per_flush,
            ),
        }
    }
}

/// Drains one partition per [`run`](ConsumerWorker::run).
pub struct ConsumerWorker {
    connector: Arc<dyn QueueConnector>,
    sink: Box<dyn ArchiveSink>,
    settings: WorkerSettings,
    estimator: ThroughputEstimator,
    state: WorkerState,
}

impl ConsumerWorker {
    pub fn new(
        connector: Arc<dyn QueueConnector>,
        sink: Box<dyn ArchiveSink>,
        settings: WorkerSettings,
        estimator: ThroughputEstimator,
    ) -> Self {
        Self {
            connector,
            sink,
            settings,
            estimator,
            state: WorkerState::Idle,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn estimator(&self) -> &ThroughputEstimator {
        &self.estimator
    }

    fn transition(&mut self, next: WorkerState) {
        debug!(from = ?self.state, to = ?next, "Worker state change");
        self.state = next;
    }

    /// Drain `partition` until it is empty or the budget is spent.
    #[tracing::instrument(skip(self, budget), fields(topic = %self.settings.topic))]
    pub async fn run(&mut self, partition: &str, budget: RunBudget) -> Result<WorkerReport> {
        self.transition(WorkerState::Connecting);
        let start = self.settings.seek_policy.start_position();
        let mut source = match self.connector.connect(partition, start).await {
            Ok(source) => source,
            Err(e) => {
                self.transition(WorkerState::Fatal);
                return Err(e);
            }
        };

        let mut spool = match BufferSpool::create(&self.settings.spool_path).await {
            Ok(spool) => spool,
            Err(e) => {
                self.transition(WorkerState::Fatal);
                close_source(source.as_mut()).await;
                return Err(e);
            }
        };

        let mut report = WorkerReport::new(partition);
        let outcome = self
            .drive(source.as_mut(), &mut spool, &budget, &mut report)
            .await;

        close_source(source.as_mut()).await;
        if let Err(e) = spool.destroy().await {
            warn!(partition = %partition, error = %e, "Failed to delete spool");
        }

        match outcome {
            Ok(exit) => {
                self.transition(WorkerState::Done);
                report.exit = exit;
                info!(
                    partition = %partition,
                    exit = exit.label(),
                    received = report.received,
                    acked = report.acked,
                    flushes = report.flushes,
                    abandoned = report.abandoned,
                    elapsed_ms = budget.elapsed().as_millis() as u64,
                    "Worker finished"
                );
                Ok(report)
            }
            Err(e) => {
                self.transition(WorkerState::Fatal);
                warn!(
                    partition = %partition,
                    error = %e,
                    kind = e.kind_label(),
                    received = report.received,
                    acked = report.acked,
                    "Worker failed"
                );
                Err(e)
            }
        }
    }

    async fn drive(
        &mut self,
        source: &mut dyn MessageSource,
        spool: &mut BufferSpool,
        budget: &RunBudget,
        report: &mut WorkerReport,
    ) -> Result<ExitReason> {
        self.transition(WorkerState::Seeking);
        let probe = match self
            .settings
            .seek_policy
            .apply(source, self.settings.probe_timeout)
            .await?
        {
            SeekOutcome::NoTraffic => return Ok(ExitReason::NoTraffic),
            SeekOutcome::Ready { probe } => probe,
        };

        self.transition(WorkerState::Consuming);
        if let Some(msg) = probe {
            if let Some(exit) = self.absorb(msg, source, spool, budget, report).await? {
                return Ok(exit);
            }
        }

        loop {
            if let Some(reason) = self.settings.flush_policy.check_deadline(budget) {
                return Ok(self.abandon(spool, reason, report));
            }
            let msg = match source.receive(self.settings.receive_timeout).await {
                Ok(msg) => msg,
                Err(ArchiverError::ReceiveTimeout) => break,
                Err(e) => return Err(e),
            };
            if let Some(exit) = self.absorb(msg, source, spool, budget, report).await? {
                return Ok(exit);
            }
        }

        self.transition(WorkerState::Draining);
        let decision = self.settings.flush_policy.evaluate_drain(
            spool.byte_size(),
            spool.len(),
            budget,
            &self.estimator,
        );
        match decision {
            FlushDecision::Continue => {}
            FlushDecision::Flush => self.flush(source, spool, report).await?,
            FlushDecision::MustReturn(reason) => {
                return Ok(self.abandon(spool, reason, report));
            }
        }
        Ok(ExitReason::Drained)
    }

    /// Buffer one message and act on the policy's decision.
    ///
    /// Returns `Some` when the worker must stop.
    async fn absorb(
        &mut self,
        msg: Message,
        source: &mut dyn MessageSource,
        spool: &mut BufferSpool,
        budget: &RunBudget,
        report: &mut WorkerReport,
    ) -> Result<Option<ExitReason>> {
        report.received += 1;
        ARCHIVER_MESSAGES_RECEIVED_TOTAL
            .with_label_values(&[report.partition.as_str()])
            .inc();

        spool.append(&msg.payload).await?;
        spool.record(msg.id, msg.publish_time_ms);

        let decision = self.settings.flush_policy.evaluate(
            spool.byte_size(),
            spool.len(),
            budget,
            &self.estimator,
        );
        match decision {
            FlushDecision::Continue => Ok(None),
            FlushDecision::Flush => {
                self.flush(source, spool, report).await?;
                Ok(None)
            }
            FlushDecision::MustReturn(reason) => Ok(Some(self.abandon(spool, reason, report))),
        }
    }

    async fn flush(
        &mut self,
        source: &mut dyn MessageSource,
        spool: &mut BufferSpool,
        report: &mut WorkerReport,
    ) -> Result<()> {
        let previous = self.state;
        self.transition(WorkerState::Flushing);
        let partition = report.partition.clone();

        spool.sync().await?;
        let key = UploadKey {
            prefix: self.settings.key_prefix.clone(),
            cluster: self.settings.cluster.clone(),
            environment: self.settings.environment.clone(),
            topic: self.settings.topic.clone(),
            subscription: self.settings.subscription.clone(),
            partition: partition.clone(),
            first_publish_ms: spool.first_publish_ms().unwrap_or(0),
            last_publish_ms: spool.last_publish_ms().unwrap_or(0),
            invocation_ms: now_ms(),
            request_id: self.settings.request_id.clone(),
        };

        let uploaded = match self
            .sink
            .upload(spool.path(), key, spool.byte_size(), &mut self.estimator)
            .await
        {
            Ok(uploaded) => uploaded,
            Err(e) => {
                ARCHIVER_FLUSHES_TOTAL
                    .with_label_values(&[partition.as_str(), "failed"])
                    .inc();
                return Err(e);
            }
        };
        ARCHIVER_FLUSHES_TOTAL
            .with_label_values(&[partition.as_str(), "uploaded"])
            .inc();
        report.flushes += 1;
        report.uploaded_keys.push(uploaded);

        let ids = spool.ids().to_vec();
        let count = ids.len() as u64;
        match source.ack_all(&ids).await {
            Ok(()) => {
                report.acked += count;
                ARCHIVER_MESSAGES_ACKED_TOTAL
                    .with_label_values(&[partition.as_str()])
                    .inc_by(count);
            }
            Err(e) => {
                // The data is stored; redelivery only produces a duplicate.
                report.ack_failures += count;
                ARCHIVER_ACK_FAILURES_TOTAL
                    .with_label_values(&[partition.as_str()])
                    .inc_by(count);
                warn!(partition = %partition, count, error = %e, "Failed to acknowledge flushed messages");
            }
        }

        spool.flush_reset().await?;
        self.transition(previous);
        Ok(())
    }

    fn abandon(
        &self,
        spool: &BufferSpool,
        reason: StopReason,
        report: &mut WorkerReport,
    ) -> ExitReason {
        let exit = ExitReason::from(reason);
        let count = spool.len() as u64;
        report.abandoned = count;
        if count > 0 {
            ARCHIVER_FLUSHES_TOTAL
                .with_label_values(&[report.partition.as_str(), "skipped"])
                .inc();
            ARCHIVER_MESSAGES_ABANDONED_TOTAL
                .with_label_values(&[report.partition.as_str(), exit.label()])
                .inc_by(count);
        }
        info!(
            partition = %report.partition,
            reason = exit.label(),
            abandoned = count,
            bytes = spool.byte_size(),
            "Returning before the time limit, buffered messages left for redelivery"
        );
        exit
    }
}

async fn close_source(source: &mut dyn MessageSource) {
    if let Err(e) = source.close().await {
        warn!(partition = %source.partition(), error = %e, "Failed to close subscription");
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
