//! Run budget and flush policy.
//!
//! The host platform kills a worker once its time limit elapses, so every
//! decision the worker makes is checked against a [`RunBudget`]. The
//! [`FlushPolicy`] combines that budget with the buffer size and the
//! [`ThroughputEstimator`] to decide what the worker does next.
//!
//! ## Decision order
//!
//! 1. **Deadline**: `elapsed + safety_margin >= time_limit` stops the worker
//!    immediately; whatever is buffered is left unacknowledged.
//! 2. **Overrun prediction**: before any flush, `elapsed + safety_margin +
//!    predicted_upload >= time_limit` skips the upload and stops the worker.
//! 3. **Size/count trigger**: flush once the buffer reaches either limit.
//! 4. **Drain**: when the receive loop ends, flush whatever remains.
//!
//! Deadline awareness always wins over the size heuristics.

use std::time::Duration;

use tokio::time::Instant;

use crate::throughput::ThroughputEstimator;

/// Wall-clock allowance for one invocation.
#[derive(Debug, Clone, Copy)]
pub struct RunBudget {
    started_at: Instant,
    time_limit: Duration,
    safety_margin: Duration,
}

impl RunBudget {
    /// Budget starting now.
    pub fn new(time_limit: Duration, safety_margin: Duration) -> Self {
        Self::starting_at(Instant::now(), time_limit, safety_margin)
    }

    /// Budget starting at an earlier instant (the invocation start).
    pub fn starting_at(started_at: Instant, time_limit: Duration, safety_margin: Duration) -> Self {
        Self {
            started_at,
            time_limit,
            safety_margin,
        }
    }

    pub fn time_limit(&self) -> Duration {
        self.time_limit
    }

    pub fn safety_margin(&self) -> Duration {
        self.safety_margin
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// True once the worker must stop doing new work.
    pub fn deadline_reached(&self) -> bool {
        self.would_overrun(Duration::ZERO)
    }

    /// True if work taking `extra` more time would end inside the safety margin.
    pub fn would_overrun(&self, extra: Duration) -> bool {
        self.elapsed()
            .saturating_add(self.safety_margin)
            .saturating_add(extra)
            >= self.time_limit
    }

    /// Time left before the safety margin begins.
    pub fn remaining(&self) -> Duration {
        self.time_limit
            .saturating_sub(self.safety_margin)
            .saturating_sub(self.elapsed())
    }
}

/// Why the worker has to return without flushing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The budget is spent.
    Deadline,
    /// The predicted upload would not finish inside the budget.
    UploadWouldOverrun,
}

/// Outcome of one policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDecision {
    /// Keep receiving.
    Continue,
    /// Upload the spool now.
    Flush,
    /// Stop receiving and return; the buffer is abandoned.
    MustReturn(StopReason),
}

/// Size/count limits for a single flush.
#[derive(Debug, Clone, Copy)]
pub struct FlushPolicy {
    max_bytes_per_flush: u64,
    max_messages_per_flush: usize,
}

impl FlushPolicy {
    pub fn new(max_bytes_per_flush: u64, max_messages_per_flush: usize) -> Self {
        Self {
            max_bytes_per_flush: max_bytes_per_flush.max(1),
            max_messages_per_flush: max_messages_per_flush.max(1),
        }
    }

    pub fn max_bytes_per_flush(&self) -> u64 {
        self.max_bytes_per_flush
    }

    pub fn max_messages_per_flush(&self) -> usize {
        self.max_messages_per_flush
    }

    /// Checkpoint run before every receive.
    pub fn check_deadline(&self, budget: &RunBudget) -> Option<StopReason> {
        budget.deadline_reached().then_some(StopReason::Deadline)
    }

    /// Evaluate after a message was appended to the spool.
    pub fn evaluate(
        &self,
        buffered_bytes: u64,
        buffered_count: usize,
        budget: &RunBudget,
        estimator: &ThroughputEstimator,
    ) -> FlushDecision {
        if let Some(reason) = self.check_deadline(budget) {
            return FlushDecision::MustReturn(reason);
        }
        if buffered_bytes < self.max_bytes_per_flush
            && buffered_count < self.max_messages_per_flush
        {
            return FlushDecision::Continue;
        }
        Self::gate_upload(buffered_bytes, budget, estimator)
    }

    /// Evaluate once the receive loop ended with nothing more to read.
    ///
    /// Returns `Continue` when there is nothing to flush.
    pub fn evaluate_drain(
        &self,
        buffered_bytes: u64,
        buffered_count: usize,
        budget: &RunBudget,
        estimator: &ThroughputEstimator,
    ) -> FlushDecision {
        if buffered_count == 0 {
            return FlushDecision::Continue;
        }
        if let Some(reason) = self.check_deadline(budget) {
            return FlushDecision::MustReturn(reason);
        }
        Self::gate_upload(buffered_bytes, budget, estimator)
    }

    fn gate_upload(
        buffered_bytes: u64,
        budget: &RunBudget,
        estimator: &ThroughputEstimator,
    ) -> FlushDecision {
        let predicted = estimator.predict(buffered_bytes);
        if budget.would_overrun(predicted) {
            tracing::info!(
                buffered_bytes,
                predicted_upload_ms = predicted.as_millis() as u64,
                remaining_ms = budget.remaining().as_millis() as u64,
                "Upload may overrun the time limit, skipping flush"
            );
            FlushDecision::MustReturn(StopReason::UploadWouldOverrun)
        } else {
            FlushDecision::Flush
        }
    }
}
