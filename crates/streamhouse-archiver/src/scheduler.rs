//! Fan-out scheduler.
//!
//! On every timer tick the scheduler lists the topic's partitions and fires
//! one asynchronous consumer invocation per partition. All dispatches run
//! concurrently; the scheduler waits until each one was accepted (or failed)
//! but never for the workers themselves.
//!
//! A failed dispatch only affects its own partition: the outcome is recorded
//! in the [`FanoutReport`] and the remaining partitions are still dispatched.
//! Only a failure to list partitions fails the whole run.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::PartitionSpec;
use crate::error::Result;
use crate::traits::{Invoker, PartitionLister};

/// The function the scheduler invokes for each partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionRef {
    pub name: String,
    /// Version or alias.
    pub qualifier: String,
}

/// One partition's worth of work for one timer tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionJob {
    pub partition_id: String,
    pub topic_ref: String,
    pub namespace: String,
    pub function_ref: FunctionRef,
}

/// Outcome of dispatching one partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionDispatch {
    pub partition: String,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of one fan-out run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FanoutReport {
    pub topic: String,
    pub dispatches: Vec<PartitionDispatch>,
}

impl FanoutReport {
    pub fn accepted(&self) -> usize {
        self.dispatches.iter().filter(|d| d.accepted).count()
    }

    pub fn failed(&self) -> usize {
        self.dispatches.len() - self.accepted()
    }
}

/// Dispatches one consumer invocation per partition.
pub struct FanoutScheduler {
    lister: Arc<dyn PartitionLister>,
    invoker: Arc<dyn Invoker>,
    namespace: String,
    function_ref: FunctionRef,
}

impl FanoutScheduler {
    pub fn new(
        lister: Arc<dyn PartitionLister>,
        invoker: Arc<dyn Invoker>,
        namespace: impl Into<String>,
        function_ref: FunctionRef,
    ) -> Self {
        Self {
            lister,
            invoker,
            namespace: namespace.into(),
            function_ref,
        }
    }

    /// List `topic`'s partitions and dispatch one worker per partition.
    #[tracing::instrument(skip(self), fields(function = %self.function_ref.name))]
    pub async fn run(&self, topic: &str) -> Result<FanoutReport> {
        let partitions = self.lister.list_partitions(topic).await.map_err(|e| {
            error!(topic = %topic, error = %e, "Failed to list partitions");
            e
        })?;

        if partitions.is_empty() {
            warn!(topic = %topic, "Topic has no partitions, nothing to dispatch");
        }

        let jobs: Vec<PartitionJob> = partitions
            .into_iter()
            .map(|partition_id| PartitionJob {
                partition_id,
                topic_ref: topic.to_string(),
                namespace: self.namespace.clone(),
                function_ref: self.function_ref.clone(),
            })
            .collect();

        let dispatches = join_all(jobs.iter().map(|job| async move {
            match self.invoker.invoke(job).await {
                Ok(()) => {
                    streamhouse_observability::metrics::ARCHIVER_DISPATCHES_TOTAL
                        .with_label_values(&["accepted"])
                        .inc();
                    PartitionDispatch {
                        partition: job.partition_id.clone(),
                        accepted: true,
                        error: None,
                    }
                }
                Err(e) => {
                    streamhouse_observability::metrics::ARCHIVER_DISPATCHES_TOTAL
                        .with_label_values(&["failed"])
                        .inc();
                    error!(
                        partition = %job.partition_id,
                        error = %e,
                        "Failed to dispatch partition worker"
                    );
                    PartitionDispatch {
                        partition: job.partition_id.clone(),
                        accepted: false,
                        error: Some(e.to_string()),
                    }
                }
            }
        }))
        .await;

        let report = FanoutReport {
            topic: topic.to_string(),
            dispatches,
        };
        info!(
            topic = %topic,
            accepted = report.accepted(),
            failed = report.failed(),
            "Fan-out complete"
        );
        Ok(report)
    }
}

/// Lister backed by configuration instead of broker metadata.
#[derive(Debug, Clone)]
pub struct StaticPartitionLister {
    spec: PartitionSpec,
}

impl StaticPartitionLister {
    pub fn new(spec: PartitionSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl PartitionLister for StaticPartitionLister {
    async fn list_partitions(&self, topic: &str) -> Result<Vec<String>> {
        Ok(match &self.spec {
            PartitionSpec::Count(n) => (0..*n)
                .map(|i| format!("{}-partition-{}", topic, i))
                .collect(),
            PartitionSpec::Names(names) => names.clone(),
        })
    }
}
