//! Invocation handling.
//!
//! The host platform calls the function with an event and a context. A
//! `Timer` event fans out one consumer invocation per partition; a
//! `ConsumeGroupByPartition` event drains the partition it names. Every
//! invocation ends in an [`InvocationResult`] whose code tells the platform
//! whether it succeeded.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info};

use crate::config::ArchiverConfig;
use crate::error::{ArchiverError, InvocationKind, Result, ResultCode};
use crate::policy::RunBudget;
use crate::runtime::Backends;
use crate::scheduler::{FanoutReport, FanoutScheduler, FunctionRef};
use crate::throughput::ThroughputEstimator;
use crate::worker::{ConsumerWorker, WorkerReport, WorkerSettings};

/// What an invocation was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvokeType {
    Timer,
    ConsumeGroupByPartition,
}

impl InvokeType {
    pub fn kind(&self) -> InvocationKind {
        match self {
            InvokeType::Timer => InvocationKind::Timer,
            InvokeType::ConsumeGroupByPartition => InvocationKind::Consumer,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            InvokeType::Timer => "timer",
            InvokeType::ConsumeGroupByPartition => "consume",
        }
    }
}

/// The event payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationEvent {
    pub invoke_type: InvokeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_partition: Option<String>,
}

impl InvocationEvent {
    pub fn timer() -> Self {
        Self {
            invoke_type: InvokeType::Timer,
            topic_partition: None,
        }
    }

    /// The event the scheduler sends to a partition worker.
    pub fn consume_partition(partition: impl Into<String>) -> Self {
        Self {
            invoke_type: InvokeType::ConsumeGroupByPartition,
            topic_partition: Some(partition.into()),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Facts about the running invocation supplied by the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvocationContext {
    pub time_limit_in_ms: u64,
    pub request_id: String,
    pub function_name: String,
    pub namespace: String,
    pub function_version: String,
}

impl InvocationContext {
    /// Read `FUNCTION_NAME`, `FUNCTION_NAMESPACE`, `FUNCTION_VERSION`,
    /// `TIME_LIMIT_MS` and `REQUEST_ID`.
    ///
    /// Namespace defaults to `default`, version to `$LATEST`, and a missing
    /// request id is generated.
    pub fn from_config_map(config: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| {
            config
                .get(key)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        let time_limit_in_ms = get("TIME_LIMIT_MS")
            .map(|s| {
                s.parse::<u64>().map_err(|e| {
                    ArchiverError::ConfigError(format!("invalid TIME_LIMIT_MS: {}", e))
                })
            })
            .transpose()?
            .unwrap_or(0);

        Ok(Self {
            time_limit_in_ms,
            request_id: get("REQUEST_ID").unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            function_name: get("FUNCTION_NAME").unwrap_or_default(),
            namespace: get("FUNCTION_NAMESPACE").unwrap_or_else(|| "default".to_string()),
            function_version: get("FUNCTION_VERSION").unwrap_or_else(|| "$LATEST".to_string()),
        })
    }

    pub fn from_env() -> Result<Self> {
        let map: HashMap<String, String> = std::env::vars().collect();
        Self::from_config_map(&map)
    }

    /// Replace fields with the non-empty values of `other`.
    pub fn overlay(mut self, other: InvocationContext) -> Self {
        if other.time_limit_in_ms > 0 {
            self.time_limit_in_ms = other.time_limit_in_ms;
        }
        if !other.request_id.is_empty() {
            self.request_id = other.request_id;
        }
        if !other.function_name.is_empty() {
            self.function_name = other.function_name;
        }
        if !other.namespace.is_empty() {
            self.namespace = other.namespace;
        }
        if !other.function_version.is_empty() {
            self.function_version = other.function_version;
        }
        self
    }
}

/// Report attached to a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum InvocationReport {
    Worker(WorkerReport),
    Fanout(FanoutReport),
}

/// What the function returns to the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationResult {
    pub code: ResultCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<InvocationReport>,
}

impl InvocationResult {
    pub fn success(report: InvocationReport) -> Self {
        Self {
            code: ResultCode::Success,
            message: None,
            report: Some(report),
        }
    }

    pub fn from_error(err: &ArchiverError, kind: InvocationKind) -> Self {
        Self {
            code: err.result_code(kind),
            message: Some(err.to_string()),
            report: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == ResultCode::Success
    }
}

/// Dispatches events to the scheduler or a consumer worker.
pub struct InvocationHandler<B> {
    config: ArchiverConfig,
    backends: B,
}

impl<B: Backends> InvocationHandler<B> {
    pub fn new(config: ArchiverConfig, backends: B) -> Self {
        Self { config, backends }
    }

    pub fn config(&self) -> &ArchiverConfig {
        &self.config
    }

    /// Handle one event. `started_at` is when the platform started the
    /// invocation; the time budget counts from there.
    pub async fn handle(
        &self,
        event: &InvocationEvent,
        context: &InvocationContext,
        started_at: Instant,
    ) -> InvocationResult {
        let kind = event.invoke_type.kind();
        let outcome = match event.invoke_type {
            InvokeType::Timer => self.fan_out(context).await.map(InvocationReport::Fanout),
            InvokeType::ConsumeGroupByPartition => self
                .consume(event, context, started_at)
                .await
                .map(InvocationReport::Worker),
        };

        let result = match outcome {
            Ok(report) => InvocationResult::success(report),
            Err(e) => {
                error!(
                    invoke_type = event.invoke_type.label(),
                    request_id = %context.request_id,
                    error = %e,
                    "Invocation failed"
                );
                InvocationResult::from_error(&e, kind)
            }
        };

        streamhouse_observability::metrics::ARCHIVER_INVOCATIONS_TOTAL
            .with_label_values(&[event.invoke_type.label(), &result.code.to_string()])
            .inc();
        result
    }

    async fn fan_out(&self, context: &InvocationContext) -> Result<FanoutReport> {
        if context.function_name.is_empty() {
            return Err(ArchiverError::ConfigError(
                "function name is required to dispatch partition workers".to_string(),
            ));
        }
        let lister = self.backends.partition_lister(&self.config)?;
        let invoker = self.backends.invoker(&self.config)?;
        let scheduler = FanoutScheduler::new(
            lister,
            invoker,
            context.namespace.clone(),
            FunctionRef {
                name: context.function_name.clone(),
                qualifier: context.function_version.clone(),
            },
        );
        scheduler.run(&self.config.queue.topic).await
    }

    async fn consume(
        &self,
        event: &InvocationEvent,
        context: &InvocationContext,
        started_at: Instant,
    ) -> Result<WorkerReport> {
        let partition = event
            .topic_partition
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| {
                ArchiverError::ConfigError("event is missing 'topic_partition'".to_string())
            })?;
        if context.time_limit_in_ms == 0 {
            return Err(ArchiverError::ConfigError(
                "time limit must be greater than zero".to_string(),
            ));
        }

        let budget = RunBudget::starting_at(
            started_at,
            Duration::from_millis(context.time_limit_in_ms),
            self.config.flush.safety_margin,
        );
        info!(
            partition = %partition,
            request_id = %context.request_id,
            time_limit_ms = context.time_limit_in_ms,
            "Consuming partition"
        );

        let connector = self.backends.queue_connector(&self.config)?;
        let sink = self.backends.archive_sink(&self.config)?;
        let mut worker = ConsumerWorker::new(
            connector,
            sink,
            WorkerSettings::from_config(&self.config, context.request_id.clone()),
            ThroughputEstimator::new(self.config.flush.initial_upload_bytes_per_sec),
        );
        worker.run(partition, budget).await
    }
}
