//! Integration tests for timer and consume invocations

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use streamhouse_archiver::{
    ArchiveSink, ArchiverConfig, ArchiverError, Backends, ExitReason, InvocationContext,
    InvocationEvent, InvocationHandler, InvocationReport, Invoker, MemoryTopic, ObjectStoreSink,
    PartitionJob, PartitionLister, QueueConnector, Result, ResultCode,
};
use tempfile::TempDir;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Default)]
struct RecordingInvoker {
    jobs: Mutex<Vec<PartitionJob>>,
    reject: Option<String>,
}

#[async_trait]
impl Invoker for RecordingInvoker {
    async fn invoke(&self, job: &PartitionJob) -> Result<()> {
        self.jobs.lock().await.push(job.clone());
        if self.reject.as_deref() == Some(job.partition_id.as_str()) {
            return Err(ArchiverError::DispatchError("HTTP 429".to_string()));
        }
        Ok(())
    }
}

struct TestBackends {
    topic: MemoryTopic,
    store: Arc<dyn ObjectStore>,
    invoker: Arc<RecordingInvoker>,
}

impl Backends for TestBackends {
    fn queue_connector(&self, config: &ArchiverConfig) -> Result<Arc<dyn QueueConnector>> {
        Ok(Arc::new(self.topic.connector(config.queue.subscription.clone())))
    }

    fn archive_sink(&self, _config: &ArchiverConfig) -> Result<Box<dyn ArchiveSink>> {
        Ok(Box::new(ObjectStoreSink::new(self.store.clone())))
    }

    fn partition_lister(&self, _config: &ArchiverConfig) -> Result<Arc<dyn PartitionLister>> {
        Ok(Arc::new(self.topic.clone()))
    }

    fn invoker(&self, _config: &ArchiverConfig) -> Result<Arc<dyn Invoker>> {
        Ok(self.invoker.clone())
    }
}

fn config(dir: &TempDir) -> ArchiverConfig {
    let spool = dir.path().join("archiver.spool");
    let map: HashMap<String, String> = [
        ("QUEUE_BACKEND", "memory"),
        ("QUEUE_ENDPOINT", "memory://local"),
        ("QUEUE_CLUSTER", "cluster-a"),
        ("QUEUE_ENVIRONMENT", "prod"),
        ("QUEUE_TOPIC", "orders"),
        ("QUEUE_SUBSCRIPTION", "archiver"),
        ("BUCKET_NAME", "archive"),
        ("BUCKET_REGION", "us-east-1"),
        ("RECEIVE_TIMEOUT_MS", "30"),
        ("PROBE_TIMEOUT_MS", "30"),
        ("SPOOL_PATH", spool.to_str().unwrap()),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    ArchiverConfig::from_config_map(&map).unwrap()
}

fn context(time_limit_in_ms: u64) -> InvocationContext {
    InvocationContext {
        time_limit_in_ms,
        request_id: "req-it".to_string(),
        function_name: "archiver".to_string(),
        namespace: "default".to_string(),
        function_version: "$LATEST".to_string(),
    }
}

fn handler(dir: &TempDir, topic: MemoryTopic, invoker: RecordingInvoker) -> InvocationHandler<TestBackends> {
    let backends = TestBackends {
        topic,
        store: Arc::new(InMemory::new()),
        invoker: Arc::new(invoker),
    };
    InvocationHandler::new(config(dir), backends)
}

#[tokio::test]
async fn test_timer_dispatches_every_partition() {
    let dir = TempDir::new().unwrap();
    let topic = MemoryTopic::with_partition_count("orders", 3);
    let invoker = RecordingInvoker::default();
    let handler = handler(&dir, topic, invoker);

    let result = handler
        .handle(&InvocationEvent::timer(), &context(60_000), Instant::now())
        .await;

    assert_eq!(result.code, ResultCode::Success);
    match result.report {
        Some(InvocationReport::Fanout(report)) => {
            assert_eq!(report.topic, "orders");
            assert_eq!(report.accepted(), 3);
        }
        other => panic!("expected fan-out report, got {:?}", other),
    }
}

#[tokio::test]
async fn test_timer_partial_dispatch_failure_still_succeeds() {
    let dir = TempDir::new().unwrap();
    let topic = MemoryTopic::with_partition_count("orders", 3);
    let invoker = RecordingInvoker {
        reject: Some("orders-partition-2".to_string()),
        ..Default::default()
    };
    let handler = handler(&dir, topic, invoker);

    let result = handler
        .handle(&InvocationEvent::timer(), &context(60_000), Instant::now())
        .await;

    assert!(result.is_success());
    let Some(InvocationReport::Fanout(report)) = result.report else {
        panic!("expected fan-out report");
    };
    assert_eq!(report.accepted(), 2);
    assert_eq!(report.failed(), 1);
}

#[tokio::test]
async fn test_timer_unknown_topic_is_queue_connect_error() {
    let dir = TempDir::new().unwrap();
    let topic = MemoryTopic::with_partition_count("payments", 2);
    let handler = handler(&dir, topic, RecordingInvoker::default());

    let result = handler
        .handle(&InvocationEvent::timer(), &context(60_000), Instant::now())
        .await;

    assert_eq!(result.code, ResultCode::QueueConnectError);
    assert!(result.report.is_none());
}

#[tokio::test]
async fn test_consume_drains_named_partition() {
    let dir = TempDir::new().unwrap();
    let topic = MemoryTopic::with_partition_count("orders", 2);
    for i in 0..3u64 {
        topic
            .publish("orders-partition-1", format!("event-{}", i), 5_000 + i)
            .await
            .unwrap();
    }
    topic.publish("orders-partition-0", "other", 5_000).await.unwrap();
    let handler = handler(&dir, topic.clone(), RecordingInvoker::default());

    let result = handler
        .handle(
            &InvocationEvent::consume_partition("orders-partition-1"),
            &context(60_000),
            Instant::now(),
        )
        .await;

    assert_eq!(result.code, ResultCode::Success);
    let Some(InvocationReport::Worker(report)) = result.report else {
        panic!("expected worker report");
    };
    assert_eq!(report.partition, "orders-partition-1");
    assert_eq!(report.exit, ExitReason::Drained);
    assert_eq!(report.acked, 3);
    assert_eq!(report.uploaded_keys.len(), 1);
    assert!(report.uploaded_keys[0].contains("/orders/archiver/"));
    assert!(report.uploaded_keys[0].ends_with("_req-it.txt"));
    assert_eq!(topic.backlog("orders-partition-1", "archiver").await, 0);
    assert_eq!(topic.backlog("orders-partition-0", "archiver").await, 1);
}

#[tokio::test]
async fn test_consume_without_partition_is_invalid_parameter() {
    let dir = TempDir::new().unwrap();
    let handler = handler(
        &dir,
        MemoryTopic::with_partition_count("orders", 1),
        RecordingInvoker::default(),
    );
    let event: InvocationEvent =
        serde_json::from_str(r#"{"invoke_type":"ConsumeGroupByPartition"}"#).unwrap();

    let result = handler.handle(&event, &context(60_000), Instant::now()).await;

    assert_eq!(result.code, ResultCode::InvalidParameter);
    assert!(result.message.unwrap().contains("topic_partition"));
}

#[tokio::test]
async fn test_consume_with_zero_time_limit_is_invalid_parameter() {
    let dir = TempDir::new().unwrap();
    let handler = handler(
        &dir,
        MemoryTopic::with_partition_count("orders", 1),
        RecordingInvoker::default(),
    );

    let result = handler
        .handle(
            &InvocationEvent::consume_partition("orders-partition-0"),
            &context(0),
            Instant::now(),
        )
        .await;

    assert_eq!(result.code, ResultCode::InvalidParameter);
}

#[tokio::test]
async fn test_consume_connect_failure_is_queue_connect_error() {
    let dir = TempDir::new().unwrap();
    let topic = MemoryTopic::with_partition_count("orders", 1);
    topic.fail_connect(true).await;
    let handler = handler(&dir, topic, RecordingInvoker::default());

    let result = handler
        .handle(
            &InvocationEvent::consume_partition("orders-partition-0"),
            &context(60_000),
            Instant::now(),
        )
        .await;

    assert_eq!(result.code, ResultCode::QueueConnectError);
}

#[tokio::test]
async fn test_result_json_shape() {
    let dir = TempDir::new().unwrap();
    let handler = handler(
        &dir,
        MemoryTopic::with_partition_count("orders", 1),
        RecordingInvoker::default(),
    );

    let result = handler
        .handle(
            &InvocationEvent::consume_partition("orders-partition-0"),
            &context(60_000),
            Instant::now(),
        )
        .await;

    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["code"], "Success");
    assert_eq!(json["report"]["partition"], "orders-partition-0");
    assert_eq!(json["report"]["exit"], "Drained");
}
