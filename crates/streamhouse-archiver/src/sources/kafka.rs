//! Kafka queue backend (feature `kafka`).
//!
//! Each worker assigns itself exactly one partition; the consumer group's
//! committed offset is the subscription cursor, so a reconnect resumes from
//! the first unacknowledged message. Offsets are the message ids.
//!
//! | Queue setting          | Kafka setting                              |
//! |------------------------|--------------------------------------------|
//! | `QUEUE_ENDPOINT`       | `bootstrap.servers`                        |
//! | `QUEUE_SUBSCRIPTION`   | `group.id`                                 |
//! | `QUEUE_AUTH_USERNAME` + `QUEUE_AUTH_TOKEN` | `SASL_SSL` / `PLAIN`   |
//! | `QUEUE_LISTENER_NAME`  | `client.id`                                |
//!
//! Acknowledging commits `highest_id + 1` synchronously; `seek_to_time`
//! resolves the target with `offsets_for_times` and reassigns the partition.
//! Broker round-trips that block inside librdkafka run on the blocking pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{Message as RdKafkaMessage, Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::{ArchiverError, Result};
use crate::traits::{
    Message, MessageId, MessageSource, PartitionLister, QueueConnector, StartPosition,
};

/// Timeout for blocking broker round-trips (metadata, commits, offset lookups).
const BROKER_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Kafka partition number from a partition name (`orders-partition-3` → 3).
pub fn partition_number(partition: &str) -> Result<i32> {
    partition
        .rsplit('-')
        .next()
        .and_then(|n| n.parse::<i32>().ok())
        .filter(|n| *n >= 0)
        .ok_or_else(|| {
            ArchiverError::ConfigError(format!(
                "partition '{}' does not end in a partition number",
                partition
            ))
        })
}

/// Partition name for a Kafka partition number.
pub fn partition_name(topic: &str, number: i32) -> String {
    format!("{}-partition-{}", topic, number)
}

fn client_config(queue: &QueueConfig, start: StartPosition) -> ClientConfig {
    let mut config = ClientConfig::new();
    config
        .set("bootstrap.servers", &queue.endpoint)
        .set("group.id", &queue.subscription)
        .set("enable.auto.commit", "false")
        .set("enable.partition.eof", "false")
        .set(
            "auto.offset.reset",
            match start {
                StartPosition::Earliest => "earliest",
                StartPosition::Latest => "latest",
            },
        );
    if let Some(listener) = &queue.listener_name {
        config.set("client.id", listener);
    }
    if let (Some(username), Some(token)) = (&queue.auth_username, &queue.auth_token) {
        config
            .set("security.protocol", "SASL_SSL")
            .set("sasl.mechanism", "PLAIN")
            .set("sasl.username", username)
            .set("sasl.password", token);
    }
    config
}

fn connect_error(e: KafkaError) -> ArchiverError {
    ArchiverError::ConnectError(e.to_string())
}

fn queue_error(e: KafkaError) -> ArchiverError {
    ArchiverError::QueueError(e.to_string())
}

/// Run a blocking librdkafka call off the async worker threads.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        ArchiverError::QueueError(format!("blocking broker call did not complete: {}", e))
    })?
}

/// [`QueueConnector`] backed by an `rdkafka` consumer per partition.
#[derive(Debug, Clone)]
pub struct KafkaConnector {
    queue: QueueConfig,
}

impl KafkaConnector {
    pub fn new(queue: QueueConfig) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl QueueConnector for KafkaConnector {
    async fn connect(
        &self,
        partition: &str,
        start: StartPosition,
    ) -> Result<Box<dyn MessageSource>> {
        let number = partition_number(partition)?;
        let consumer: Arc<StreamConsumer> = Arc::new(
            client_config(&self.queue, start)
                .create()
                .map_err(connect_error)?,
        );

        // Resume from the committed offset if the group has one.
        let resume = {
            let consumer = Arc::clone(&consumer);
            let topic = self.queue.topic.clone();
            blocking(move || {
                let mut wanted = TopicPartitionList::new();
                wanted.add_partition(&topic, number);
                let committed = consumer
                    .committed_offsets(wanted, BROKER_REQUEST_TIMEOUT)
                    .map_err(connect_error)?;
                Ok(committed
                    .find_partition(&topic, number)
                    .map(|elem| elem.offset())
                    .filter(|offset| matches!(offset, Offset::Offset(_))))
            })
            .await?
        };
        let offset = resume.unwrap_or(match start {
            StartPosition::Earliest => Offset::Beginning,
            StartPosition::Latest => Offset::End,
        });

        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(&self.queue.topic, number, offset)
            .map_err(connect_error)?;
        consumer.assign(&assignment).map_err(connect_error)?;

        info!(
            topic = %self.queue.topic,
            partition = %partition,
            group = %self.queue.subscription,
            offset = ?offset,
            "Kafka partition assigned"
        );

        Ok(Box::new(KafkaSource {
            consumer,
            topic: self.queue.topic.clone(),
            partition: partition.to_string(),
            number,
        }))
    }
}

/// A consumer assigned to a single Kafka partition.
pub struct KafkaSource {
    consumer: Arc<StreamConsumer>,
    topic: String,
    partition: String,
    number: i32,
}

impl KafkaSource {
    async fn commit_next(&self, next_offset: i64) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, self.number, Offset::Offset(next_offset))
            .map_err(queue_error)?;
        let consumer = Arc::clone(&self.consumer);
        blocking(move || consumer.commit(&tpl, CommitMode::Sync).map_err(queue_error)).await
    }
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn receive(&mut self, timeout: Duration) -> Result<Message> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Err(ArchiverError::ReceiveTimeout),
            Ok(Err(e)) => Err(queue_error(e)),
            Ok(Ok(msg)) => {
                let payload = msg
                    .payload()
                    .map(Bytes::copy_from_slice)
                    .unwrap_or_default();
                let publish_time_ms = msg.timestamp().to_millis().unwrap_or(0).max(0) as u64;
                Ok(Message {
                    id: MessageId(msg.offset() as u64),
                    payload,
                    publish_time_ms,
                })
            }
        }
    }

    async fn seek_to_time(&mut self, publish_time_ms: u64) -> Result<()> {
        let mut query = TopicPartitionList::new();
        query
            .add_partition_offset(
                &self.topic,
                self.number,
                Offset::Offset(publish_time_ms as i64),
            )
            .map_err(queue_error)?;
        let offset = {
            let consumer = Arc::clone(&self.consumer);
            let topic = self.topic.clone();
            let number = self.number;
            blocking(move || {
                let resolved = consumer
                    .offsets_for_times(query, BROKER_REQUEST_TIMEOUT)
                    .map_err(queue_error)?;
                Ok(resolved
                    .find_partition(&topic, number)
                    .map(|elem| elem.offset())
                    .unwrap_or(Offset::End))
            })
            .await?
        };
        // No message at or after the timestamp resolves to an invalid offset.
        let offset = match offset {
            Offset::Offset(_) => offset,
            _ => Offset::End,
        };

        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(&self.topic, self.number, offset)
            .map_err(queue_error)?;
        self.consumer.assign(&assignment).map_err(queue_error)?;
        debug!(partition = %self.partition, publish_time_ms, offset = ?offset, "Seeked by time");
        Ok(())
    }

    async fn ack(&mut self, id: MessageId) -> Result<()> {
        self.commit_next(id.0 as i64 + 1).await
    }

    /// Kafka offsets are cumulative: committing past the highest id covers the set.
    async fn ack_all(&mut self, ids: &[MessageId]) -> Result<()> {
        match ids.iter().max() {
            Some(highest) => self.commit_next(highest.0 as i64 + 1).await,
            None => Ok(()),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Err(e) = self.consumer.unassign() {
            warn!(partition = %self.partition, error = %e, "Failed to unassign partition");
        }
        Ok(())
    }

    fn partition(&self) -> &str {
        &self.partition
    }
}

/// Lists partitions from broker metadata.
#[derive(Debug, Clone)]
pub struct KafkaPartitionLister {
    queue: QueueConfig,
}

impl KafkaPartitionLister {
    pub fn new(queue: QueueConfig) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl PartitionLister for KafkaPartitionLister {
    async fn list_partitions(&self, topic: &str) -> Result<Vec<String>> {
        let consumer: StreamConsumer = client_config(&self.queue, StartPosition::Earliest)
            .create()
            .map_err(connect_error)?;
        let name = topic.to_string();
        let mut numbers = blocking(move || {
            let metadata = consumer
                .fetch_metadata(Some(&name), BROKER_REQUEST_TIMEOUT)
                .map_err(connect_error)?;
            let topic_meta = metadata
                .topics()
                .iter()
                .find(|t| t.name() == name)
                .ok_or_else(|| {
                    ArchiverError::QueueError(format!("topic '{}' not found in metadata", name))
                })?;
            if let Some(err) = topic_meta.error() {
                return Err(ArchiverError::QueueError(format!(
                    "metadata error for topic '{}': {:?}",
                    name, err
                )));
            }
            Ok(topic_meta
                .partitions()
                .iter()
                .map(|p| p.id())
                .collect::<Vec<i32>>())
        })
        .await?;
        numbers.sort_unstable();
        Ok(numbers
            .into_iter()
            .map(|n| partition_name(topic, n))
            .collect())
    }
}
