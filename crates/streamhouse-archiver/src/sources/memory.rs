//! In-memory queue backend.
//!
//! A partitioned, append-only log with durable-subscription semantics, used
//! by tests and local runs:
//!
//! - Each subscription remembers which ids it acknowledged; reconnecting
//!   redelivers every unacknowledged message from the subscription start.
//! - A new subscription starts at the beginning (`Earliest`) or after the
//!   last published message (`Latest`); an existing one ignores the start
//!   position.
//! - `seek_to_time` moves the subscription start to the first message
//!   published at or after the requested time.
//!
//! Failure switches (`fail_connect`, `fail_seek`, `fail_ack`,
//! `fail_receive`) inject queue errors for the worker's error paths.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify};

use crate::error::{ArchiverError, Result};
use crate::traits::{
    Message, MessageId, MessageSource, PartitionLister, QueueConnector, StartPosition,
};

#[derive(Debug, Default)]
struct Subscription {
    /// First index this subscription reads from.
    start: usize,
    acked: BTreeSet<u64>,
    /// Every successful ack, in the order it was issued.
    ack_log: Vec<MessageId>,
}

#[derive(Debug, Default)]
struct PartitionLog {
    messages: Vec<Message>,
    subscriptions: HashMap<String, Subscription>,
}

#[derive(Debug, Default)]
struct Failures {
    connect: bool,
    seek: bool,
    ack: bool,
    receive: bool,
}

#[derive(Debug, Default)]
struct TopicState {
    partitions: HashMap<String, PartitionLog>,
    failures: Failures,
}

/// A topic held entirely in memory. Cloning shares the same log.
#[derive(Debug, Clone)]
pub struct MemoryTopic {
    name: String,
    state: Arc<Mutex<TopicState>>,
    published: Arc<Notify>,
}

impl MemoryTopic {
    /// Create a topic with the given partition names.
    pub fn new(name: impl Into<String>, partitions: &[&str]) -> Self {
        let partitions = partitions
            .iter()
            .map(|p| (p.to_string(), PartitionLog::default()))
            .collect();
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(TopicState {
                partitions,
                failures: Failures::default(),
            })),
            published: Arc::new(Notify::new()),
        }
    }

    /// Create a topic with `count` partitions named `<name>-partition-<i>`.
    pub fn with_partition_count(name: impl Into<String>, count: u32) -> Self {
        let name = name.into();
        let names: Vec<String> = (0..count)
            .map(|i| format!("{}-partition-{}", name, i))
            .collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        Self::new(name.clone(), &refs)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a message and wake any waiting receivers.
    pub async fn publish(
        &self,
        partition: &str,
        payload: impl Into<Bytes>,
        publish_time_ms: u64,
    ) -> Result<MessageId> {
        let id = {
            let mut state = self.state.lock().await;
            let log = state.partitions.get_mut(partition).ok_or_else(|| {
                ArchiverError::QueueError(format!("unknown partition '{}'", partition))
            })?;
            let id = MessageId(log.messages.len() as u64);
            log.messages.push(Message {
                id,
                payload: payload.into(),
                publish_time_ms,
            });
            id
        };
        self.published.notify_waiters();
        Ok(id)
    }

    /// Connector that subscribes under `subscription`.
    pub fn connector(&self, subscription: impl Into<String>) -> MemoryConnector {
        MemoryConnector {
            topic: self.clone(),
            subscription: subscription.into(),
        }
    }

    /// Acks issued by `subscription` on `partition`, in order.
    pub async fn ack_log(&self, partition: &str, subscription: &str) -> Vec<MessageId> {
        let state = self.state.lock().await;
        state
            .partitions
            .get(partition)
            .and_then(|log| log.subscriptions.get(subscription))
            .map(|sub| sub.ack_log.clone())
            .unwrap_or_default()
    }

    /// Number of messages `subscription` has not acknowledged on `partition`.
    pub async fn backlog(&self, partition: &str, subscription: &str) -> usize {
        let state = self.state.lock().await;
        let Some(log) = state.partitions.get(partition) else {
            return 0;
        };
        match log.subscriptions.get(subscription) {
            Some(sub) => log.messages[sub.start.min(log.messages.len())..]
                .iter()
                .filter(|m| !sub.acked.contains(&m.id.0))
                .count(),
            None => log.messages.len(),
        }
    }

    pub async fn fail_connect(&self, fail: bool) {
        self.state.lock().await.failures.connect = fail;
    }

    pub async fn fail_seek(&self, fail: bool) {
        self.state.lock().await.failures.seek = fail;
    }

    pub async fn fail_ack(&self, fail: bool) {
        self.state.lock().await.failures.ack = fail;
    }

    pub async fn fail_receive(&self, fail: bool) {
        self.state.lock().await.failures.receive = fail;
    }
}

#[async_trait]
impl PartitionLister for MemoryTopic {
    async fn list_partitions(&self, topic: &str) -> Result<Vec<String>> {
        if topic != self.name {
            return Err(ArchiverError::QueueError(format!(
                "topic '{}' does not exist",
                topic
            )));
        }
        let state = self.state.lock().await;
        let mut partitions: Vec<String> = state.partitions.keys().cloned().collect();
        partitions.sort();
        Ok(partitions)
    }
}

/// [`QueueConnector`] for a [`MemoryTopic`] under one subscription name.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    topic: MemoryTopic,
    subscription: String,
}

#[async_trait]
impl QueueConnector for MemoryConnector {
    async fn connect(
        &self,
        partition: &str,
        start: StartPosition,
    ) -> Result<Box<dyn MessageSource>> {
        let mut state = self.topic.state.lock().await;
        if state.failures.connect {
            return Err(ArchiverError::ConnectError(format!(
                "injected connect failure for '{}'",
                partition
            )));
        }
        let log = state.partitions.get_mut(partition).ok_or_else(|| {
            ArchiverError::ConnectError(format!("unknown partition '{}'", partition))
        })?;

        let end = log.messages.len();
        let sub = log
            .subscriptions
            .entry(self.subscription.clone())
            .or_insert_with(|| Subscription {
                start: match start {
                    StartPosition::Earliest => 0,
                    StartPosition::Latest => end,
                },
                ..Default::default()
            });
        let cursor = sub.start;

        tracing::debug!(
            topic = %self.topic.name,
            partition = %partition,
            subscription = %self.subscription,
            cursor,
            "Memory subscription connected"
        );

        Ok(Box::new(MemorySource {
            topic: self.topic.clone(),
            subscription: self.subscription.clone(),
            partition: partition.to_string(),
            cursor,
            closed: false,
        }))
    }
}

/// One subscription handle on one partition.
#[derive(Debug)]
pub struct MemorySource {
    topic: MemoryTopic,
    subscription: String,
    partition: String,
    cursor: usize,
    closed: bool,
}

impl MemorySource {
    /// Next deliverable message at or after the cursor.
    fn next_ready(&mut self, state: &TopicState) -> Result<Option<Message>> {
        if state.failures.receive {
            return Err(ArchiverError::QueueError("injected receive failure".to_string()));
        }
        let log = state.partitions.get(&self.partition).ok_or_else(|| {
            ArchiverError::QueueError(format!("partition '{}' vanished", self.partition))
        })?;
        let sub = log.subscriptions.get(&self.subscription);
        while self.cursor < log.messages.len() {
            let msg = &log.messages[self.cursor];
            self.cursor += 1;
            let acked = sub.map(|s| s.acked.contains(&msg.id.0)).unwrap_or(false);
            if !acked {
                return Ok(Some(msg.clone()));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn receive(&mut self, timeout: Duration) -> Result<Message> {
        if self.closed {
            return Err(ArchiverError::QueueError("source is closed".to_string()));
        }
        let deadline = tokio::time::Instant::now() + timeout;
        let shared = self.topic.state.clone();
        let published = self.topic.published.clone();
        loop {
            // Register interest before checking so a publish in between is not missed.
            let notified = published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = shared.lock().await;
                if let Some(msg) = self.next_ready(&state)? {
                    return Ok(msg);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(ArchiverError::ReceiveTimeout);
            }
        }
    }

    async fn seek_to_time(&mut self, publish_time_ms: u64) -> Result<()> {
        let mut state = self.topic.state.lock().await;
        if state.failures.seek {
            return Err(ArchiverError::QueueError("injected seek failure".to_string()));
        }
        let log = state.partitions.get_mut(&self.partition).ok_or_else(|| {
            ArchiverError::QueueError(format!("partition '{}' vanished", self.partition))
        })?;
        let position = log
            .messages
            .iter()
            .position(|m| m.publish_time_ms >= publish_time_ms)
            .unwrap_or(log.messages.len());
        if let Some(sub) = log.subscriptions.get_mut(&self.subscription) {
            sub.start = position;
        }
        self.cursor = position;
        Ok(())
    }

    async fn ack(&mut self, id: MessageId) -> Result<()> {
        let mut state = self.topic.state.lock().await;
        if state.failures.ack {
            return Err(ArchiverError::QueueError(format!("injected ack failure for {}", id)));
        }
        let log = state.partitions.get_mut(&self.partition).ok_or_else(|| {
            ArchiverError::QueueError(format!("partition '{}' vanished", self.partition))
        })?;
        if id.0 as usize >= log.messages.len() {
            return Err(ArchiverError::QueueError(format!("unknown message id {}", id)));
        }
        let sub = log
            .subscriptions
            .entry(self.subscription.clone())
            .or_default();
        sub.acked.insert(id.0);
        sub.ack_log.push(id);
        Ok(())
    }

    /// All ids are validated under one lock before any is applied, so a
    /// failure leaves the set entirely unacknowledged.
    async fn ack_all(&mut self, ids: &[MessageId]) -> Result<()> {
        let mut state = self.topic.state.lock().await;
        if state.failures.ack {
            return Err(ArchiverError::QueueError(format!(
                "injected ack failure for {} messages",
                ids.len()
            )));
        }
        let log = state.partitions.get_mut(&self.partition).ok_or_else(|| {
            ArchiverError::QueueError(format!("partition '{}' vanished", self.partition))
        })?;
        if let Some(unknown) = ids.iter().find(|id| id.0 as usize >= log.messages.len()) {
            return Err(ArchiverError::QueueError(format!("unknown message id {}", unknown)));
        }
        let sub = log
            .subscriptions
            .entry(self.subscription.clone())
            .or_default();
        for id in ids {
            sub.acked.insert(id.0);
            sub.ack_log.push(*id);
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    fn partition(&self) -> &str {
        &self.partition
    }
}
