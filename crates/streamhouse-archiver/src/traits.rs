//! Seams of the archiver pipeline.
//!
//! Defines the queue-side traits (`QueueConnector`, `MessageSource`), the
//! storage-side trait (`ArchiveSink`) and the fan-out traits
//! (`PartitionLister`, `Invoker`), along with the `Message` type exchanged
//! between a source and the worker.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;
use crate::key::UploadKey;
use crate::scheduler::PartitionJob;
use crate::throughput::ThroughputEstimator;

/// Position of a message within its partition.
///
/// Ids are strictly increasing in delivery order, so comparing two ids from
/// the same partition compares their queue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(pub u64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message received from one partition.
#[derive(Debug, Clone)]
pub struct Message {
    /// Position within the partition.
    pub id: MessageId,
    /// Raw payload, written to the spool as-is.
    pub payload: Bytes,
    /// Publish time in milliseconds since epoch.
    pub publish_time_ms: u64,
}

/// Where a new subscription starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Earliest,
    Latest,
}

/// Builds a subscription handle for one partition.
#[async_trait]
pub trait QueueConnector: Send + Sync {
    /// Subscribe to `partition`. An existing subscription resumes from its
    /// first unacknowledged message; `start` only applies to a new one.
    async fn connect(
        &self,
        partition: &str,
        start: StartPosition,
    ) -> Result<Box<dyn MessageSource>>;
}

/// A subscription to a single partition.
#[async_trait]
pub trait MessageSource: Send {
    /// Wait up to `timeout` for the next message.
    ///
    /// Returns [`ArchiverError::ReceiveTimeout`](crate::error::ArchiverError::ReceiveTimeout)
    /// when nothing arrived in time.
    async fn receive(&mut self, timeout: Duration) -> Result<Message>;

    /// Reposition so the next receive returns the first message published at
    /// or after `publish_time_ms`.
    async fn seek_to_time(&mut self, publish_time_ms: u64) -> Result<()>;

    /// Acknowledge one message.
    async fn ack(&mut self, id: MessageId) -> Result<()>;

    /// Acknowledge a flushed set as one unit, in the given order.
    ///
    /// The default acks id by id and stops at the first failure, which can
    /// leave a prefix of the set acknowledged. Backends that can apply the
    /// set atomically override it.
    async fn ack_all(&mut self, ids: &[MessageId]) -> Result<()> {
        for id in ids {
            self.ack(*id).await?;
        }
        Ok(())
    }

    /// Release the subscription.
    async fn close(&mut self) -> Result<()>;

    /// Partition this source reads from.
    fn partition(&self) -> &str;
}

/// Durable destination for sealed spool files.
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    /// Upload the file at `local_path` under a key derived from `key`.
    ///
    /// Returns the key actually written. The estimator is only revised after
    /// a successful upload.
    async fn upload(
        &mut self,
        local_path: &Path,
        key: UploadKey,
        byte_size: u64,
        estimator: &mut ThroughputEstimator,
    ) -> Result<String>;
}

/// Enumerates the partitions of a topic.
#[async_trait]
pub trait PartitionLister: Send + Sync {
    async fn list_partitions(&self, topic: &str) -> Result<Vec<String>>;
}

/// Fires one asynchronous worker invocation.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Returns once the invocation layer accepted the request; does not wait
    /// for the worker to finish.
    async fn invoke(&self, job: &PartitionJob) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ArchiverError;

    // ---------------------------------------------------------------
    // MessageId / Message
    // ---------------------------------------------------------------

    #[test]
    fn test_message_id_ordering() {
        assert!(MessageId(1) < MessageId(2));
        assert_eq!(MessageId(7), MessageId(7));
        assert_eq!(format!("{}", MessageId(42)), "42");
    }

    #[test]
    fn test_message_construction() {
        let msg = Message {
            id: MessageId(3),
            payload: Bytes::from(r#"{"action":"click"}"#),
            publish_time_ms: 1_700_000_000_000,
        };
        assert_eq!(msg.id, MessageId(3));
        assert_eq!(msg.payload.len(), 18);
        assert_eq!(msg.publish_time_ms, 1_700_000_000_000);
    }

    // ---------------------------------------------------------------
    // Trait object safety
    // ---------------------------------------------------------------

    struct RecordingSource {
        acked: Vec<MessageId>,
    }

    #[async_trait]
    impl MessageSource for RecordingSource {
        async fn receive(&mut self, _timeout: Duration) -> Result<Message> {
            Err(ArchiverError::ReceiveTimeout)
        }
        async fn seek_to_time(&mut self, _publish_time_ms: u64) -> Result<()> {
            Ok(())
        }
        async fn ack(&mut self, id: MessageId) -> Result<()> {
            self.acked.push(id);
            Ok(())
        }
        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
        fn partition(&self) -> &str {
            "p-0"
        }
    }

    #[test]
    fn test_message_source_object_safety() {
        let source = RecordingSource { acked: vec![] };
        let _: &dyn MessageSource = &source;
    }

    #[tokio::test]
    async fn test_default_ack_all_preserves_order() {
        let mut source = RecordingSource { acked: vec![] };
        let ids = vec![MessageId(5), MessageId(6), MessageId(9)];
        source.ack_all(&ids).await.unwrap();
        assert_eq!(source.acked, ids);
    }

    #[tokio::test]
    async fn test_receive_timeout_variant() {
        let mut source = RecordingSource { acked: vec![] };
        let err = source
            .receive(Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiverError::ReceiveTimeout));
    }
}
