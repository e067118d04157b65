//! Backend wiring.
//!
//! The invocation handler never constructs clients itself; it asks a
//! [`Backends`] implementation for them. [`PlatformBackends`] builds the real
//! ones from configuration: Kafka (feature `kafka`) or the in-memory queue,
//! the S3 sink and the HTTP invoker. Tests supply their own implementation.
//!
//! Building a client does not contact the service, so a consume invocation
//! never needs the invoke endpoint and a timer invocation never touches the
//! bucket.

use std::sync::Arc;

use crate::config::{ArchiverConfig, PartitionSpec, QueueBackend};
use crate::dispatch::HttpInvoker;
use crate::error::{ArchiverError, Result};
use crate::scheduler::StaticPartitionLister;
use crate::sinks::{build_s3_store, Credentials, ObjectStoreSink};
use crate::sources::memory::MemoryTopic;
use crate::traits::{ArchiveSink, Invoker, PartitionLister, QueueConnector};

/// Factory for the collaborators of one invocation.
pub trait Backends: Send + Sync {
    fn queue_connector(&self, config: &ArchiverConfig) -> Result<Arc<dyn QueueConnector>>;

    fn archive_sink(&self, config: &ArchiverConfig) -> Result<Box<dyn ArchiveSink>>;

    fn partition_lister(&self, config: &ArchiverConfig) -> Result<Arc<dyn PartitionLister>>;

    fn invoker(&self, config: &ArchiverConfig) -> Result<Arc<dyn Invoker>>;
}

/// Production backends.
pub struct PlatformBackends {
    credentials: Option<Credentials>,
    /// Process-local topic for `QUEUE_BACKEND=memory`.
    memory: MemoryTopic,
}

impl PlatformBackends {
    pub fn new(config: &ArchiverConfig, credentials: Option<Credentials>) -> Self {
        let topic = &config.queue.topic;
        let memory = match &config.queue.partitions {
            Some(PartitionSpec::Count(n)) => MemoryTopic::with_partition_count(topic.clone(), *n),
            Some(PartitionSpec::Names(names)) => {
                let refs: Vec<&str> = names.iter().map(String::as_str).collect();
                MemoryTopic::new(topic.clone(), &refs)
            }
            None => MemoryTopic::with_partition_count(topic.clone(), 1),
        };
        Self {
            credentials,
            memory,
        }
    }

    /// The topic served when `QUEUE_BACKEND=memory`.
    pub fn memory_topic(&self) -> &MemoryTopic {
        &self.memory
    }
}

#[cfg(not(feature = "kafka"))]
fn kafka_unavailable() -> ArchiverError {
    ArchiverError::ConfigError(
        "QUEUE_BACKEND=kafka requires building with the `kafka` feature".to_string(),
    )
}

impl Backends for PlatformBackends {
    fn queue_connector(&self, config: &ArchiverConfig) -> Result<Arc<dyn QueueConnector>> {
        match config.queue.backend {
            QueueBackend::Memory => Ok(Arc::new(self.memory.connector(config.queue.subscription.clone()))),
            #[cfg(feature = "kafka")]
            QueueBackend::Kafka => Ok(Arc::new(crate::sources::kafka::KafkaConnector::new(
                config.queue.clone(),
            ))),
            #[cfg(not(feature = "kafka"))]
            QueueBackend::Kafka => Err(kafka_unavailable()),
        }
    }

    fn archive_sink(&self, config: &ArchiverConfig) -> Result<Box<dyn ArchiveSink>> {
        let store = build_s3_store(&config.storage, self.credentials.as_ref())?;
        Ok(Box::new(ObjectStoreSink::from_config(store, &config.storage)))
    }

    fn partition_lister(&self, config: &ArchiverConfig) -> Result<Arc<dyn PartitionLister>> {
        if let Some(spec) = &config.queue.partitions {
            return Ok(Arc::new(StaticPartitionLister::new(spec.clone())));
        }
        match config.queue.backend {
            QueueBackend::Memory => Ok(Arc::new(self.memory.clone())),
            #[cfg(feature = "kafka")]
            QueueBackend::Kafka => Ok(Arc::new(
                crate::sources::kafka::KafkaPartitionLister::new(config.queue.clone()),
            )),
            #[cfg(not(feature = "kafka"))]
            QueueBackend::Kafka => Err(kafka_unavailable()),
        }
    }

    fn invoker(&self, config: &ArchiverConfig) -> Result<Arc<dyn Invoker>> {
        Ok(Arc::new(HttpInvoker::from_config(&config.dispatch)?))
    }
}
