//! Queue backends.
//!
//! `memory` is always available. The Kafka backend is only compiled with the
//! `kafka` feature, which pulls in `rdkafka` and librdkafka.

pub mod memory;

#[cfg(feature = "kafka")]
pub mod kafka;

pub use memory::{MemoryConnector, MemorySource, MemoryTopic};

#[cfg(feature = "kafka")]
pub use kafka::{KafkaConnector, KafkaPartitionLister, KafkaSource};
