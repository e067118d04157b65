//! StreamHouse Archiver
//!
//! Drains message-queue partitions into object storage within a fixed time
//! budget, and fans out one drain invocation per partition on a timer.
//!
//! ## Architecture
//!
//! - **Invocation**: `InvocationHandler` turns a platform event into either a
//!   fan-out run or a partition drain and reports an `InvocationResult`.
//! - **Scheduler**: `FanoutScheduler` lists partitions and dispatches workers
//!   concurrently through an `Invoker`.
//! - **Worker**: `ConsumerWorker` connects, seeks, buffers messages into a
//!   local spool and flushes batches to the sink, acknowledging only what was
//!   durably uploaded.
//! - **Policy**: `FlushPolicy` and `RunBudget` decide when to flush and when
//!   to stop; `ThroughputEstimator` predicts upload time.
//! - **Sources / Sinks**: queue backends (in-memory, Kafka) and the
//!   object-store sink.
//! - **Runtime**: `Backends` builds the collaborators from configuration.
//!
//! ## Feature Flags
//!
//! - `kafka` - Enables the Kafka queue backend (requires `rdkafka`).

pub mod config;
pub mod dispatch;
pub mod error;
pub mod invocation;
pub mod key;
pub mod policy;
pub mod runtime;
pub mod scheduler;
pub mod seek;
pub mod sinks;
pub mod sources;
pub mod spool;
pub mod throughput;
pub mod traits;
pub mod worker;

// Re-export key types at crate root for convenience.
pub use config::{ArchiverConfig, DispatchConfig, FlushConfig, QueueConfig, StorageConfig};
pub use error::{ArchiverError, InvocationKind, Result, ResultCode};
pub use invocation::{
    InvocationContext, InvocationEvent, InvocationHandler, InvocationReport, InvocationResult,
    InvokeType,
};
pub use policy::{FlushDecision, FlushPolicy, RunBudget, StopReason};
pub use runtime::{Backends, PlatformBackends};
pub use scheduler::{FanoutReport, FanoutScheduler, FunctionRef, PartitionJob};
pub use seek::SeekPolicy;
pub use sinks::ObjectStoreSink;
pub use sources::MemoryTopic;
pub use throughput::ThroughputEstimator;
pub use traits::{ArchiveSink, Invoker, Message, MessageId, MessageSource, PartitionLister, QueueConnector};
pub use worker::{ConsumerWorker, ExitReason, WorkerReport, WorkerSettings};
