//! Configuration for the archiver.
//!
//! All settings arrive as environment variables set on the function by the
//! host platform. They are parsed from a string key-value map so tests can
//! build configurations without touching the process environment.
//!
//! ## Queue
//!
//! | Key                   | Description                                   | Default    |
//! |-----------------------|-----------------------------------------------|------------|
//! | `QUEUE_BACKEND`       | `kafka` or `memory`                           | `kafka`    |
//! | `QUEUE_ENDPOINT`      | Broker / service URL                          | required   |
//! | `QUEUE_LISTENER_NAME` | Advertised listener name                      | (none)     |
//! | `QUEUE_AUTH_USERNAME` | SASL username                                 | (none)     |
//! | `QUEUE_AUTH_TOKEN`    | Auth token / SASL password                    | (none)     |
//! | `QUEUE_CLUSTER`       | Cluster name                                  | required   |
//! | `QUEUE_ENVIRONMENT`   | Environment / namespace                       | required   |
//! | `QUEUE_TOPIC`         | Topic to drain                                | required   |
//! | `QUEUE_SUBSCRIPTION`  | Subscription / consumer group                 | required   |
//! | `QUEUE_PARTITIONS`    | Partition count or comma-separated names      | (metadata) |
//! | `SEEK_POLICY`         | `earliest`, `latest` or a Unix timestamp (s)  | `earliest` |
//!
//! ## Storage
//!
//! | Key                     | Description                      | Default  |
//! |-------------------------|----------------------------------|----------|
//! | `BUCKET_NAME`           | Bucket                           | required |
//! | `BUCKET_REGION`         | Region                           | required |
//! | `OBJECT_STORE_ENDPOINT` | Custom S3-compatible endpoint    | (none)   |
//! | `OBJECT_KEY_PREFIX`     | Prefix for every object key      | `""`     |
//!
//! ## Flushing
//!
//! | Key                            | Description                       | Default   |
//! |--------------------------------|-----------------------------------|-----------|
//! | `MAX_BYTES_PER_FLUSH`          | Flush size trigger (1 B – 500 MiB) | 100 MiB  |
//! | `MAX_MESSAGES_PER_FLUSH`       | Flush count trigger               | `10000`   |
//! | `RECEIVE_TIMEOUT_MS`           | Per-receive wait                  | `3000`    |
//! | `PROBE_TIMEOUT_MS`             | Seek probe wait                   | `5000`    |
//! | `SAFETY_MARGIN_S`              | Time kept in reserve at the end   | `5`       |
//! | `INITIAL_UPLOAD_BYTES_PER_SEC` | Throughput estimate seed          | 10 MiB/s  |
//! | `SPOOL_PATH`                   | Local spool file                  | `/tmp/streamhouse-archiver.spool` |
//!
//! ## Dispatch
//!
//! | Key                 | Description                   | Default          |
//! |---------------------|-------------------------------|------------------|
//! | `INVOKE_ENDPOINT`   | Platform invoke API URL       | required (Timer) |
//! | `INVOKE_TOKEN`      | Bearer token                  | (none)           |
//! | `INVOKE_TIMEOUT_MS` | Per-dispatch request timeout  | `10000`          |

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ArchiverError, Result};
use crate::seek::SeekPolicy;
use crate::throughput::DEFAULT_UPLOAD_BYTES_PER_SEC;

/// Upper bound for a single flush: 500 MiB.
pub const MAX_BYTES_PER_FLUSH_LIMIT: u64 = 500 * 1024 * 1024;
/// Lower bound for a single flush: 1 byte.
pub const MIN_BYTES_PER_FLUSH: u64 = 1;

fn default_max_bytes_per_flush() -> u64 {
    100 * 1024 * 1024 // 100MB
}

fn default_max_messages_per_flush() -> usize {
    10_000
}

fn default_receive_timeout() -> Duration {
    Duration::from_millis(3000)
}

fn default_probe_timeout() -> Duration {
    Duration::from_millis(5000)
}

fn default_safety_margin() -> Duration {
    Duration::from_secs(5)
}

fn default_spool_path() -> PathBuf {
    PathBuf::from("/tmp/streamhouse-archiver.spool")
}

fn default_multipart_threshold() -> u64 {
    8 * 1024 * 1024 // 8MB
}

fn default_multipart_part_size() -> usize {
    8 * 1024 * 1024 // 8MB (S3 minimum is 5MB)
}

fn default_invoke_timeout() -> Duration {
    Duration::from_millis(10_000)
}

/// Which queue client backs the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueBackend {
    Kafka,
    Memory,
}

impl FromStr for QueueBackend {
    type Err = ArchiverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "kafka" => Ok(QueueBackend::Kafka),
            "memory" => Ok(QueueBackend::Memory),
            other => Err(ArchiverError::ConfigError(format!(
                "unknown QUEUE_BACKEND '{}': must be 'kafka' or 'memory'",
                other
            ))),
        }
    }
}

/// How the static partition lister enumerates partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionSpec {
    /// `<topic>-partition-0` .. `<topic>-partition-{n-1}`.
    Count(u32),
    /// Explicit partition names.
    Names(Vec<String>),
}

impl FromStr for PartitionSpec {
    type Err = ArchiverError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if let Ok(count) = trimmed.parse::<u32>() {
            if count == 0 {
                return Err(ArchiverError::ConfigError(
                    "QUEUE_PARTITIONS must be at least 1".to_string(),
                ));
            }
            return Ok(PartitionSpec::Count(count));
        }
        let names: Vec<String> = trimmed
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if names.is_empty() {
            return Err(ArchiverError::ConfigError(
                "QUEUE_PARTITIONS must name at least one partition".to_string(),
            ));
        }
        Ok(PartitionSpec::Names(names))
    }
}

/// Queue connection and naming.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub backend: QueueBackend,
    pub endpoint: String,
    pub listener_name: Option<String>,
    pub auth_username: Option<String>,
    pub auth_token: Option<String>,
    pub cluster: String,
    pub environment: String,
    pub topic: String,
    pub subscription: String,
    pub partitions: Option<PartitionSpec>,
}

/// Object-store destination.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub key_prefix: String,
    pub multipart_threshold: u64,
    pub multipart_part_size: usize,
}

/// Flush limits and timing.
#[derive(Debug, Clone)]
pub struct FlushConfig {
    pub max_bytes_per_flush: u64,
    pub max_messages_per_flush: usize,
    pub receive_timeout: Duration,
    pub probe_timeout: Duration,
    pub safety_margin: Duration,
    pub initial_upload_bytes_per_sec: f64,
    pub spool_path: PathBuf,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            max_bytes_per_flush: default_max_bytes_per_flush(),
            max_messages_per_flush: default_max_messages_per_flush(),
            receive_timeout: default_receive_timeout(),
            probe_timeout: default_probe_timeout(),
            safety_margin: default_safety_margin(),
            initial_upload_bytes_per_sec: DEFAULT_UPLOAD_BYTES_PER_SEC,
            spool_path: default_spool_path(),
        }
    }
}

/// Fan-out invocation settings.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub endpoint: Option<String>,
    pub token: Option<String>,
    pub timeout: Duration,
}

/// Complete archiver configuration.
#[derive(Debug, Clone)]
pub struct ArchiverConfig {
    pub queue: QueueConfig,
    pub storage: StorageConfig,
    pub flush: FlushConfig,
    pub seek_policy: SeekPolicy,
    pub dispatch: DispatchConfig,
}

impl ArchiverConfig {
    /// Parse from the process environment.
    pub fn from_env() -> Result<Self> {
        let map: HashMap<String, String> = std::env::vars().collect();
        Self::from_config_map(&map)
    }

    /// Parse from a string key-value map.
    pub fn from_config_map(config: &HashMap<String, String>) -> Result<Self> {
        let queue = QueueConfig {
            backend: optional(config, "QUEUE_BACKEND")
                .map(|s| s.parse())
                .transpose()?
                .unwrap_or(QueueBackend::Kafka),
            endpoint: required(config, "QUEUE_ENDPOINT")?,
            listener_name: optional(config, "QUEUE_LISTENER_NAME"),
            auth_username: optional(config, "QUEUE_AUTH_USERNAME"),
            auth_token: optional(config, "QUEUE_AUTH_TOKEN"),
            cluster: required(config, "QUEUE_CLUSTER")?,
            environment: required(config, "QUEUE_ENVIRONMENT")?,
            topic: required(config, "QUEUE_TOPIC")?,
            subscription: required(config, "QUEUE_SUBSCRIPTION")?,
            partitions: optional(config, "QUEUE_PARTITIONS")
                .map(|s| s.parse())
                .transpose()?,
        };

        let seek_policy = optional(config, "SEEK_POLICY")
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or(SeekPolicy::Earliest);

        let storage = StorageConfig {
            bucket: required(config, "BUCKET_NAME")?,
            region: required(config, "BUCKET_REGION")?,
            endpoint: optional(config, "OBJECT_STORE_ENDPOINT"),
            key_prefix: config
                .get("OBJECT_KEY_PREFIX")
                .map(|s| s.trim().to_string())
                .unwrap_or_default(),
            multipart_threshold: default_multipart_threshold(),
            multipart_part_size: default_multipart_part_size(),
        };

        let requested_bytes: i64 = parse_or(
            config,
            "MAX_BYTES_PER_FLUSH",
            default_max_bytes_per_flush() as i64,
        )?;
        let max_bytes_per_flush = clamp_flush_bytes(requested_bytes);
        if max_bytes_per_flush as i64 != requested_bytes {
            tracing::warn!(
                requested = requested_bytes,
                effective = max_bytes_per_flush,
                "MAX_BYTES_PER_FLUSH out of range, clamped"
            );
        }

        let max_messages_per_flush: usize = parse_or(
            config,
            "MAX_MESSAGES_PER_FLUSH",
            default_max_messages_per_flush(),
        )?;
        if max_messages_per_flush == 0 {
            return Err(ArchiverError::ConfigError(
                "MAX_MESSAGES_PER_FLUSH must be at least 1".to_string(),
            ));
        }

        let receive_timeout_ms: u64 = parse_or(
            config,
            "RECEIVE_TIMEOUT_MS",
            default_receive_timeout().as_millis() as u64,
        )?;
        let probe_timeout_ms: u64 = parse_or(
            config,
            "PROBE_TIMEOUT_MS",
            default_probe_timeout().as_millis() as u64,
        )?;
        let safety_margin_s: u64 = parse_or(
            config,
            "SAFETY_MARGIN_S",
            default_safety_margin().as_secs(),
        )?;
        let initial_upload_bytes_per_sec: f64 = parse_or(
            config,
            "INITIAL_UPLOAD_BYTES_PER_SEC",
            DEFAULT_UPLOAD_BYTES_PER_SEC,
        )?;
        if !(initial_upload_bytes_per_sec.is_finite() && initial_upload_bytes_per_sec > 0.0) {
            return Err(ArchiverError::ConfigError(
                "INITIAL_UPLOAD_BYTES_PER_SEC must be a positive number".to_string(),
            ));
        }

        let flush = FlushConfig {
            max_bytes_per_flush,
            max_messages_per_flush,
            // Zero would turn every receive into an immediate timeout.
            receive_timeout: Duration::from_millis(receive_timeout_ms.max(1)),
            probe_timeout: Duration::from_millis(probe_timeout_ms.max(1)),
            safety_margin: Duration::from_secs(safety_margin_s),
            initial_upload_bytes_per_sec,
            spool_path: optional(config, "SPOOL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(default_spool_path),
        };

        let invoke_timeout_ms: u64 = parse_or(
            config,
            "INVOKE_TIMEOUT_MS",
            default_invoke_timeout().as_millis() as u64,
        )?;
        let dispatch = DispatchConfig {
            endpoint: optional(config, "INVOKE_ENDPOINT"),
            token: optional(config, "INVOKE_TOKEN"),
            timeout: Duration::from_millis(invoke_timeout_ms),
        };

        Ok(ArchiverConfig {
            queue,
            storage,
            flush,
            seek_policy,
            dispatch,
        })
    }
}

/// Clamp a requested flush size into `[MIN_BYTES_PER_FLUSH, MAX_BYTES_PER_FLUSH_LIMIT]`.
pub fn clamp_flush_bytes(requested: i64) -> u64 {
    if requested <= 0 {
        MIN_BYTES_PER_FLUSH
    } else {
        (requested as u64).min(MAX_BYTES_PER_FLUSH_LIMIT)
    }
}

fn required(config: &HashMap<String, String>, key: &str) -> Result<String> {
    optional(config, key)
        .ok_or_else(|| ArchiverError::ConfigError(format!("missing required '{}'", key)))
}

/// Present and non-blank.
fn optional(config: &HashMap<String, String>, key: &str) -> Option<String> {
    config
        .get(key)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_or<T>(config: &HashMap<String, String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    optional(config, key)
        .map(|s| {
            s.parse::<T>()
                .map_err(|e| ArchiverError::ConfigError(format!("invalid {}: {}", key, e)))
        })
        .transpose()
        .map(|v| v.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config_map() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("QUEUE_ENDPOINT".to_string(), "localhost:9092".to_string());
        m.insert("QUEUE_CLUSTER".to_string(), "cluster-a".to_string());
        m.insert("QUEUE_ENVIRONMENT".to_string(), "prod".to_string());
        m.insert("QUEUE_TOPIC".to_string(), "orders".to_string());
        m.insert("QUEUE_SUBSCRIPTION".to_string(), "archiver".to_string());
        m.insert("BUCKET_NAME".to_string(), "archive-bucket".to_string());
        m.insert("BUCKET_REGION".to_string(), "us-east-1".to_string());
        m
    }

    // ---------------------------------------------------------------
    // Defaults
    // ---------------------------------------------------------------

    #[test]
    fn test_config_parse_minimal() {
        let config = ArchiverConfig::from_config_map(&base_config_map()).unwrap();
        assert_eq!(config.queue.backend, QueueBackend::Kafka);
        assert_eq!(config.queue.endpoint, "localhost:9092");
        assert_eq!(config.queue.topic, "orders");
        assert!(config.queue.partitions.is_none());
        assert!(config.queue.listener_name.is_none());
        assert_eq!(config.seek_policy, SeekPolicy::Earliest);
        assert_eq!(config.storage.bucket, "archive-bucket");
        assert_eq!(config.storage.key_prefix, "");
        assert_eq!(config.flush.max_bytes_per_flush, 100 * 1024 * 1024);
        assert_eq!(config.flush.max_messages_per_flush, 10_000);
        assert_eq!(config.flush.receive_timeout, Duration::from_millis(3000));
        assert_eq!(config.flush.probe_timeout, Duration::from_millis(5000));
        assert_eq!(config.flush.safety_margin, Duration::from_secs(5));
        assert_eq!(
            config.flush.spool_path,
            PathBuf::from("/tmp/streamhouse-archiver.spool")
        );
        assert!(config.dispatch.endpoint.is_none());
        assert_eq!(config.dispatch.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_config_parse_all_options() {
        let mut m = base_config_map();
        m.insert("QUEUE_BACKEND".to_string(), "Memory".to_string());
        m.insert("QUEUE_LISTENER_NAME".to_string(), "internal".to_string());
        m.insert("QUEUE_AUTH_TOKEN".to_string(), "secret".to_string());
        m.insert("QUEUE_PARTITIONS".to_string(), "4".to_string());
        m.insert("SEEK_POLICY".to_string(), "1700000000".to_string());
        m.insert("OBJECT_KEY_PREFIX".to_string(), "raw/".to_string());
        m.insert("OBJECT_STORE_ENDPOINT".to_string(), "http://localhost:9000".to_string());
        m.insert("MAX_BYTES_PER_FLUSH".to_string(), "1048576".to_string());
        m.insert("MAX_MESSAGES_PER_FLUSH".to_string(), "250".to_string());
        m.insert("RECEIVE_TIMEOUT_MS".to_string(), "500".to_string());
        m.insert("SAFETY_MARGIN_S".to_string(), "8".to_string());
        m.insert("SPOOL_PATH".to_string(), "/var/tmp/spool.txt".to_string());
        m.insert("INVOKE_ENDPOINT".to_string(), "http://invoke.local".to_string());

        let config = ArchiverConfig::from_config_map(&m).unwrap();
        assert_eq!(config.queue.backend, QueueBackend::Memory);
        assert_eq!(config.queue.listener_name.as_deref(), Some("internal"));
        assert_eq!(config.queue.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.queue.partitions, Some(PartitionSpec::Count(4)));
        assert_eq!(config.seek_policy, SeekPolicy::Timestamp(1_700_000_000_000));
        assert_eq!(config.storage.key_prefix, "raw/");
        assert_eq!(
            config.storage.endpoint.as_deref(),
            Some("http://localhost:9000")
        );
        assert_eq!(config.flush.max_bytes_per_flush, 1_048_576);
        assert_eq!(config.flush.max_messages_per_flush, 250);
        assert_eq!(config.flush.receive_timeout, Duration::from_millis(500));
        assert_eq!(config.flush.safety_margin, Duration::from_secs(8));
        assert_eq!(config.flush.spool_path, PathBuf::from("/var/tmp/spool.txt"));
        assert_eq!(config.dispatch.endpoint.as_deref(), Some("http://invoke.local"));
    }

    // ---------------------------------------------------------------
    // Required keys
    // ---------------------------------------------------------------

    #[test]
    fn test_config_missing_required_keys() {
        for key in [
            "QUEUE_ENDPOINT",
            "QUEUE_CLUSTER",
            "QUEUE_ENVIRONMENT",
            "QUEUE_TOPIC",
            "QUEUE_SUBSCRIPTION",
            "BUCKET_NAME",
            "BUCKET_REGION",
        ] {
            let mut m = base_config_map();
            m.remove(key);
            let err = ArchiverConfig::from_config_map(&m).unwrap_err();
            assert!(
                matches!(&err, ArchiverError::ConfigError(msg) if msg.contains(key)),
                "expected missing '{}' error, got {:?}",
                key,
                err
            );
        }
    }

    #[test]
    fn test_config_blank_value_counts_as_missing() {
        let mut m = base_config_map();
        m.insert("QUEUE_TOPIC".to_string(), "   ".to_string());
        assert!(ArchiverConfig::from_config_map(&m).is_err());
    }

    // ---------------------------------------------------------------
    // Validation
    // ---------------------------------------------------------------

    #[test]
    fn test_config_invalid_numbers() {
        for key in [
            "MAX_BYTES_PER_FLUSH",
            "MAX_MESSAGES_PER_FLUSH",
            "RECEIVE_TIMEOUT_MS",
            "SAFETY_MARGIN_S",
            "INVOKE_TIMEOUT_MS",
        ] {
            let mut m = base_config_map();
            m.insert(key.to_string(), "not_a_number".to_string());
            assert!(
                ArchiverConfig::from_config_map(&m).is_err(),
                "expected error for {}",
                key
            );
        }
    }

    #[test]
    fn test_config_invalid_seek_policy() {
        let mut m = base_config_map();
        m.insert("SEEK_POLICY".to_string(), "yesterday".to_string());
        assert!(ArchiverConfig::from_config_map(&m).is_err());
    }

    #[test]
    fn test_config_invalid_backend() {
        let mut m = base_config_map();
        m.insert("QUEUE_BACKEND".to_string(), "rabbitmq".to_string());
        assert!(ArchiverConfig::from_config_map(&m).is_err());
    }

    #[test]
    fn test_config_zero_messages_per_flush_rejected() {
        let mut m = base_config_map();
        m.insert("MAX_MESSAGES_PER_FLUSH".to_string(), "0".to_string());
        assert!(ArchiverConfig::from_config_map(&m).is_err());
    }

    #[test]
    fn test_config_non_positive_upload_seed_rejected() {
        let mut m = base_config_map();
        m.insert("INITIAL_UPLOAD_BYTES_PER_SEC".to_string(), "0".to_string());
        assert!(ArchiverConfig::from_config_map(&m).is_err());
    }

    #[test]
    fn test_config_tiny_upload_seed_accepted() {
        let mut m = base_config_map();
        m.insert("INITIAL_UPLOAD_BYTES_PER_SEC".to_string(), "1e-300".to_string());
        let config = ArchiverConfig::from_config_map(&m).unwrap();
        let estimator =
            crate::throughput::ThroughputEstimator::new(config.flush.initial_upload_bytes_per_sec);
        assert_eq!(estimator.predict(6), Duration::MAX);
    }

    #[test]
    fn test_max_bytes_clamped() {
        let mut m = base_config_map();
        m.insert("MAX_BYTES_PER_FLUSH".to_string(), "0".to_string());
        let config = ArchiverConfig::from_config_map(&m).unwrap();
        assert_eq!(config.flush.max_bytes_per_flush, MIN_BYTES_PER_FLUSH);

        m.insert("MAX_BYTES_PER_FLUSH".to_string(), "-20".to_string());
        let config = ArchiverConfig::from_config_map(&m).unwrap();
        assert_eq!(config.flush.max_bytes_per_flush, MIN_BYTES_PER_FLUSH);

        m.insert(
            "MAX_BYTES_PER_FLUSH".to_string(),
            (2u64 * 1024 * 1024 * 1024).to_string(),
        );
        let config = ArchiverConfig::from_config_map(&m).unwrap();
        assert_eq!(config.flush.max_bytes_per_flush, MAX_BYTES_PER_FLUSH_LIMIT);
    }

    // ---------------------------------------------------------------
    // PartitionSpec
    // ---------------------------------------------------------------

    #[test]
    fn test_partition_spec_parse() {
        assert_eq!("3".parse::<PartitionSpec>().unwrap(), PartitionSpec::Count(3));
        assert_eq!(
            "orders-0, orders-1".parse::<PartitionSpec>().unwrap(),
            PartitionSpec::Names(vec!["orders-0".to_string(), "orders-1".to_string()])
        );
        assert!("0".parse::<PartitionSpec>().is_err());
        assert!(" , ".parse::<PartitionSpec>().is_err());
    }

    #[test]
    fn test_queue_backend_parse() {
        assert_eq!("KAFKA".parse::<QueueBackend>().unwrap(), QueueBackend::Kafka);
        assert_eq!(" memory ".parse::<QueueBackend>().unwrap(), QueueBackend::Memory);
        assert!("pulsar".parse::<QueueBackend>().is_err());
    }
}
