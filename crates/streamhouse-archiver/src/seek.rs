//! Seek policy resolution.
//!
//! `earliest` and `latest` only choose where a new subscription starts. An
//! explicit timestamp is resolved with a probe: the worker connects at the
//! earliest position, receives one message and compares its publish time
//! `t0` with the requested time `T`.
//!
//! - `T < t0`: the probe is already past `T`, so it is kept and buffered
//!   before the main loop.
//! - `T >= t0`: the subscription is repositioned to `T` and the probe is
//!   dropped (it will not be acknowledged).
//!
//! This assumes publish times are non-decreasing within a partition.

use std::str::FromStr;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{ArchiverError, Result};
use crate::traits::{Message, MessageSource, StartPosition};

/// Where the worker starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekPolicy {
    Earliest,
    Latest,
    /// Publish time in Unix milliseconds.
    Timestamp(u64),
}

impl FromStr for SeekPolicy {
    type Err = ArchiverError;

    /// `earliest`, `latest` (any case) or Unix seconds.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.to_lowercase().as_str() {
            "earliest" => Ok(SeekPolicy::Earliest),
            "latest" => Ok(SeekPolicy::Latest),
            _ => s
                .parse::<u64>()
                .ok()
                .and_then(|secs| secs.checked_mul(1000))
                .map(SeekPolicy::Timestamp)
                .ok_or_else(|| {
                    ArchiverError::ConfigError(format!(
                        "invalid SEEK_POLICY '{}': expected 'earliest', 'latest' or Unix seconds",
                        s
                    ))
                }),
        }
    }
}

/// Result of applying a seek policy to a fresh subscription.
#[derive(Debug)]
pub enum SeekOutcome {
    /// Ready to consume; `probe` must be buffered before anything else.
    Ready { probe: Option<Message> },
    /// The probe timed out: the partition has nothing to read.
    NoTraffic,
}

impl SeekPolicy {
    /// Start position used when connecting.
    pub fn start_position(&self) -> StartPosition {
        match self {
            SeekPolicy::Latest => StartPosition::Latest,
            SeekPolicy::Earliest | SeekPolicy::Timestamp(_) => StartPosition::Earliest,
        }
    }

    /// Position `source` according to this policy.
    pub async fn apply(
        &self,
        source: &mut dyn MessageSource,
        probe_timeout: Duration,
    ) -> Result<SeekOutcome> {
        let target_ms = match self {
            SeekPolicy::Earliest | SeekPolicy::Latest => {
                return Ok(SeekOutcome::Ready { probe: None });
            }
            SeekPolicy::Timestamp(ms) => *ms,
        };

        let probe = match source.receive(probe_timeout).await {
            Ok(msg) => msg,
            Err(ArchiverError::ReceiveTimeout) => {
                info!(
                    partition = %source.partition(),
                    "No message within probe timeout, nothing to consume"
                );
                return Ok(SeekOutcome::NoTraffic);
            }
            Err(e) => return Err(e),
        };

        if target_ms < probe.publish_time_ms {
            debug!(
                partition = %source.partition(),
                target_ms,
                probe_publish_ms = probe.publish_time_ms,
                "Probe is after seek time, keeping it"
            );
            Ok(SeekOutcome::Ready { probe: Some(probe) })
        } else {
            debug!(
                partition = %source.partition(),
                target_ms,
                probe_publish_ms = probe.publish_time_ms,
                "Seeking to timestamp"
            );
            source.seek_to_time(target_ms).await?;
            Ok(SeekOutcome::Ready { probe: None })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::memory::MemoryTopic;
    use crate::traits::{MessageId, QueueConnector};

    // ---------------------------------------------------------------
    // Parsing
    // ---------------------------------------------------------------

    #[test]
    fn test_parse_named_policies() {
        assert_eq!("earliest".parse::<SeekPolicy>().unwrap(), SeekPolicy::Earliest);
        assert_eq!("LATEST".parse::<SeekPolicy>().unwrap(), SeekPolicy::Latest);
        assert_eq!(" Earliest ".parse::<SeekPolicy>().unwrap(), SeekPolicy::Earliest);
    }

    #[test]
    fn test_parse_timestamp_seconds() {
        assert_eq!(
            "1700000000".parse::<SeekPolicy>().unwrap(),
            SeekPolicy::Timestamp(1_700_000_000_000)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for bad in ["", "now", "-5", "1.5", "earliest-ish"] {
            let err = bad.parse::<SeekPolicy>().unwrap_err();
            assert!(matches!(err, ArchiverError::ConfigError(_)), "{}", bad);
        }
    }

    #[test]
    fn test_start_position() {
        assert_eq!(SeekPolicy::Earliest.start_position(), StartPosition::Earliest);
        assert_eq!(SeekPolicy::Latest.start_position(), StartPosition::Latest);
        assert_eq!(SeekPolicy::Timestamp(1).start_position(), StartPosition::Earliest);
    }

    // ---------------------------------------------------------------
    // Probe
    // ---------------------------------------------------------------

    async fn topic_with(times: &[u64]) -> MemoryTopic {
        let topic = MemoryTopic::new("orders", &["orders-partition-0"]);
        for (i, t) in times.iter().enumerate() {
            topic
                .publish("orders-partition-0", format!("m{}", i), *t)
                .await
                .unwrap();
        }
        topic
    }

    #[tokio::test]
    async fn test_named_policy_needs_no_probe() {
        let topic = topic_with(&[1_000]).await;
        let mut source = topic
            .connector("sub")
            .connect("orders-partition-0", StartPosition::Earliest)
            .await
            .unwrap();
        let outcome = SeekPolicy::Earliest
            .apply(source.as_mut(), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(matches!(outcome, SeekOutcome::Ready { probe: None }));
        // Nothing was consumed by the policy.
        let msg = source.receive(Duration::from_millis(10)).await.unwrap();
        assert_eq!(msg.id, MessageId(0));
    }

    #[tokio::test]
    async fn test_target_before_probe_keeps_probe() {
        let topic = topic_with(&[5_000, 6_000]).await;
        let mut source = topic
            .connector("sub")
            .connect("orders-partition-0", StartPosition::Earliest)
            .await
            .unwrap();
        let outcome = SeekPolicy::Timestamp(1_000)
            .apply(source.as_mut(), Duration::from_millis(10))
            .await
            .unwrap();
        match outcome {
            SeekOutcome::Ready { probe: Some(msg) } => assert_eq!(msg.publish_time_ms, 5_000),
            other => panic!("expected probe to be kept, got {:?}", other),
        }
        let next = source.receive(Duration::from_millis(10)).await.unwrap();
        assert_eq!(next.publish_time_ms, 6_000);
    }

    #[tokio::test]
    async fn test_target_after_probe_seeks() {
        let topic = topic_with(&[1_000, 2_000, 3_000, 4_000]).await;
        let mut source = topic
            .connector("sub")
            .connect("orders-partition-0", StartPosition::Earliest)
            .await
            .unwrap();
        let outcome = SeekPolicy::Timestamp(3_000)
            .apply(source.as_mut(), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(matches!(outcome, SeekOutcome::Ready { probe: None }));
        let next = source.receive(Duration::from_millis(10)).await.unwrap();
        assert!(next.publish_time_ms >= 3_000);
        assert_eq!(next.publish_time_ms, 3_000);
    }

    #[tokio::test]
    async fn test_target_equal_to_probe_seeks() {
        let topic = topic_with(&[2_000, 2_500]).await;
        let mut source = topic
            .connector("sub")
            .connect("orders-partition-0", StartPosition::Earliest)
            .await
            .unwrap();
        let outcome = SeekPolicy::Timestamp(2_000)
            .apply(source.as_mut(), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(matches!(outcome, SeekOutcome::Ready { probe: None }));
        let next = source.receive(Duration::from_millis(10)).await.unwrap();
        assert_eq!(next.publish_time_ms, 2_000);
    }

    #[tokio::test]
    async fn test_empty_partition_is_no_traffic() {
        let topic = topic_with(&[]).await;
        let mut source = topic
            .connector("sub")
            .connect("orders-partition-0", StartPosition::Earliest)
            .await
            .unwrap();
        let outcome = SeekPolicy::Timestamp(1_000)
            .apply(source.as_mut(), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(matches!(outcome, SeekOutcome::NoTraffic));
    }

    #[tokio::test]
    async fn test_seek_failure_is_propagated() {
        let topic = topic_with(&[1_000, 2_000]).await;
        topic.fail_seek(true).await;
        let mut source = topic
            .connector("sub")
            .connect("orders-partition-0", StartPosition::Earliest)
            .await
            .unwrap();
        let err = SeekPolicy::Timestamp(1_500)
            .apply(source.as_mut(), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiverError::QueueError(_)));
    }
}
