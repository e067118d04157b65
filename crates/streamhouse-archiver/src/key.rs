//! Object key naming.
//!
//! Every flush is written under
//!
//! ```text
//! <prefix><cluster>/<environment>/<topic>/<subscription>/<YYYY-MM-DD>/
//!     from_<first_ts>_to_<last_ts>_<partition>_<invocation_ts>_<request_id>.txt
//! ```
//!
//! Timestamps are Unix milliseconds zero-padded to 13 digits, so keys for the
//! same partition and day sort by time. The flush timestamp together with
//! the request id makes the key unique per flush.

use chrono::{TimeZone, Utc};

/// Width of a millisecond timestamp in a key.
const TS_WIDTH: usize = 13;

/// The components of one upload key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadKey {
    pub prefix: String,
    pub cluster: String,
    pub environment: String,
    pub topic: String,
    pub subscription: String,
    pub partition: String,
    pub first_publish_ms: u64,
    pub last_publish_ms: u64,
    /// Flush time; also selects the date directory.
    pub invocation_ms: u64,
    pub request_id: String,
}

impl UploadKey {
    /// `YYYY-MM-DD` of the flush time, in UTC.
    pub fn date(&self) -> String {
        match Utc.timestamp_millis_opt(self.invocation_ms as i64).single() {
            Some(dt) => dt.format("%Y-%m-%d").to_string(),
            None => "1970-01-01".to_string(),
        }
    }

    /// Render the full object key.
    pub fn render(&self) -> String {
        format!(
            "{}{}/{}/{}/{}/{}/from_{:0w$}_to_{:0w$}_{}_{:0w$}_{}.txt",
            normalize_prefix(&self.prefix),
            sanitize_segment(&self.cluster),
            sanitize_segment(&self.environment),
            sanitize_segment(&self.topic),
            sanitize_segment(&self.subscription),
            self.date(),
            self.first_publish_ms,
            self.last_publish_ms,
            sanitize_segment(&self.partition),
            self.invocation_ms,
            sanitize_segment(&self.request_id),
            w = TS_WIDTH,
        )
    }
}

impl std::fmt::Display for UploadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// A non-empty prefix always ends with exactly one `/`.
fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

/// Keep a name inside a single path segment.
fn sanitize_segment(segment: &str) -> String {
    segment
        .chars()
        .map(|c| match c {
            '/' | ':' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}
