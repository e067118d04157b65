//! Error types for the StreamHouse archiver.
//!
//! Every failure a worker or scheduler invocation can hit maps to one variant
//! here. Only [`ArchiverError::ReceiveTimeout`] is recovered locally (it means
//! "no more messages right now"); everything else aborts the current
//! invocation and is reported to the host as a [`ResultCode`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while draining a partition or fanning out.
#[derive(Debug, Error)]
pub enum ArchiverError {
    /// Missing or invalid environment/event parameter.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Queue or object-store client could not be constructed.
    #[error("Connection error: {0}")]
    ConnectError(String),

    /// No message arrived within the receive window.
    #[error("Receive timed out")]
    ReceiveTimeout,

    /// Non-timeout failure reported by the queue (receive, seek).
    #[error("Queue error: {0}")]
    QueueError(String),

    /// Local spool write/truncate/seek failure.
    #[error("Buffer I/O error: {0}")]
    BufferIoError(#[from] std::io::Error),

    /// Object-store upload failure.
    #[error("Upload error: {0}")]
    UploadError(String),

    /// One partition's fan-out invocation could not be dispatched.
    #[error("Dispatch error: {0}")]
    DispatchError(String),

    /// Event/context (de)serialization failure.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Result type alias for archiver operations.
pub type Result<T> = std::result::Result<T, ArchiverError>;

impl From<serde_json::Error> for ArchiverError {
    fn from(e: serde_json::Error) -> Self {
        ArchiverError::SerializationError(e.to_string())
    }
}

/// Result code returned to the host platform for one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultCode {
    Success,
    QueueConnectError,
    InvalidParameter,
    TimerInvokeError,
    ConsumerInvokeError,
}

/// Which kind of invocation produced an error; selects the fallback code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    Timer,
    Consumer,
}

impl ArchiverError {
    /// Map this error to the result code reported for an invocation of `kind`.
    pub fn result_code(&self, kind: InvocationKind) -> ResultCode {
        match self {
            ArchiverError::ConfigError(_) | ArchiverError::SerializationError(_) => {
                ResultCode::InvalidParameter
            }
            ArchiverError::ConnectError(_) | ArchiverError::QueueError(_) => {
                ResultCode::QueueConnectError
            }
            _ => match kind {
                InvocationKind::Timer => ResultCode::TimerInvokeError,
                InvocationKind::Consumer => ResultCode::ConsumerInvokeError,
            },
        }
    }

    /// Short, stable label used for metrics and structured logs.
    pub fn kind_label(&self) -> &'static str {
        match self {
            ArchiverError::ConfigError(_) => "config",
            ArchiverError::ConnectError(_) => "connect",
            ArchiverError::ReceiveTimeout => "receive_timeout",
            ArchiverError::QueueError(_) => "queue",
            ArchiverError::BufferIoError(_) => "buffer_io",
            ArchiverError::UploadError(_) => "upload",
            ArchiverError::DispatchError(_) => "dispatch",
            ArchiverError::SerializationError(_) => "serialization",
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResultCode::Success => "Success",
            ResultCode::QueueConnectError => "QueueConnectError",
            ResultCode::InvalidParameter => "InvalidParameter",
            ResultCode::TimerInvokeError => "TimerInvokeError",
            ResultCode::ConsumerInvokeError => "ConsumerInvokeError",
        };
        write!(f, "{}", s)
    }
}
