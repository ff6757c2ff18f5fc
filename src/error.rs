//! Error types for the relay pipeline.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result alias for construction and startup paths.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors surfaced while building or running relay components.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Consume error: {0}")]
    Consume(#[from] ConsumeError),

    #[error("Shutdown error: {0}")]
    Shutdown(#[from] ShutdownError),
}

/// Invalid or unparsable configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },

    #[error("backoff-min {min:?} exceeds backoff-max {max:?}")]
    BackoffRange { min: Duration, max: Duration },

    #[error("{0} must be at least 1")]
    Zero(&'static str),

    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// Payload does not match the weather event shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Failure reported by a bus binding.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("leader not available for {topic}/{partition}")]
    LeaderNotAvailable { topic: String, partition: i32 },

    #[error("not enough replicas: acked={acked} required={required}")]
    NotEnoughReplicas { acked: usize, required: usize },

    #[error("rebalance in progress for group {0}")]
    RebalanceInProgress(String),

    #[error("unknown group member {0}")]
    UnknownMember(String),

    #[error("connection closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("rejected by bus: {0}")]
    Rejected(String),
}

impl BusError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BusError::Unavailable(_)
                | BusError::Timeout(_)
                | BusError::LeaderNotAvailable { .. }
                | BusError::NotEnoughReplicas { .. }
                | BusError::RebalanceInProgress(_)
        )
    }
}

/// Coarse classification of [`PublishError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishErrorKind {
    Transient,
    Exhausted,
    Closed,
    Rejected,
    Encoding,
}

/// Failure of a single `send`.
#[derive(Error, Debug, Clone)]
pub enum PublishError {
    /// A transient failure the channel stopped retrying because it is shutting down.
    #[error("transient failure: {0}")]
    Transient(BusError),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: BusError },

    #[error("channel closed")]
    Closed,

    #[error("rejected: {0}")]
    Rejected(BusError),

    #[error("encoding failed: {0}")]
    Encoding(String),
}

impl PublishError {
    pub fn kind(&self) -> PublishErrorKind {
        match self {
            PublishError::Transient(_) => PublishErrorKind::Transient,
            PublishError::Exhausted { .. } => PublishErrorKind::Exhausted,
            PublishError::Closed => PublishErrorKind::Closed,
            PublishError::Rejected(_) => PublishErrorKind::Rejected,
            PublishError::Encoding(_) => PublishErrorKind::Encoding,
        }
    }
}

/// Coarse classification of [`ConsumeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeErrorKind {
    Transient,
    Cancelled,
    RebalanceTimeout,
    Closed,
    Fatal,
}

/// Failure of `receive` or `commit`.
#[derive(Error, Debug, Clone)]
pub enum ConsumeError {
    /// Transient bus failure. `receive` retries these internally; `commit` surfaces
    /// one only after its attempts are used up.
    #[error("transient failure: {0}")]
    Transient(BusError),

    #[error("cancelled")]
    Cancelled,

    #[error("rebalance did not complete within {0:?}")]
    RebalanceTimeout(Duration),

    #[error("channel closed")]
    Closed,

    #[error("bus failure: {0}")]
    Fatal(BusError),
}

impl ConsumeError {
    pub fn kind(&self) -> ConsumeErrorKind {
        match self {
            ConsumeError::Transient(_) => ConsumeErrorKind::Transient,
            ConsumeError::Cancelled => ConsumeErrorKind::Cancelled,
            ConsumeError::RebalanceTimeout(_) => ConsumeErrorKind::RebalanceTimeout,
            ConsumeError::Closed => ConsumeErrorKind::Closed,
            ConsumeError::Fatal(_) => ConsumeErrorKind::Fatal,
        }
    }
}

/// Shutdown did not complete cleanly.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
    #[error("{component} did not drain within {after:?}")]
    TimedOut { component: String, after: Duration },
}
