//! Bus boundary: the two capability shapes a concrete binding provides, plus
//! in-memory and remote bindings.
//!
//! A channel owns exactly one [`Connection`]; connections are never shared
//! between channels.

mod memory;
mod queue;
mod remote;

pub use memory::{MemoryLog, MemoryLogClient, MemoryLogConfig};
pub use queue::{MemoryQueue, MemoryQueueClient};
pub use remote::RemoteBus;

use crate::config::{BusKind, RequiredAcks, StartOffset};
use crate::error::BusError;
use crate::types::{PublishRecord, RecordPosition};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub type BusResult<T> = std::result::Result<T, BusError>;

/// Record stored in a log partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub partition: i32,
    pub offset: i64,
    pub record: PublishRecord,
}

/// A partition handed to a group member, with where to resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub partition: i32,
    /// Next offset to read.
    pub start: i64,
}

/// Consumer-group state as seen by one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupState {
    Rebalancing,
    Stable {
        generation: u64,
        assignments: Vec<Assignment>,
    },
}

/// Fetch limits for one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchLimits {
    pub min_bytes: usize,
    pub max_bytes: usize,
    pub max_records: usize,
    pub max_wait: Duration,
}

/// Result of a poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Poll {
    Records(Vec<LogRecord>),
    /// The member's generation is stale; it must sync before fetching again.
    Rebalancing,
}

/// Message delivered from a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub queue: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub record: PublishRecord,
    /// Connection session the tag belongs to. Stamped by the binding; tags
    /// restart whenever a binding opens a new session.
    #[serde(skip)]
    pub session: u64,
}

/// Log-style bus (partitioned topics, consumer groups, committed offsets).
#[async_trait]
pub trait LogBus: Send + Sync {
    /// Append records in order; positions are returned unless `acks` is `None`.
    async fn append(
        &self,
        topic: &str,
        records: &[PublishRecord],
        acks: RequiredAcks,
    ) -> BusResult<Vec<RecordPosition>>;

    /// Join (or create) a consumer group; returns the member id.
    async fn join(&self, group: &str, topic: &str, start: StartOffset) -> BusResult<String>;

    /// Report readiness for the current generation and learn the assignment.
    async fn sync(&self, member: &str) -> BusResult<GroupState>;

    /// Fetch from `positions` (partition, next offset) for `generation`.
    async fn poll(
        &self,
        member: &str,
        generation: u64,
        positions: &[(i32, i64)],
        limits: FetchLimits,
    ) -> BusResult<Poll>;

    /// Store next-offset-to-read per partition for the member's group.
    async fn commit(&self, member: &str, offsets: &[(i32, i64)]) -> BusResult<()>;

    async fn leave(&self, member: &str) -> BusResult<()>;

    /// Release the connection; later calls fail with `Closed`.
    async fn close(&self) -> BusResult<()>;
}

/// Queue-style bus (competing consumers, delivery tags, acknowledgements).
#[async_trait]
pub trait QueueBus: Send + Sync {
    /// Publish one record; with `confirm` the call returns after the broker stored it.
    async fn publish(&self, queue: &str, record: &PublishRecord, confirm: bool) -> BusResult<()>;

    /// Wait up to `wait` for deliveries, returning at most `max`.
    async fn consume(&self, queue: &str, max: usize, wait: Duration) -> BusResult<Vec<Delivery>>;

    /// Acknowledge `delivery_tag` of `session`, or every tag up to it with
    /// `multiple`. An ack for a session that is no longer open is dropped: the
    /// broker has already requeued everything delivered on it.
    async fn ack(&self, session: u64, delivery_tag: u64, multiple: bool) -> BusResult<()>;

    /// Release the connection; unacknowledged deliveries are requeued.
    async fn close(&self) -> BusResult<()>;
}

/// The connection a channel owns.
#[derive(Clone)]
pub enum Connection {
    Log(Arc<dyn LogBus>),
    Queue(Arc<dyn QueueBus>),
}

impl Connection {
    pub fn kind(&self) -> BusKind {
        match self {
            Connection::Log(_) => BusKind::Log,
            Connection::Queue(_) => BusKind::Queue,
        }
    }

    pub async fn close(&self) -> BusResult<()> {
        match self {
            Connection::Log(bus) => bus.close().await,
            Connection::Queue(bus) => bus.close().await,
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection::{}", self.kind())
    }
}
