//! Shared fixtures: fast channel configs and a fault-injecting log bus.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use weather_relay::bus::{BusResult, FetchLimits, GroupState, LogBus, Poll};
use weather_relay::compression::Compression;
use weather_relay::{
    BusError, ChannelConfig, CommitStrategy, MemoryLog, MemoryLogConfig, PublishRecord,
    RequiredAcks, StartOffset, WeatherEvent,
};

pub const TOPIC: &str = "weather-topic";
pub const GROUP: &str = "weather-consumer-group";

/// Config with short timers so tests finish quickly.
pub fn fast_config() -> ChannelConfig {
    ChannelConfig {
        topic: TOPIC.to_string(),
        group_id: GROUP.to_string(),
        batch_size: 1,
        batch_linger: Duration::from_millis(10),
        compression: Compression::None,
        required_acks: RequiredAcks::All,
        max_attempts: 3,
        backoff_min: Duration::from_millis(5),
        backoff_max: Duration::from_millis(20),
        io_timeout: Duration::from_secs(2),
        fetch_min_bytes: 1,
        max_wait: Duration::from_millis(50),
        commit_strategy: CommitStrategy::PerRecord,
        commit_interval: Duration::from_millis(50),
        rebalance_timeout: Duration::from_secs(2),
        start_offset: StartOffset::Earliest,
        drain_timeout: Duration::from_secs(1),
        ..ChannelConfig::default()
    }
}

pub fn broker(partitions: i32) -> Arc<MemoryLog> {
    MemoryLog::new(MemoryLogConfig {
        num_partitions: partitions,
        ..MemoryLogConfig::default()
    })
}

pub fn pe_rain() -> WeatherEvent {
    WeatherEvent::new("PE", "rain", "light rain")
}

pub fn raw(key: &str, value: &[u8]) -> PublishRecord {
    PublishRecord::new(key.as_bytes().to_vec(), value.to_vec())
}

/// Wraps a real log client, recording appends and failing on demand.
pub struct FaultyLog {
    inner: Arc<dyn LogBus>,
    /// Every append attempt, successful or not, in call order.
    pub appends: Mutex<Vec<Vec<PublishRecord>>>,
    pub polls: AtomicU64,
    pub commits: AtomicU64,
    append_failures: AtomicU32,
    append_error: Mutex<BusError>,
    append_delay: Mutex<Duration>,
    poll_failures: AtomicU32,
    commit_failures: AtomicU32,
}

impl FaultyLog {
    pub fn new(inner: Arc<dyn LogBus>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            appends: Mutex::new(Vec::new()),
            polls: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            append_failures: AtomicU32::new(0),
            append_error: Mutex::new(BusError::Unavailable("injected".into())),
            append_delay: Mutex::new(Duration::ZERO),
            poll_failures: AtomicU32::new(0),
            commit_failures: AtomicU32::new(0),
        })
    }

    /// Fail the next `n` appends with `error`; `u32::MAX` fails forever.
    pub fn fail_appends(&self, n: u32, error: BusError) {
        *self.append_error.lock() = error;
        self.append_failures.store(n, Ordering::SeqCst);
    }

    pub fn delay_appends(&self, delay: Duration) {
        *self.append_delay.lock() = delay;
    }

    pub fn fail_polls(&self, n: u32) {
        self.poll_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_commits(&self, n: u32) {
        self.commit_failures.store(n, Ordering::SeqCst);
    }

    pub fn append_attempts(&self) -> usize {
        self.appends.lock().len()
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

#[async_trait]
impl LogBus for FaultyLog {
    async fn append(
        &self,
        topic: &str,
        records: &[PublishRecord],
        acks: RequiredAcks,
    ) -> BusResult<Vec<weather_relay::types::RecordPosition>> {
        self.appends.lock().push(records.to_vec());
        let delay = *self.append_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if Self::take_failure(&self.append_failures) {
            return Err(self.append_error.lock().clone());
        }
        self.inner.append(topic, records, acks).await
    }

    async fn join(&self, group: &str, topic: &str, start: StartOffset) -> BusResult<String> {
        self.inner.join(group, topic, start).await
    }

    async fn sync(&self, member: &str) -> BusResult<GroupState> {
        self.inner.sync(member).await
    }

    async fn poll(
        &self,
        member: &str,
        generation: u64,
        positions: &[(i32, i64)],
        limits: FetchLimits,
    ) -> BusResult<Poll> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.poll_failures) {
            return Err(BusError::Unavailable("injected".into()));
        }
        self.inner.poll(member, generation, positions, limits).await
    }

    async fn commit(&self, member: &str, offsets: &[(i32, i64)]) -> BusResult<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.commit_failures) {
            return Err(BusError::Timeout(Duration::from_millis(1)));
        }
        self.inner.commit(member, offsets).await
    }

    async fn leave(&self, member: &str) -> BusResult<()> {
        self.inner.leave(member).await
    }

    async fn close(&self) -> BusResult<()> {
        self.inner.close().await
    }
}
