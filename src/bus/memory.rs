//! In-memory log broker: partitioned topics, committed offsets and consumer
//! groups with generation-fenced rebalances.

use super::{Assignment, BusResult, FetchLimits, GroupState, LogBus, LogRecord, Poll};
use crate::config::{RequiredAcks, StartOffset};
use crate::error::BusError;
use crate::types::{PublishRecord, RecordPosition};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Broker-wide configuration.
#[derive(Clone, Debug)]
pub struct MemoryLogConfig {
    /// Partitions per topic created on demand.
    pub num_partitions: i32,
    /// Replicas that confirm under `RequiredAcks::All`.
    pub replication_factor: i16,
    /// Members silent for longer than this are evicted, starting a rebalance.
    pub session_timeout: Duration,
}

impl Default for MemoryLogConfig {
    fn default() -> Self {
        Self {
            num_partitions: 1,
            replication_factor: 1,
            session_timeout: Duration::from_secs(30),
        }
    }
}

struct Topic {
    partitions: Vec<RwLock<Vec<LogRecord>>>,
}

impl Topic {
    fn high_water_mark(&self, partition: i32) -> i64 {
        self.partitions
            .get(partition as usize)
            .map(|p| p.read().len() as i64)
            .unwrap_or(0)
    }
}

struct Member {
    start: StartOffset,
    synced_generation: Option<u64>,
    last_seen: Instant,
    assignment: Vec<i32>,
}

struct Group {
    topic: String,
    generation: u64,
    stable_generation: Option<u64>,
    rebalancing: bool,
    members: BTreeMap<String, Member>,
}

impl Group {
    fn begin_rebalance(&mut self) {
        self.generation += 1;
        self.rebalancing = true;
    }
}

/// Central in-memory log: creates topics, routes appends, tracks groups.
pub struct MemoryLog {
    config: MemoryLogConfig,
    topics: DashMap<String, Arc<Topic>>,
    /// (group, topic, partition) -> next offset to read.
    offsets: DashMap<(String, String, i32), i64>,
    groups: Mutex<HashMap<String, Group>>,
    /// Woken on every append and group change.
    changed: Notify,
    requests: AtomicU64,
    /// Polls served; picks the partition each poll starts from.
    fetches: AtomicU64,
}

impl MemoryLog {
    pub fn new(config: MemoryLogConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            topics: DashMap::new(),
            offsets: DashMap::new(),
            groups: Mutex::new(HashMap::new()),
            changed: Notify::new(),
            requests: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
        })
    }

    /// Open an exclusive client connection.
    pub fn connect(self: &Arc<Self>) -> MemoryLogClient {
        MemoryLogClient {
            broker: Arc::clone(self),
            closed: AtomicBool::new(false),
            members: Mutex::new(Vec::new()),
        }
    }

    /// Create a topic with `num_partitions`. Idempotent when the count matches.
    pub fn create_topic(&self, name: &str, num_partitions: i32) -> BusResult<()> {
        if let Some(existing) = self.topics.get(name) {
            if existing.partitions.len() != num_partitions as usize {
                return Err(BusError::Rejected(format!(
                    "topic {} exists with {} partitions, cannot change to {}",
                    name,
                    existing.partitions.len(),
                    num_partitions
                )));
            }
            return Ok(());
        }
        let partitions = (0..num_partitions.max(1))
            .map(|_| RwLock::new(Vec::new()))
            .collect();
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Topic { partitions }));
        Ok(())
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        if let Some(topic) = self.topics.get(name) {
            return Arc::clone(&topic);
        }
        let partitions = (0..self.config.num_partitions.max(1))
            .map(|_| RwLock::new(Vec::new()))
            .collect();
        Arc::clone(
            &self
                .topics
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Topic { partitions })),
        )
    }

    pub fn num_partitions(&self, topic: &str) -> i32 {
        self.topic(topic).partitions.len() as i32
    }

    pub fn high_water_mark(&self, topic: &str, partition: i32) -> i64 {
        self.topic(topic).high_water_mark(partition)
    }

    /// Every record of a partition, in offset order.
    pub fn records(&self, topic: &str, partition: i32) -> Vec<LogRecord> {
        self.topic(topic)
            .partitions
            .get(partition as usize)
            .map(|p| p.read().clone())
            .unwrap_or_default()
    }

    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.offsets
            .get(&(group.to_string(), topic.to_string(), partition))
            .map(|r| *r)
    }

    /// Requests served by all clients of this broker.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Whether `group` is between generations.
    pub fn is_rebalancing(&self, group: &str) -> bool {
        self.groups
            .lock()
            .get(group)
            .map(|g| g.rebalancing)
            .unwrap_or(false)
    }

    fn partition_for(key: &[u8], partitions: usize) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % partitions.max(1) as u64) as usize
    }

    fn append_records(
        &self,
        topic_name: &str,
        records: &[PublishRecord],
        acks: RequiredAcks,
    ) -> BusResult<Vec<RecordPosition>> {
        if acks == RequiredAcks::All && self.config.replication_factor < 1 {
            return Err(BusError::NotEnoughReplicas {
                acked: 0,
                required: 1,
            });
        }
        let topic = self.topic(topic_name);
        let mut positions = Vec::with_capacity(records.len());
        for record in records {
            let idx = Self::partition_for(&record.key, topic.partitions.len());
            let mut log = topic.partitions[idx].write();
            let offset = log.len() as i64;
            log.push(LogRecord {
                partition: idx as i32,
                offset,
                record: record.clone(),
            });
            positions.push(RecordPosition {
                partition: idx as i32,
                offset,
            });
        }
        self.changed.notify_waiters();
        Ok(match acks {
            RequiredAcks::None => Vec::new(),
            RequiredAcks::Leader | RequiredAcks::All => positions,
        })
    }

    fn join_group(&self, group_id: &str, topic: &str, start: StartOffset) -> BusResult<String> {
        let mut groups = self.groups.lock();
        let group = groups.entry(group_id.to_string()).or_insert_with(|| Group {
            topic: topic.to_string(),
            generation: 0,
            stable_generation: None,
            rebalancing: false,
            members: BTreeMap::new(),
        });
        if group.topic != topic {
            return Err(BusError::Rejected(format!(
                "group {} consumes {}, not {}",
                group_id, group.topic, topic
            )));
        }
        let member_id = format!("{}-{}", group_id, uuid::Uuid::new_v4());
        group.members.insert(
            member_id.clone(),
            Member {
                start,
                synced_generation: None,
                last_seen: Instant::now(),
                assignment: Vec::new(),
            },
        );
        group.begin_rebalance();
        drop(groups);
        self.changed.notify_waiters();
        tracing::debug!(group = group_id, member = %member_id, "member joined");
        Ok(member_id)
    }

    fn group_of(groups: &HashMap<String, Group>, member: &str) -> Option<String> {
        groups
            .iter()
            .find(|(_, g)| g.members.contains_key(member))
            .map(|(id, _)| id.clone())
    }

    /// Evict members whose session lapsed. Returns true when a rebalance started.
    fn expire_members(&self, group: &mut Group, caller: &str) -> bool {
        let timeout = self.config.session_timeout;
        let before = group.members.len();
        group
            .members
            .retain(|id, m| id == caller || m.last_seen.elapsed() <= timeout);
        if group.members.len() != before {
            group.begin_rebalance();
            true
        } else {
            false
        }
    }

    fn sync_member(&self, member_id: &str) -> BusResult<GroupState> {
        let mut groups = self.groups.lock();
        let group_id = Self::group_of(&groups, member_id)
            .ok_or_else(|| BusError::UnknownMember(member_id.to_string()))?;
        let Some(group) = groups.get_mut(&group_id) else {
            return Err(BusError::UnknownMember(member_id.to_string()));
        };
        let mut changed = self.expire_members(group, member_id);

        let generation = group.generation;
        if let Some(member) = group.members.get_mut(member_id) {
            member.last_seen = Instant::now();
            member.synced_generation = Some(generation);
        }

        if group.rebalancing
            && group
                .members
                .values()
                .all(|m| m.synced_generation == Some(generation))
        {
            let partitions = self.topic(&group.topic).partitions.len() as i32;
            let ids: Vec<String> = group.members.keys().cloned().collect();
            for member in group.members.values_mut() {
                member.assignment.clear();
            }
            for p in 0..partitions {
                let owner = &ids[p as usize % ids.len()];
                if let Some(member) = group.members.get_mut(owner) {
                    member.assignment.push(p);
                }
            }
            group.rebalancing = false;
            group.stable_generation = Some(generation);
            changed = true;
            tracing::debug!(group = %group_id, generation, members = ids.len(), "rebalance complete");
        }

        let state = if group.rebalancing {
            GroupState::Rebalancing
        } else {
            let topic = self.topic(&group.topic);
            let member = group
                .members
                .get(member_id)
                .ok_or_else(|| BusError::UnknownMember(member_id.to_string()))?;
            let assignments = member
                .assignment
                .iter()
                .map(|&partition| {
                    let start = self.committed(&group_id, &group.topic, partition).unwrap_or(
                        match member.start {
                            StartOffset::Earliest => 0,
                            StartOffset::Latest => topic.high_water_mark(partition),
                        },
                    );
                    Assignment { partition, start }
                })
                .collect();
            GroupState::Stable {
                generation,
                assignments,
            }
        };
        drop(groups);
        if changed {
            self.changed.notify_waiters();
        }
        Ok(state)
    }

    /// Returns the topic and assigned partitions, or `None` when the member must resync.
    fn check_fetch(&self, member_id: &str, generation: u64) -> BusResult<Option<(String, Vec<i32>)>> {
        let mut groups = self.groups.lock();
        let group_id = Self::group_of(&groups, member_id)
            .ok_or_else(|| BusError::UnknownMember(member_id.to_string()))?;
        let Some(group) = groups.get_mut(&group_id) else {
            return Err(BusError::UnknownMember(member_id.to_string()));
        };
        let expired = self.expire_members(group, member_id);
        if let Some(member) = group.members.get_mut(member_id) {
            member.last_seen = Instant::now();
        }
        let result = if group.rebalancing || group.stable_generation != Some(generation) {
            None
        } else {
            group
                .members
                .get(member_id)
                .map(|m| (group.topic.clone(), m.assignment.clone()))
        };
        drop(groups);
        if expired {
            self.changed.notify_waiters();
        }
        Ok(result)
    }

    /// Collect records from `positions`, starting at partition index `start`
    /// and wrapping, so a full partition cannot starve the ones after it.
    fn gather(
        topic: &Topic,
        positions: &[(i32, i64)],
        start: usize,
        assigned: &[i32],
        limits: &FetchLimits,
    ) -> (Vec<LogRecord>, usize) {
        let mut out = Vec::new();
        let mut bytes = 0usize;
        let n = positions.len();
        let rotated = (0..n).map(|i| positions[(start + i) % n]);
        'partitions: for (partition, offset) in rotated {
            if !assigned.contains(&partition) {
                continue;
            }
            let Some(log) = topic.partitions.get(partition as usize) else {
                continue;
            };
            let log = log.read();
            for stored in log.iter().skip(offset.max(0) as usize) {
                let len = stored.record.encoded_len();
                if out.len() >= limits.max_records
                    || (!out.is_empty() && bytes + len > limits.max_bytes)
                {
                    break 'partitions;
                }
                bytes += len;
                out.push(stored.clone());
            }
        }
        (out, bytes)
    }

    async fn poll_records(
        &self,
        member_id: &str,
        generation: u64,
        positions: &[(i32, i64)],
        limits: FetchLimits,
    ) -> BusResult<Poll> {
        let deadline = tokio::time::Instant::now() + limits.max_wait;
        let start = self.fetches.fetch_add(1, Ordering::Relaxed) as usize;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let Some((topic_name, assigned)) = self.check_fetch(member_id, generation)? else {
                return Ok(Poll::Rebalancing);
            };
            let topic = self.topic(&topic_name);
            let (records, bytes) = Self::gather(&topic, positions, start, &assigned, &limits);
            if bytes >= limits.min_bytes.max(1) || tokio::time::Instant::now() >= deadline {
                return Ok(Poll::Records(records));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let (records, _) = Self::gather(&topic, positions, start, &assigned, &limits);
                return Ok(Poll::Records(records));
            }
        }
    }

    fn commit_offsets(&self, member_id: &str, offsets: &[(i32, i64)]) -> BusResult<()> {
        let groups = self.groups.lock();
        let group_id = Self::group_of(&groups, member_id)
            .ok_or_else(|| BusError::UnknownMember(member_id.to_string()))?;
        let Some(group) = groups.get(&group_id) else {
            return Err(BusError::UnknownMember(member_id.to_string()));
        };
        let member_generation = group
            .members
            .get(member_id)
            .and_then(|m| m.synced_generation);
        // Members of the last stable generation may still commit while a rebalance runs.
        if group.stable_generation.is_none() || member_generation != group.stable_generation {
            return Err(BusError::RebalanceInProgress(group_id));
        }
        let owned = group
            .members
            .get(member_id)
            .map(|m| m.assignment.clone())
            .unwrap_or_default();
        for &(partition, offset) in offsets {
            if owned.contains(&partition) {
                self.offsets
                    .insert((group_id.clone(), group.topic.clone(), partition), offset);
            }
        }
        Ok(())
    }

    fn leave_group(&self, member_id: &str) -> BusResult<()> {
        let mut groups = self.groups.lock();
        let Some(group_id) = Self::group_of(&groups, member_id) else {
            return Ok(());
        };
        if let Some(group) = groups.get_mut(&group_id) {
            group.members.remove(member_id);
            if group.members.is_empty() {
                groups.remove(&group_id);
            } else {
                group.begin_rebalance();
            }
        }
        drop(groups);
        self.changed.notify_waiters();
        tracing::debug!(member = member_id, "member left");
        Ok(())
    }
}

/// One client connection to a [`MemoryLog`].
pub struct MemoryLogClient {
    broker: Arc<MemoryLog>,
    closed: AtomicBool,
    members: Mutex<Vec<String>>,
}

impl MemoryLogClient {
    fn begin(&self) -> BusResult<&MemoryLog> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        self.broker.requests.fetch_add(1, Ordering::Relaxed);
        Ok(&self.broker)
    }
}

#[async_trait]
impl LogBus for MemoryLogClient {
    async fn append(
        &self,
        topic: &str,
        records: &[PublishRecord],
        acks: RequiredAcks,
    ) -> BusResult<Vec<RecordPosition>> {
        self.begin()?.append_records(topic, records, acks)
    }

    async fn join(&self, group: &str, topic: &str, start: StartOffset) -> BusResult<String> {
        let member = self.begin()?.join_group(group, topic, start)?;
        self.members.lock().push(member.clone());
        Ok(member)
    }

    async fn sync(&self, member: &str) -> BusResult<GroupState> {
        self.begin()?.sync_member(member)
    }

    async fn poll(
        &self,
        member: &str,
        generation: u64,
        positions: &[(i32, i64)],
        limits: FetchLimits,
    ) -> BusResult<Poll> {
        self.begin()?
            .poll_records(member, generation, positions, limits)
            .await
    }

    async fn commit(&self, member: &str, offsets: &[(i32, i64)]) -> BusResult<()> {
        self.begin()?.commit_offsets(member, offsets)
    }

    async fn leave(&self, member: &str) -> BusResult<()> {
        self.begin()?.leave_group(member)?;
        self.members.lock().retain(|m| m != member);
        Ok(())
    }

    async fn close(&self) -> BusResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let members = std::mem::take(&mut *self.members.lock());
        for member in members {
            self.broker.leave_group(&member)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> FetchLimits {
        FetchLimits {
            min_bytes: 1,
            max_bytes: 1024 * 1024,
            max_records: 100,
            max_wait: Duration::from_millis(20),
        }
    }

    fn record(key: &str, value: &str) -> PublishRecord {
        PublishRecord::new(key.as_bytes().to_vec(), value.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn append_then_poll_in_order() {
        let broker = MemoryLog::new(MemoryLogConfig::default());
        let client = broker.connect();
        let positions = client
            .append("t", &[record("k", "a"), record("k", "b")], RequiredAcks::All)
            .await
            .unwrap();
        assert_eq!(positions.iter().map(|p| p.offset).collect::<Vec<_>>(), vec![0, 1]);

        let member = client.join("g", "t", StartOffset::Earliest).await.unwrap();
        let GroupState::Stable {
            generation,
            assignments,
        } = client.sync(&member).await.unwrap()
        else {
            panic!("single member group should stabilise on first sync");
        };
        assert_eq!(assignments, vec![Assignment { partition: 0, start: 0 }]);

        let Poll::Records(records) = client
            .poll(&member, generation, &[(0, 0)], limits())
            .await
            .unwrap()
        else {
            panic!("expected records");
        };
        let values: Vec<&[u8]> = records.iter().map(|r| r.record.value.as_slice()).collect();
        assert_eq!(values, vec![&b"a"[..], &b"b"[..]]);
    }

    #[tokio::test]
    async fn acks_none_returns_no_positions() {
        let broker = MemoryLog::new(MemoryLogConfig::default());
        let client = broker.connect();
        let positions = client
            .append("t", &[record("k", "a")], RequiredAcks::None)
            .await
            .unwrap();
        assert!(positions.is_empty());
        assert_eq!(broker.high_water_mark("t", 0), 1);
    }

    #[tokio::test]
    async fn join_fences_old_generation() {
        let broker = MemoryLog::new(MemoryLogConfig {
            num_partitions: 2,
            ..Default::default()
        });
        let a = broker.connect();
        let b = broker.connect();
        let ma = a.join("g", "t", StartOffset::Earliest).await.unwrap();
        let GroupState::Stable { generation, .. } = a.sync(&ma).await.unwrap() else {
            panic!("expected stable");
        };

        let mb = b.join("g", "t", StartOffset::Earliest).await.unwrap();
        assert_eq!(
            a.poll(&ma, generation, &[(0, 0)], limits()).await.unwrap(),
            Poll::Rebalancing
        );
        assert_eq!(a.sync(&ma).await.unwrap(), GroupState::Rebalancing);

        let GroupState::Stable {
            assignments: for_b,
            ..
        } = b.sync(&mb).await.unwrap()
        else {
            panic!("last member to sync completes the rebalance");
        };
        let GroupState::Stable {
            assignments: for_a,
            ..
        } = a.sync(&ma).await.unwrap()
        else {
            panic!("expected stable");
        };
        assert_eq!(for_a.len() + for_b.len(), 2);
    }

    #[tokio::test]
    async fn latest_start_skips_existing_records() {
        let broker = MemoryLog::new(MemoryLogConfig::default());
        let client = broker.connect();
        client
            .append("t", &[record("k", "old")], RequiredAcks::Leader)
            .await
            .unwrap();
        let member = client.join("g", "t", StartOffset::Latest).await.unwrap();
        let GroupState::Stable { assignments, .. } = client.sync(&member).await.unwrap() else {
            panic!("expected stable");
        };
        assert_eq!(assignments[0].start, 1);
    }

    #[tokio::test]
    async fn busy_partition_does_not_starve_the_next() {
        let broker = MemoryLog::new(MemoryLogConfig {
            num_partitions: 2,
            ..Default::default()
        });
        let client = broker.connect();
        let mut i = 0;
        while broker.high_water_mark("t", 0) < 5 || broker.high_water_mark("t", 1) < 1 {
            client
                .append("t", &[record(&format!("k{}", i), "v")], RequiredAcks::All)
                .await
                .unwrap();
            i += 1;
        }
        let member = client.join("g", "t", StartOffset::Earliest).await.unwrap();
        let GroupState::Stable { generation, .. } = client.sync(&member).await.unwrap() else {
            panic!("expected stable");
        };

        let one = FetchLimits {
            max_records: 1,
            ..limits()
        };
        let mut seen = Vec::new();
        for _ in 0..2 {
            let Poll::Records(records) = client
                .poll(&member, generation, &[(0, 0), (1, 0)], one)
                .await
                .unwrap()
            else {
                panic!("expected records");
            };
            seen.extend(records.iter().map(|r| r.partition));
        }
        seen.sort();
        assert_eq!(seen, vec![0, 1]);
    }

    #[tokio::test]
    async fn closed_client_is_rejected_and_leaves() {
        let broker = MemoryLog::new(MemoryLogConfig::default());
        let client = broker.connect();
        let member = client.join("g", "t", StartOffset::Earliest).await.unwrap();
        client.close().await.unwrap();
        assert_eq!(client.sync(&member).await, Err(BusError::Closed));
        assert!(!broker.is_rebalancing("g"));
        let other = broker.connect();
        assert_eq!(
            other.sync(&member).await,
            Err(BusError::UnknownMember(member.clone()))
        );
    }
}
