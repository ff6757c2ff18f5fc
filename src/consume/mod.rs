//! ConsumeChannel: at-least-once reads from one bus source.
//!
//! Positions are tracked client-side: the channel asks the bus for records
//! from its own next-offset per partition and only advances the durable
//! cursor through `commit`. Records delivered but not committed when a
//! rebalance or crash happens are delivered again.

mod tracker;

use crate::backoff::Backoff;
use crate::bus::{Connection, FetchLimits, GroupState, LogBus, Poll, QueueBus};
use crate::codec::EventCodec;
use crate::config::{ChannelConfig, CommitStrategy};
use crate::error::{BusError, ConfigError, ConsumeError, ShutdownError};
use crate::lifecycle::FatalReporter;
use crate::observability::observability;
use crate::types::{ConsumedRecord, RecordSource, WeatherEvent};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracker::CommitTracker;

/// Callbacks around partition reassignment.
pub trait RebalanceListener: Send + Sync {
    /// Called before buffered records are dropped; `partitions` were owned until now.
    fn on_revoked(&self, _partitions: &[i32]) {}

    /// Called once the new generation is stable, before any record of it is delivered.
    fn on_assigned(&self, _partitions: &[i32]) {}
}

#[derive(Debug, Clone)]
struct Membership {
    member_id: String,
    generation: u64,
}

/// State shared with the interval committer.
struct Shared {
    name: String,
    config: Arc<ChannelConfig>,
    connection: Connection,
    tracker: parking_lot::Mutex<CommitTracker>,
    membership: parking_lot::Mutex<Option<Membership>>,
}

impl Shared {
    /// Commit every ready watermark. Returns how many sources advanced.
    async fn commit_ready(&self) -> Result<usize, BusError> {
        let (ready, generation) = {
            let tracker = self.tracker.lock();
            (tracker.ready(), tracker.generation())
        };
        if ready.is_empty() {
            return Ok(0);
        }
        match &self.connection {
            Connection::Log(bus) => {
                let Some(member) = self.membership.lock().as_ref().map(|m| m.member_id.clone())
                else {
                    return Ok(0);
                };
                let offsets: Vec<(i32, i64)> = ready
                    .iter()
                    .filter_map(|(source, position)| match source {
                        RecordSource::Partition { partition, .. } => Some((*partition, position + 1)),
                        RecordSource::Queue(_) => None,
                    })
                    .collect();
                bus.commit(&member, &offsets).await?;
            }
            Connection::Queue(bus) => {
                for (_, tag) in &ready {
                    bus.ack(generation, *tag as u64, true).await?;
                }
            }
        }
        let mut tracker = self.tracker.lock();
        if tracker.generation() != generation {
            // reset while the commit was in flight; those positions are gone
            return Ok(0);
        }
        for (source, position) in &ready {
            tracker.committed(source, *position);
        }
        drop(tracker);
        observability().record_commit(ready.len());
        debug!(channel = %self.name, positions = ?ready, "committed");
        Ok(ready.len())
    }

    async fn commit_with_retry(&self) -> Result<(), ConsumeError> {
        let mut backoff = Backoff::new(self.config.backoff_min, self.config.backoff_max);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match self.commit_ready().await {
                Ok(_) => return Ok(()),
                Err(e) => e,
            };
            match err {
                BusError::Closed => return Err(ConsumeError::Closed),
                e if !e.is_transient() => return Err(ConsumeError::Fatal(e)),
                e if attempt >= self.config.max_attempts => {
                    error!(channel = %self.name, attempts = attempt, error = %e, "commit failed");
                    return Err(ConsumeError::Transient(e));
                }
                e => {
                    let delay = backoff.next_delay();
                    warn!(channel = %self.name, attempt, error = %e, "commit failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Records fetched but not yet handed out, plus the next position per partition.
struct ReadState {
    buffer: VecDeque<ConsumedRecord>,
    positions: BTreeMap<i32, i64>,
    backoff: Backoff,
}

/// Receiving side of one source. Owns its connection exclusively.
pub struct ConsumeChannel {
    shared: Arc<Shared>,
    state: tokio::sync::Mutex<ReadState>,
    closed: AtomicBool,
    close_token: CancellationToken,
    failed: parking_lot::Mutex<Option<ConsumeError>>,
    committer: parking_lot::Mutex<Option<JoinHandle<()>>>,
    listener: Option<Arc<dyn RebalanceListener>>,
    fatal: Option<FatalReporter>,
}

impl ConsumeChannel {
    /// Validate `config` and, for the interval strategy, start the committer.
    /// Joining the group is deferred to [`ConsumeChannel::subscribe`] or the first `receive`.
    pub fn new(
        name: impl Into<String>,
        config: ChannelConfig,
        connection: Connection,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        let shared = Arc::new(Shared {
            name: name.into(),
            config: Arc::clone(&config),
            connection,
            tracker: parking_lot::Mutex::new(CommitTracker::default()),
            membership: parking_lot::Mutex::new(None),
        });
        let close_token = CancellationToken::new();
        let committer = match config.commit_strategy {
            CommitStrategy::Interval => Some(tokio::spawn(run_committer(
                Arc::clone(&shared),
                close_token.clone(),
            ))),
            CommitStrategy::PerRecord => None,
        };
        Ok(Self {
            shared,
            state: tokio::sync::Mutex::new(ReadState {
                buffer: VecDeque::new(),
                positions: BTreeMap::new(),
                backoff: Backoff::new(config.backoff_min, config.backoff_max),
            }),
            closed: AtomicBool::new(false),
            close_token,
            failed: parking_lot::Mutex::new(None),
            committer: parking_lot::Mutex::new(committer),
            listener: None,
            fatal: None,
        })
    }

    pub fn with_listener(mut self, listener: Arc<dyn RebalanceListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Report rebalance timeouts to a lifecycle controller.
    pub fn with_fatal_reporter(mut self, reporter: FatalReporter) -> Self {
        self.fatal = Some(reporter);
        self
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Member id and generation once the group is joined (log buses only).
    pub fn membership(&self) -> Option<(String, u64)> {
        self.shared
            .membership
            .lock()
            .as_ref()
            .map(|m| (m.member_id.clone(), m.generation))
    }

    fn check_open(&self) -> Result<(), ConsumeError> {
        if self.is_closed() {
            return Err(ConsumeError::Closed);
        }
        if let Some(err) = self.failed.lock().clone() {
            return Err(err);
        }
        Ok(())
    }

    /// Join the consumer group and wait for a stable assignment. No-op for queue
    /// buses and when already joined.
    pub async fn subscribe(&self, ctx: &CancellationToken) -> Result<(), ConsumeError> {
        self.check_open()?;
        let mut state = self.lock_state(ctx).await?;
        if let Connection::Log(bus) = &self.shared.connection {
            if self.shared.membership.lock().is_none() {
                self.sync_until_stable(bus.as_ref(), &mut state, ctx).await?;
            }
        }
        Ok(())
    }

    async fn lock_state(
        &self,
        ctx: &CancellationToken,
    ) -> Result<tokio::sync::MutexGuard<'_, ReadState>, ConsumeError> {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(ConsumeError::Cancelled),
            _ = self.close_token.cancelled() => Err(ConsumeError::Closed),
            state = self.state.lock() => Ok(state),
        }
    }

    /// Wait for the next record. Transient bus failures are retried with backoff;
    /// cancellation of `ctx` returns `Cancelled` without consuming anything.
    pub async fn receive(&self, ctx: &CancellationToken) -> Result<ConsumedRecord, ConsumeError> {
        self.check_open()?;
        let mut state = self.lock_state(ctx).await?;
        loop {
            if let Some(record) = state.buffer.pop_front() {
                self.shared
                    .tracker
                    .lock()
                    .delivered(&record.source, record.position);
                observability().record_consumed(1);
                return Ok(record);
            }
            match &self.shared.connection {
                Connection::Log(bus) => self.fill_from_log(bus.as_ref(), &mut state, ctx).await?,
                Connection::Queue(bus) => self.fill_from_queue(bus.as_ref(), &mut state, ctx).await?,
            }
        }
    }

    /// Mark `record` processed and, with the per-record strategy, commit now.
    /// Records from before a rebalance or a queue reconnect are ignored; they
    /// will be redelivered.
    pub async fn commit(&self, record: &ConsumedRecord) -> Result<(), ConsumeError> {
        if self.is_closed() {
            return Err(ConsumeError::Closed);
        }
        let accepted =
            self.shared
                .tracker
                .lock()
                .processed(&record.source, record.position, record.generation);
        if !accepted {
            debug!(
                channel = %self.shared.name,
                position = record.position,
                "commit for a record of an earlier generation or session ignored"
            );
            return Ok(());
        }
        match self.shared.config.commit_strategy {
            CommitStrategy::PerRecord => self.shared.commit_with_retry().await,
            CommitStrategy::Interval => Ok(()),
        }
    }

    /// Receive, decode, hand to `handler`, commit; until `ctx` is cancelled or
    /// the channel closes. Malformed payloads are logged, committed and skipped.
    pub async fn run<H, Fut>(&self, ctx: &CancellationToken, mut handler: H) -> Result<(), ConsumeError>
    where
        H: FnMut(WeatherEvent) -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            let record = match self.receive(ctx).await {
                Ok(record) => record,
                Err(ConsumeError::Cancelled) | Err(ConsumeError::Closed) => return Ok(()),
                Err(e) => return Err(e),
            };
            match EventCodec::decode_record(&record) {
                Ok(event) => handler(event).await,
                Err(e) => {
                    observability().record_malformed();
                    warn!(
                        channel = %self.shared.name,
                        position = record.position,
                        error = %e,
                        "malformed payload skipped"
                    );
                }
            }
            match self.commit(&record).await {
                Ok(()) => {}
                Err(ConsumeError::Transient(e)) => {
                    warn!(channel = %self.shared.name, error = %e, "commit deferred");
                }
                Err(ConsumeError::Closed) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Stop delivering, commit processed positions, leave the group and
    /// release the connection, within the configured drain timeout.
    pub async fn close(&self) -> Result<(), ShutdownError> {
        self.close_within(self.shared.config.drain_timeout).await
    }

    pub async fn close_within(&self, budget: Duration) -> Result<(), ShutdownError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.close_token.cancel();
        let committer = self.committer.lock().take();
        let shared = Arc::clone(&self.shared);

        let finish = async move {
            if let Some(committer) = committer {
                let _ = committer.await;
            }
            if let Err(e) = shared.commit_ready().await {
                warn!(channel = %shared.name, error = %e, "final commit failed");
            }
            if let Connection::Log(bus) = &shared.connection {
                let membership = shared.membership.lock().take();
                if let Some(m) = membership {
                    if let Err(e) = bus.leave(&m.member_id).await {
                        warn!(channel = %shared.name, error = %e, "leaving group failed");
                    }
                }
            }
        };
        let result = match tokio::time::timeout(budget, finish).await {
            Ok(()) => Ok(()),
            Err(_) => {
                error!(channel = %self.shared.name, after = ?budget, "consume channel did not drain in time");
                Err(ShutdownError::TimedOut {
                    component: self.shared.name.clone(),
                    after: budget,
                })
            }
        };
        if let Err(e) = self.shared.connection.close().await {
            warn!(channel = %self.shared.name, error = %e, "closing connection failed");
        }
        debug!(channel = %self.shared.name, "consume channel closed");
        result
    }

    /// Run `request` bounded by the io timeout plus the server-side wait,
    /// aborting on cancellation or close.
    async fn guarded<T>(
        &self,
        ctx: &CancellationToken,
        request: impl Future<Output = Result<T, BusError>>,
    ) -> Result<Result<T, BusError>, ConsumeError> {
        let budget = self.shared.config.io_timeout + self.shared.config.max_wait;
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(ConsumeError::Cancelled),
            _ = self.close_token.cancelled() => Err(ConsumeError::Closed),
            r = tokio::time::timeout(budget, request) => Ok(r.unwrap_or(Err(BusError::Timeout(budget)))),
        }
    }

    async fn pause(&self, ctx: &CancellationToken, delay: Duration) -> Result<(), ConsumeError> {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(ConsumeError::Cancelled),
            _ = self.close_token.cancelled() => Err(ConsumeError::Closed),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Classify a failed read: back off on transient errors, surface the rest.
    async fn read_failed(
        &self,
        state: &mut ReadState,
        ctx: &CancellationToken,
        err: BusError,
    ) -> Result<(), ConsumeError> {
        match err {
            BusError::Closed => Err(ConsumeError::Closed),
            e if e.is_transient() => {
                let delay = state.backoff.next_delay();
                warn!(
                    channel = %self.shared.name,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "read failed, backing off"
                );
                self.pause(ctx, delay).await
            }
            e => Err(ConsumeError::Fatal(e)),
        }
    }

    fn limits(&self) -> FetchLimits {
        let c = &self.shared.config;
        FetchLimits {
            min_bytes: c.fetch_min_bytes,
            max_bytes: c.fetch_max_bytes,
            max_records: c.fetch_max_records,
            max_wait: c.max_wait,
        }
    }

    async fn fill_from_log(
        &self,
        bus: &dyn LogBus,
        state: &mut ReadState,
        ctx: &CancellationToken,
    ) -> Result<(), ConsumeError> {
        let membership = self.shared.membership.lock().clone();
        let Some(membership) = membership else {
            return self.sync_until_stable(bus, state, ctx).await;
        };
        let positions: Vec<(i32, i64)> = state.positions.iter().map(|(p, o)| (*p, *o)).collect();
        let limits = self.limits();
        let polled = self
            .guarded(
                ctx,
                bus.poll(&membership.member_id, membership.generation, &positions, limits),
            )
            .await?;
        match polled {
            Ok(Poll::Records(records)) => {
                state.backoff.reset();
                let topic = &self.shared.config.topic;
                for stored in records {
                    state.positions.insert(stored.partition, stored.offset + 1);
                    state.buffer.push_back(ConsumedRecord {
                        source: RecordSource::Partition {
                            topic: topic.clone(),
                            partition: stored.partition,
                        },
                        position: stored.offset,
                        key: stored.record.key,
                        value: stored.record.value,
                        headers: stored.record.headers,
                        timestamp: stored.record.timestamp,
                        redelivered: false,
                        generation: membership.generation,
                    });
                }
                Ok(())
            }
            Ok(Poll::Rebalancing) => self.rebalance(bus, state, ctx).await,
            Err(BusError::UnknownMember(member)) => {
                warn!(channel = %self.shared.name, member = %member, "membership lost, rejoining");
                *self.shared.membership.lock() = None;
                self.rebalance(bus, state, ctx).await
            }
            Err(e) => self.read_failed(state, ctx, e).await,
        }
    }

    async fn fill_from_queue(
        &self,
        bus: &dyn QueueBus,
        state: &mut ReadState,
        ctx: &CancellationToken,
    ) -> Result<(), ConsumeError> {
        let c = &self.shared.config;
        let consumed = self
            .guarded(ctx, bus.consume(&c.topic, c.fetch_max_records, c.max_wait))
            .await?;
        match consumed {
            Ok(deliveries) => {
                state.backoff.reset();
                if let Some(session) = deliveries.first().map(|d| d.session) {
                    let mut tracker = self.shared.tracker.lock();
                    if tracker.generation() != session {
                        info!(
                            channel = %self.shared.name,
                            session,
                            "new queue session, earlier deliveries are requeued by the broker"
                        );
                        tracker.reset(session);
                    }
                }
                for d in deliveries {
                    state.buffer.push_back(ConsumedRecord {
                        source: RecordSource::Queue(d.queue),
                        position: d.delivery_tag as i64,
                        key: d.record.key,
                        value: d.record.value,
                        headers: d.record.headers,
                        timestamp: d.record.timestamp,
                        redelivered: d.redelivered,
                        generation: d.session,
                    });
                }
                Ok(())
            }
            Err(e) => self.read_failed(state, ctx, e).await,
        }
    }

    /// The bus fenced our generation: give up what we hold and wait for the new one.
    async fn rebalance(
        &self,
        bus: &dyn LogBus,
        state: &mut ReadState,
        ctx: &CancellationToken,
    ) -> Result<(), ConsumeError> {
        info!(channel = %self.shared.name, "rebalance started");
        observability().record_rebalance();
        if let Err(e) = self.shared.commit_ready().await {
            warn!(channel = %self.shared.name, error = %e, "commit before rebalance failed");
        }
        let revoked: Vec<i32> = state.positions.keys().copied().collect();
        if let Some(listener) = &self.listener {
            listener.on_revoked(&revoked);
        }
        state.buffer.clear();
        state.positions.clear();
        self.sync_until_stable(bus, state, ctx).await
    }

    /// Join if needed, then sync until the group is stable or the rebalance
    /// timeout passes. Nothing is delivered meanwhile.
    async fn sync_until_stable(
        &self,
        bus: &dyn LogBus,
        state: &mut ReadState,
        ctx: &CancellationToken,
    ) -> Result<(), ConsumeError> {
        let c = &self.shared.config;
        let deadline = Instant::now() + c.rebalance_timeout;
        let mut backoff = Backoff::new(c.backoff_min, c.backoff_max);
        loop {
            let membership = self.shared.membership.lock().clone();
            let outcome = match membership {
                None => self
                    .guarded(ctx, bus.join(&c.group_id, &c.topic, c.start_offset))
                    .await?
                    .map(|member_id| {
                        debug!(channel = %self.shared.name, member = %member_id, "joined group");
                        *self.shared.membership.lock() = Some(Membership {
                            member_id,
                            generation: 0,
                        });
                        GroupState::Rebalancing
                    }),
                Some(m) => self.guarded(ctx, bus.sync(&m.member_id)).await?,
            };

            match outcome {
                Ok(GroupState::Stable {
                    generation,
                    assignments,
                }) => {
                    let mut membership = self.shared.membership.lock();
                    if let Some(m) = membership.as_mut() {
                        m.generation = generation;
                    }
                    drop(membership);
                    self.shared.tracker.lock().reset(generation);
                    state.positions = assignments.iter().map(|a| (a.partition, a.start)).collect();
                    state.backoff.reset();
                    let partitions: Vec<i32> = assignments.iter().map(|a| a.partition).collect();
                    if let Some(listener) = &self.listener {
                        listener.on_assigned(&partitions);
                    }
                    info!(
                        channel = %self.shared.name,
                        generation,
                        partitions = ?partitions,
                        "rebalance complete"
                    );
                    return Ok(());
                }
                Ok(GroupState::Rebalancing) => {}
                Err(BusError::UnknownMember(_)) => {
                    *self.shared.membership.lock() = None;
                }
                Err(BusError::Closed) => return Err(ConsumeError::Closed),
                Err(e) if e.is_transient() => {
                    warn!(channel = %self.shared.name, error = %e, "sync failed, retrying");
                }
                Err(e) => return Err(ConsumeError::Fatal(e)),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.rebalance_timed_out());
            }
            let delay = backoff.next_delay().min(deadline - now);
            self.pause(ctx, delay).await?;
        }
    }

    fn rebalance_timed_out(&self) -> ConsumeError {
        let timeout = self.shared.config.rebalance_timeout;
        let err = ConsumeError::RebalanceTimeout(timeout);
        error!(channel = %self.shared.name, timeout = ?timeout, "rebalance did not complete");
        if let Some(fatal) = &self.fatal {
            fatal.report(&self.shared.name, &err);
        }
        *self.failed.lock() = Some(err.clone());
        err
    }
}

impl Drop for ConsumeChannel {
    fn drop(&mut self) {
        self.close_token.cancel();
    }
}

async fn run_committer(shared: Arc<Shared>, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.commit_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = shared.commit_ready().await {
                    warn!(channel = %shared.name, error = %e, "interval commit failed");
                }
            }
        }
    }
}
