//! PublishChannel: batched, retried sends to one bus destination.
//!
//! `send` hands records to a single flush task over a bounded queue. The task
//! cuts a batch when it reaches `batch_size` records or `batch_bytes`, or when
//! `batch_linger` has passed since the batch's first record, and writes
//! batches strictly in enqueue order.
//!
//! Once the channel's context is cancelled, new sends are refused and a
//! failing batch gets no further retries: the write in flight finishes, then
//! its waiters see the last error.

use crate::backoff::Backoff;
use crate::bus::Connection;
use crate::compression::Compression;
use crate::config::{ChannelConfig, RequiredAcks};
use crate::error::{BusError, ConfigError, PublishError, ShutdownError};
use crate::observability::observability;
use crate::types::{Ack, PublishRecord, RecordPosition, HEADER_CONTENT_ENCODING};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

type Reply = oneshot::Sender<Result<Ack, PublishError>>;

struct Pending {
    record: PublishRecord,
    /// `None` in async mode.
    reply: Option<Reply>,
}

/// Sending side of one destination. Owns its connection exclusively.
pub struct PublishChannel {
    name: String,
    config: Arc<ChannelConfig>,
    connection: Connection,
    tx: mpsc::Sender<Pending>,
    closed: AtomicBool,
    drain: CancellationToken,
    force: CancellationToken,
    context: CancellationToken,
    /// Cancelled when the flush task exits.
    done: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PublishChannel {
    /// Validate `config` and start the flush task. Must be called inside a tokio runtime.
    pub fn new(
        name: impl Into<String>,
        config: ChannelConfig,
        connection: Connection,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let name = name.into();
        let config = Arc::new(config);
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let drain = CancellationToken::new();
        let force = CancellationToken::new();
        let context = CancellationToken::new();
        let done = CancellationToken::new();
        let flusher = Flusher {
            name: name.clone(),
            config: Arc::clone(&config),
            connection: connection.clone(),
            rx,
            drain: drain.clone(),
            force: force.clone(),
            context: context.clone(),
            done: done.clone(),
        };
        let task = tokio::spawn(flusher.run());
        Ok(Self {
            name,
            config,
            connection,
            tx,
            closed: AtomicBool::new(false),
            drain,
            force,
            context,
            done,
            task: Mutex::new(Some(task)),
        })
    }

    /// Stop retrying and refuse new sends once `ctx` is cancelled.
    pub fn with_context(self, ctx: CancellationToken) -> Self {
        self.link_context(ctx);
        self
    }

    /// Like [`PublishChannel::with_context`] for a channel that is already shared.
    pub fn link_context(&self, ctx: CancellationToken) {
        let context = self.context.clone();
        let done = self.done.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = ctx.cancelled() => context.cancel(),
                _ = done.cancelled() => {}
            }
        });
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Enqueue `record`. In synchronous mode this resolves once the batch holding
    /// the record was acknowledged (or failed); in async mode once it is queued.
    pub async fn send(&self, mut record: PublishRecord) -> Result<Ack, PublishError> {
        if self.is_closed() || self.context.is_cancelled() {
            return Err(PublishError::Closed);
        }
        if self.config.compression != Compression::None {
            record.value = self
                .config
                .compression
                .compress(&record.value)
                .map_err(|e| PublishError::Encoding(e.to_string()))?;
            record.headers.insert(
                HEADER_CONTENT_ENCODING.to_string(),
                self.config.compression.as_str().as_bytes().to_vec(),
            );
        }

        if self.config.async_send {
            self.enqueue(Pending {
                record,
                reply: None,
            })
            .await?;
            return Ok(Ack::Enqueued);
        }

        let (reply, ack) = oneshot::channel();
        self.enqueue(Pending {
            record,
            reply: Some(reply),
        })
        .await?;
        ack.await.map_err(|_| PublishError::Closed)?
    }

    /// Wait for queue space unless the context is cancelled first.
    async fn enqueue(&self, pending: Pending) -> Result<(), PublishError> {
        let sent = tokio::select! {
            biased;
            _ = self.context.cancelled() => return Err(PublishError::Closed),
            sent = self.tx.send(pending) => sent,
        };
        sent.map_err(|_| PublishError::Closed)?;
        observability().record_enqueued();
        Ok(())
    }

    /// Flush the partial batch, wait up to the configured drain timeout and
    /// release the connection. Later calls return `Ok(())` without effect.
    pub async fn close(&self) -> Result<(), ShutdownError> {
        self.close_within(self.config.drain_timeout).await
    }

    /// Like [`PublishChannel::close`] with an explicit drain budget.
    pub async fn close_within(&self, budget: Duration) -> Result<(), ShutdownError> {
        self.closed.store(true, Ordering::Release);
        let Some(mut task) = self.task.lock().take() else {
            return Ok(());
        };
        self.drain.cancel();

        let result = match tokio::time::timeout(budget, &mut task).await {
            Ok(_) => Ok(()),
            Err(_) => {
                error!(channel = %self.name, after = ?budget, "publish channel did not drain in time");
                self.force.cancel();
                let _ = task.await;
                Err(ShutdownError::TimedOut {
                    component: self.name.clone(),
                    after: budget,
                })
            }
        };
        if let Err(e) = self.connection.close().await {
            warn!(channel = %self.name, error = %e, "closing connection failed");
        }
        debug!(channel = %self.name, "publish channel closed");
        result
    }
}

impl Drop for PublishChannel {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.drain.cancel();
    }
}

struct Flusher {
    name: String,
    config: Arc<ChannelConfig>,
    connection: Connection,
    rx: mpsc::Receiver<Pending>,
    drain: CancellationToken,
    force: CancellationToken,
    context: CancellationToken,
    done: CancellationToken,
}

struct Batch {
    pending: Vec<Pending>,
    bytes: usize,
    deadline: Option<Instant>,
}

impl Batch {
    fn new() -> Self {
        Self {
            pending: Vec::new(),
            bytes: 0,
            deadline: None,
        }
    }

    fn take(&mut self) -> Vec<Pending> {
        self.bytes = 0;
        self.deadline = None;
        std::mem::take(&mut self.pending)
    }
}

impl Flusher {
    async fn run(mut self) {
        let _done = self.done.clone().drop_guard();
        let mut batch = Batch::new();
        loop {
            tokio::select! {
                biased;
                _ = self.drain.cancelled() => break,
                next = self.rx.recv() => match next {
                    Some(pending) => self.push(&mut batch, pending).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(batch.deadline.unwrap_or_else(Instant::now)),
                    if batch.deadline.is_some() =>
                {
                    self.flush(batch.take()).await;
                }
            }
        }

        // Draining: refuse new records, flush whatever was accepted.
        self.rx.close();
        while let Ok(pending) = self.rx.try_recv() {
            self.push(&mut batch, pending).await;
        }
        if !batch.pending.is_empty() {
            self.flush(batch.take()).await;
        }
    }

    async fn push(&mut self, batch: &mut Batch, pending: Pending) {
        let len = pending.record.encoded_len();
        if !batch.pending.is_empty() && batch.bytes + len > self.config.batch_bytes {
            self.flush(batch.take()).await;
        }
        if batch.pending.is_empty() {
            batch.deadline = Some(Instant::now() + self.config.batch_linger);
        }
        batch.bytes += len;
        batch.pending.push(pending);
        if batch.pending.len() >= self.config.batch_size || batch.bytes >= self.config.batch_bytes {
            self.flush(batch.take()).await;
        }
    }

    async fn flush(&mut self, batch: Vec<Pending>) {
        if batch.is_empty() {
            return;
        }
        let (records, replies): (Vec<PublishRecord>, Vec<Option<Reply>>) =
            batch.into_iter().map(|p| (p.record, p.reply)).unzip();
        let started = Instant::now();

        match self.write_with_retry(&records).await {
            Ok((positions, attempts)) => {
                observability().record_flush(records.len(), started.elapsed());
                debug!(
                    channel = %self.name,
                    records = records.len(),
                    attempts,
                    "batch flushed"
                );
                for (i, reply) in replies.into_iter().enumerate() {
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(Ack::Written {
                            position: positions.get(i).copied(),
                            attempts,
                        }));
                    }
                }
            }
            Err(e) => {
                if replies.iter().all(Option::is_none) {
                    error!(channel = %self.name, records = records.len(), error = %e, "async batch dropped");
                }
                for reply in replies.into_iter().flatten() {
                    let _ = reply.send(Err(e.clone()));
                }
            }
        }
    }

    async fn write_with_retry(
        &self,
        records: &[PublishRecord],
    ) -> Result<(Vec<RecordPosition>, u32), PublishError> {
        if self.force.is_cancelled() {
            return Err(PublishError::Closed);
        }
        let mut backoff = Backoff::new(self.config.backoff_min, self.config.backoff_max);
        // Queue buses publish record by record; a retry resumes after the last confirmed one.
        let mut published = 0usize;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = tokio::select! {
                biased;
                _ = self.force.cancelled() => return Err(PublishError::Closed),
                r = tokio::time::timeout(self.config.io_timeout, self.write(records, &mut published)) => {
                    r.unwrap_or(Err(BusError::Timeout(self.config.io_timeout)))
                }
            };
            let err = match result {
                Ok(positions) => return Ok((positions, attempt)),
                Err(e) => e,
            };
            if !err.is_transient() {
                error!(channel = %self.name, records = records.len(), error = %err, "batch rejected");
                return Err(match err {
                    BusError::Closed => PublishError::Closed,
                    other => PublishError::Rejected(other),
                });
            }
            if self.context.is_cancelled() {
                warn!(channel = %self.name, attempts = attempt, error = %err, "cancelled, batch not retried");
                return Err(PublishError::Transient(err));
            }
            if attempt >= self.config.max_attempts {
                observability().record_exhausted();
                error!(
                    channel = %self.name,
                    records = records.len(),
                    attempts = attempt,
                    error = %err,
                    "batch dropped after exhausting retries"
                );
                return Err(PublishError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }
            observability().record_retry();
            let delay = backoff.next_delay();
            warn!(
                channel = %self.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "batch write failed, retrying"
            );
            tokio::select! {
                _ = self.force.cancelled() => return Err(PublishError::Transient(err)),
                _ = self.context.cancelled() => {
                    warn!(channel = %self.name, attempts = attempt, error = %err, "cancelled during backoff");
                    return Err(PublishError::Transient(err));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn write(
        &self,
        records: &[PublishRecord],
        published: &mut usize,
    ) -> Result<Vec<RecordPosition>, BusError> {
        match &self.connection {
            Connection::Log(bus) => {
                bus.append(&self.config.topic, records, self.config.required_acks)
                    .await
            }
            Connection::Queue(bus) => {
                let confirm = self.config.required_acks != RequiredAcks::None;
                for record in &records[*published..] {
                    bus.publish(&self.config.topic, record, confirm).await?;
                    *published += 1;
                }
                Ok(Vec::new())
            }
        }
    }
}
