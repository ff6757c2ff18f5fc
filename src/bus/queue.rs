//! In-memory queue broker: FIFO queues with competing consumers and
//! per-connection delivery tags.

use super::{BusResult, Delivery, QueueBus};
use crate::error::BusError;
use crate::types::PublishRecord;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

struct Message {
    record: PublishRecord,
    redelivered: bool,
}

#[derive(Default)]
struct Queue {
    ready: Mutex<VecDeque<Message>>,
    notify: Notify,
}

/// Broker holding named queues. Queues are created on first use.
#[derive(Default)]
pub struct MemoryQueue {
    queues: DashMap<String, Arc<Queue>>,
    requests: AtomicU64,
}

impl MemoryQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open an exclusive client connection.
    pub fn connect(self: &Arc<Self>) -> MemoryQueueClient {
        MemoryQueueClient {
            broker: Arc::clone(self),
            closed: AtomicBool::new(false),
            next_tag: AtomicU64::new(1),
            unacked: Mutex::new(BTreeMap::new()),
        }
    }

    fn queue(&self, name: &str) -> Arc<Queue> {
        Arc::clone(&self.queues.entry(name.to_string()).or_default())
    }

    /// Messages waiting for delivery.
    pub fn depth(&self, queue: &str) -> usize {
        self.queue(queue).ready.lock().len()
    }

    /// Ready messages, oldest first, without consuming them.
    pub fn peek(&self, queue: &str) -> Vec<PublishRecord> {
        self.queue(queue)
            .ready
            .lock()
            .iter()
            .map(|m| m.record.clone())
            .collect()
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

/// One client connection to a [`MemoryQueue`].
///
/// Delivery tags are scoped to the connection and start at 1.
pub struct MemoryQueueClient {
    broker: Arc<MemoryQueue>,
    closed: AtomicBool,
    next_tag: AtomicU64,
    /// tag -> (queue, record) for deliveries awaiting ack.
    unacked: Mutex<BTreeMap<u64, (String, PublishRecord)>>,
}

impl MemoryQueueClient {
    fn begin(&self) -> BusResult<&MemoryQueue> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        self.broker.requests.fetch_add(1, Ordering::Relaxed);
        Ok(&self.broker)
    }

    /// Deliveries handed out on this connection and not yet acknowledged.
    pub fn unacked(&self) -> usize {
        self.unacked.lock().len()
    }

    fn take(&self, queue_name: &str, queue: &Queue, max: usize) -> BusResult<Vec<Delivery>> {
        let mut ready = queue.ready.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        let mut unacked = self.unacked.lock();
        let mut out = Vec::new();
        while out.len() < max {
            let Some(message) = ready.pop_front() else {
                break;
            };
            let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
            unacked.insert(tag, (queue_name.to_string(), message.record.clone()));
            out.push(Delivery {
                queue: queue_name.to_string(),
                delivery_tag: tag,
                redelivered: message.redelivered,
                record: message.record,
                session: 0,
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl QueueBus for MemoryQueueClient {
    async fn publish(&self, queue: &str, record: &PublishRecord, _confirm: bool) -> BusResult<()> {
        let q = self.begin()?.queue(queue);
        q.ready.lock().push_back(Message {
            record: record.clone(),
            redelivered: false,
        });
        q.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str, max: usize, wait: Duration) -> BusResult<Vec<Delivery>> {
        let q = self.begin()?.queue(queue);
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = q.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deliveries = self.take(queue, &q, max.max(1))?;
            if !deliveries.is_empty() {
                return Ok(deliveries);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    /// A client lives for one session, so `_session` is always current.
    async fn ack(&self, _session: u64, delivery_tag: u64, multiple: bool) -> BusResult<()> {
        self.begin()?;
        let mut unacked = self.unacked.lock();
        if multiple {
            let rest = unacked.split_off(&delivery_tag.saturating_add(1));
            *unacked = rest;
            Ok(())
        } else if unacked.remove(&delivery_tag).is_some() {
            Ok(())
        } else {
            Err(BusError::Rejected(format!(
                "unknown delivery tag {}",
                delivery_tag
            )))
        }
    }

    async fn close(&self) -> BusResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let pending = std::mem::take(&mut *self.unacked.lock());
        let mut by_queue: BTreeMap<String, Vec<PublishRecord>> = BTreeMap::new();
        for (_, (queue, record)) in pending {
            by_queue.entry(queue).or_default().push(record);
        }
        for (name, records) in by_queue {
            let q = self.broker.queue(&name);
            let mut ready = q.ready.lock();
            for record in records.into_iter().rev() {
                ready.push_front(Message {
                    record,
                    redelivered: true,
                });
            }
            drop(ready);
            q.notify.notify_waiters();
        }
        Ok(())
    }
}
