//! RelayBridge: fan one event out to every configured destination.

use crate::bus::{Connection, MemoryLog, MemoryQueue, RemoteBus};
use crate::codec::EventCodec;
use crate::config::{BusKind, RelayConfig};
use crate::error::{PublishError, Result, ShutdownError};
use crate::observability::observability;
use crate::publish::PublishChannel;
use crate::types::{Ack, WeatherEvent};
use chrono::Utc;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What happened at one destination.
#[derive(Debug, Clone)]
pub struct DestinationOutcome {
    pub destination: String,
    pub result: std::result::Result<Ack, PublishError>,
}

/// Per-destination outcomes of one `forward`, in destination order.
#[derive(Debug, Clone)]
pub struct ForwardReport {
    pub outcomes: Vec<DestinationOutcome>,
}

impl ForwardReport {
    pub fn is_complete(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &PublishError)> {
        self.outcomes.iter().filter_map(|o| match &o.result {
            Ok(_) => None,
            Err(e) => Some((o.destination.as_str(), e)),
        })
    }

    pub fn outcome(&self, destination: &str) -> Option<&DestinationOutcome> {
        self.outcomes.iter().find(|o| o.destination == destination)
    }

    /// `Ok` when every destination succeeded, else one error per failed destination.
    pub fn into_result(self) -> std::result::Result<(), Vec<(String, PublishError)>> {
        let failed: Vec<(String, PublishError)> = self
            .outcomes
            .into_iter()
            .filter_map(|o| o.result.err().map(|e| (o.destination, e)))
            .collect();
        if failed.is_empty() {
            Ok(())
        } else {
            Err(failed)
        }
    }
}

/// Forwards events to one or more publish channels. No cross-destination
/// atomicity: each destination succeeds or fails on its own.
pub struct RelayBridge {
    destinations: Vec<Arc<PublishChannel>>,
    context: Option<CancellationToken>,
    closed: AtomicBool,
}

impl RelayBridge {
    pub fn new(destinations: Vec<Arc<PublishChannel>>) -> Self {
        Self {
            destinations,
            context: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Build one remote publish channel per configured destination.
    pub fn connect(config: &RelayConfig) -> Result<Self> {
        let mut destinations = Vec::with_capacity(config.destinations.len());
        for d in &config.destinations {
            let bus = Arc::new(RemoteBus::new(d.channel.brokers.clone(), d.channel.io_timeout));
            let connection = match d.bus {
                BusKind::Log => Connection::Log(bus),
                BusKind::Queue => Connection::Queue(bus),
            };
            destinations.push(Arc::new(PublishChannel::new(
                d.name.clone(),
                d.channel.clone(),
                connection,
            )?));
        }
        Ok(Self::new(destinations))
    }

    /// Build channels against in-process brokers, one exclusive client each.
    pub fn in_memory(config: &RelayConfig, log: &Arc<MemoryLog>, queue: &Arc<MemoryQueue>) -> Result<Self> {
        let mut destinations = Vec::with_capacity(config.destinations.len());
        for d in &config.destinations {
            let connection = match d.bus {
                BusKind::Log => Connection::Log(Arc::new(log.connect())),
                BusKind::Queue => Connection::Queue(Arc::new(queue.connect())),
            };
            destinations.push(Arc::new(PublishChannel::new(
                d.name.clone(),
                d.channel.clone(),
                connection,
            )?));
        }
        Ok(Self::new(destinations))
    }

    /// Refuse new events once `context` is cancelled. Destinations stop
    /// retrying their in-flight batches at the same moment.
    pub fn with_context(mut self, context: CancellationToken) -> Self {
        for channel in &self.destinations {
            channel.link_context(context.clone());
        }
        self.context = Some(context);
        self
    }

    pub fn destinations(&self) -> &[Arc<PublishChannel>] {
        &self.destinations
    }

    fn accepting(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
            && !self.context.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Encode `event` once and send it to every destination concurrently.
    pub async fn forward(&self, event: &WeatherEvent) -> ForwardReport {
        let record = EventCodec::record(event, Utc::now());
        let accepting = self.accepting();
        let sends = self.destinations.iter().map(|channel| {
            let record = record.clone();
            async move {
                let result = if accepting {
                    channel.send(record).await
                } else {
                    Err(PublishError::Closed)
                };
                DestinationOutcome {
                    destination: channel.name().to_string(),
                    result,
                }
            }
        });
        let outcomes = join_all(sends).await;

        for outcome in &outcomes {
            match &outcome.result {
                Ok(ack) => info!(
                    destination = %outcome.destination,
                    country = event.country(),
                    ack = ?ack,
                    "event forwarded"
                ),
                Err(e) => {
                    observability().record_forward_failure();
                    warn!(
                        destination = %outcome.destination,
                        country = event.country(),
                        error = %e,
                        "forward failed"
                    );
                }
            }
        }
        ForwardReport { outcomes }
    }

    /// Stop accepting events and close every destination within `budget` overall.
    pub async fn close_within(&self, budget: Duration) -> std::result::Result<(), ShutdownError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let deadline = Instant::now() + budget;
        let closes = self.destinations.iter().map(|channel| {
            let remaining = deadline.saturating_duration_since(Instant::now());
            channel.close_within(remaining)
        });
        let mut first_err = None;
        for result in join_all(closes).await {
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn close(&self) -> std::result::Result<(), ShutdownError> {
        let budget = self
            .destinations
            .iter()
            .map(|d| d.config().drain_timeout)
            .max()
            .unwrap_or_default();
        self.close_within(budget).await
    }
}
