//! Process-wide shutdown coordination.
//!
//! The controller owns the cancellation context handed to every blocking
//! channel call. The first termination signal, fatal report or explicit
//! request moves it from `Running` to `Draining`; registered components are
//! then drained in registration order against one shared deadline, and the
//! controller ends in `Stopped` whether or not every component made it.

use crate::consume::ConsumeChannel;
use crate::error::ShutdownError;
use crate::publish::PublishChannel;
use crate::relay::RelayBridge;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, OnceCell};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    Draining,
    Stopped,
}

/// Why the process is shutting down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// SIGINT, SIGTERM or another process-external cause.
    Terminated,
    /// A component reported a condition it cannot recover from.
    Fatal { component: String, error: String },
    /// `shutdown` was called directly.
    Requested,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Terminated => write!(f, "terminated by external signal"),
            StopReason::Fatal { component, error } => write!(f, "fatal error in {}: {}", component, error),
            StopReason::Requested => write!(f, "shutdown requested"),
        }
    }
}

/// Outcome of the single shutdown sequence.
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub reason: StopReason,
    /// Components that missed the drain deadline.
    pub errors: Vec<ShutdownError>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Something that finishes in-flight work and releases its connection.
#[async_trait]
pub trait Drain: Send + Sync {
    fn name(&self) -> &str;

    /// Stop taking new work, finish what is in flight within `budget`, then
    /// release resources. Resources are released even when the budget is missed.
    async fn drain(&self, budget: Duration) -> Result<(), ShutdownError>;
}

struct FatalEvent {
    component: String,
    error: String,
}

/// Handle channels use to report a fatal condition upward.
#[derive(Clone)]
pub struct FatalReporter {
    tx: mpsc::UnboundedSender<FatalEvent>,
}

impl FatalReporter {
    pub fn report(&self, component: &str, error: impl fmt::Display) {
        let error = error.to_string();
        error!(component, error = %error, "fatal error reported");
        let _ = self.tx.send(FatalEvent {
            component: component.to_string(),
            error,
        });
    }
}

pub struct LifecycleController {
    context: CancellationToken,
    state: watch::Sender<LifecycleState>,
    drain_timeout: Duration,
    components: Mutex<Vec<Arc<dyn Drain>>>,
    fatal_tx: mpsc::UnboundedSender<FatalEvent>,
    fatal_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<FatalEvent>>,
    report: OnceCell<ShutdownReport>,
}

impl LifecycleController {
    pub fn new(drain_timeout: Duration) -> Self {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(LifecycleState::Running);
        Self {
            context: CancellationToken::new(),
            state,
            drain_timeout,
            components: Mutex::new(Vec::new()),
            fatal_tx,
            fatal_rx: tokio::sync::Mutex::new(fatal_rx),
            report: OnceCell::new(),
        }
    }

    /// Cancellation context to pass to every blocking channel call.
    pub fn context(&self) -> CancellationToken {
        self.context.clone()
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Add a component to the teardown order.
    pub fn register(&self, component: Arc<dyn Drain>) {
        self.components.lock().push(component);
    }

    pub fn fatal_reporter(&self) -> FatalReporter {
        FatalReporter {
            tx: self.fatal_tx.clone(),
        }
    }

    /// Wait for a termination signal, a fatal report or cancellation of the
    /// context, then shut down.
    pub async fn run(&self) -> ShutdownReport {
        let reason = {
            let mut fatal_rx = self.fatal_rx.lock().await;
            tokio::select! {
                _ = termination_signal() => StopReason::Terminated,
                Some(event) = fatal_rx.recv() => StopReason::Fatal {
                    component: event.component,
                    error: event.error,
                },
                _ = self.context.cancelled() => StopReason::Requested,
            }
        };
        self.shutdown(reason).await
    }

    /// Run the shutdown sequence. Concurrent and repeated calls wait for, and
    /// return, the report of the first one.
    pub async fn shutdown(&self, reason: StopReason) -> ShutdownReport {
        self.report
            .get_or_init(|| self.drain_all(reason))
            .await
            .clone()
    }

    async fn drain_all(&self, reason: StopReason) -> ShutdownReport {
        self.state.send_replace(LifecycleState::Draining);
        info!(reason = %reason, timeout = ?self.drain_timeout, "drain started");
        self.context.cancel();

        let deadline = Instant::now() + self.drain_timeout;
        let components: Vec<Arc<dyn Drain>> = self.components.lock().clone();
        let mut errors = Vec::new();
        for component in components {
            let budget = deadline.saturating_duration_since(Instant::now());
            match component.drain(budget).await {
                Ok(()) => info!(component = component.name(), "drained"),
                Err(e) => {
                    error!(component = component.name(), error = %e, "drain timed out");
                    errors.push(e);
                }
            }
        }

        self.state.send_replace(LifecycleState::Stopped);
        if errors.is_empty() {
            info!("drain finished");
        } else {
            warn!(timed_out = errors.len(), "drain finished with timeouts");
        }
        ShutdownReport { reason, errors }
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {},
                    _ = tokio::signal::ctrl_c() => {},
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, waiting for ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[async_trait]
impl Drain for PublishChannel {
    fn name(&self) -> &str {
        PublishChannel::name(self)
    }

    async fn drain(&self, budget: Duration) -> Result<(), ShutdownError> {
        self.close_within(budget).await
    }
}

#[async_trait]
impl Drain for ConsumeChannel {
    fn name(&self) -> &str {
        ConsumeChannel::name(self)
    }

    async fn drain(&self, budget: Duration) -> Result<(), ShutdownError> {
        self.close_within(budget).await
    }
}

#[async_trait]
impl Drain for RelayBridge {
    fn name(&self) -> &str {
        "relay"
    }

    async fn drain(&self, budget: Duration) -> Result<(), ShutdownError> {
        self.close_within(budget).await
    }
}
