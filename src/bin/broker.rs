//! Relay broker binary: serves an in-memory log broker and queue broker over TCP.
//!
//! RELAY_BROKER_ADDR (default 0.0.0.0:9092), RELAY_BROKER_PARTITIONS (default 1),
//! RELAY_BROKER_SESSION_TIMEOUT_MS (default 30000).

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use weather_relay::lifecycle::termination_signal;
use weather_relay::server::{self, Brokers};
use weather_relay::{MemoryLog, MemoryLogConfig, MemoryQueue};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid value {:?} for {}", raw, key)),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("weather_relay=info".parse()?))
        .init();

    let config = MemoryLogConfig {
        num_partitions: env_or("RELAY_BROKER_PARTITIONS", 1)?,
        session_timeout: Duration::from_millis(env_or("RELAY_BROKER_SESSION_TIMEOUT_MS", 30_000)?),
        ..MemoryLogConfig::default()
    };
    let brokers = Brokers {
        log: MemoryLog::new(config),
        queue: MemoryQueue::new(),
    };
    let addr = std::env::var("RELAY_BROKER_ADDR").unwrap_or_else(|_| "0.0.0.0:9092".to_string());

    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        termination_signal().await;
        tracing::info!("termination signal received");
        stop.cancel();
    });

    server::run_server(brokers, &addr, shutdown).await?;
    Ok(())
}
