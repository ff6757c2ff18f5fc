//! Weather relay binary.
//!
//! `weather-relay produce` reads newline-delimited JSON weather events from
//! stdin and forwards each to every destination in RELAY_DESTINATIONS,
//! printing one outcome line per event.
//!
//! `weather-relay consume` reads events back from the source configured under
//! RELAY_CONSUMER_* (RELAY_CONSUMER_BUS selects `log` or `queue`) and logs them.

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use weather_relay::observability::observability;
use weather_relay::{
    BusKind, ChannelConfig, ConsumeChannel, Connection, EventCodec, LifecycleController,
    RelayBridge, RelayConfig, RemoteBus,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("weather_relay=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let mode = std::env::args().nth(1).unwrap_or_else(|| "produce".to_string());
    let clean = match mode.as_str() {
        "produce" => produce().await?,
        "consume" => consume().await?,
        other => anyhow::bail!("unknown mode {:?}, expected produce or consume", other),
    };
    info!("{}", observability().render_prometheus());
    if !clean {
        anyhow::bail!("shutdown did not complete within the drain timeout");
    }
    Ok(())
}

async fn produce() -> anyhow::Result<bool> {
    let config = RelayConfig::from_env()?;
    let controller = Arc::new(LifecycleController::new(config.drain_timeout));
    let bridge = Arc::new(RelayBridge::connect(&config)?.with_context(controller.context()));
    controller.register(bridge.clone());

    let ctx = controller.context();
    let edge = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                _ = ctx.cancelled() => break,
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "reading stdin failed");
                    break;
                }
            };
            let event = match EventCodec::decode(line.as_bytes()) {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "rejected input line");
                    continue;
                }
            };
            let report = bridge.forward(&event).await;
            let outcomes: serde_json::Map<String, serde_json::Value> = report
                .outcomes
                .iter()
                .map(|o| {
                    let value = match &o.result {
                        Ok(_) => serde_json::Value::String("ok".into()),
                        Err(e) => serde_json::Value::String(e.to_string()),
                    };
                    (o.destination.clone(), value)
                })
                .collect();
            println!("{}", serde_json::Value::Object(outcomes));
        }
        // End of input: request an orderly shutdown.
        ctx.cancel();
    });

    let report = controller.run().await;
    let _ = edge.await;
    info!(reason = %report.reason, "relay stopped");
    Ok(report.is_clean())
}

async fn consume() -> anyhow::Result<bool> {
    let config = ChannelConfig::from_env("RELAY_CONSUMER")?;
    let kind: BusKind = match std::env::var("RELAY_CONSUMER_BUS") {
        Ok(raw) => raw.parse().map_err(anyhow::Error::msg)?,
        Err(_) => BusKind::Log,
    };
    let bus = Arc::new(RemoteBus::new(config.brokers.clone(), config.io_timeout));
    let connection = match kind {
        BusKind::Log => Connection::Log(bus),
        BusKind::Queue => Connection::Queue(bus),
    };

    let controller = Arc::new(LifecycleController::new(config.drain_timeout));
    let channel = Arc::new(
        ConsumeChannel::new("consumer", config, connection)?
            .with_fatal_reporter(controller.fatal_reporter()),
    );
    controller.register(channel.clone());

    let ctx = controller.context();
    let reporter = controller.fatal_reporter();
    let worker = tokio::spawn(async move {
        let result = channel
            .run(&ctx, |event| async move {
                info!(
                    country = event.country(),
                    weather = event.weather(),
                    description = event.description(),
                    "event received"
                );
            })
            .await;
        if let Err(e) = result {
            reporter.report("consumer", e);
        }
    });

    let report = controller.run().await;
    let _ = worker.await;
    info!(reason = %report.reason, "consumer stopped");
    Ok(report.is_clean())
}
