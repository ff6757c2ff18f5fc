//! ConsumeChannel: delivery, commit strategies, cancellation, close and retries.

mod common;

use common::{broker, fast_config, pe_rain, raw, FaultyLog, GROUP, TOPIC};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use weather_relay::error::ConsumeErrorKind;
use weather_relay::{
    ChannelConfig, CommitStrategy, ConsumeChannel, Connection, EventCodec, LogBus, MemoryLog,
    MemoryQueue, QueueBus, RequiredAcks,
};

async fn produce(broker: &Arc<MemoryLog>, values: &[&str]) {
    let client = broker.connect();
    let records: Vec<_> = values.iter().map(|v| raw("k", v.as_bytes())).collect();
    client.append(TOPIC, &records, RequiredAcks::All).await.unwrap();
}

fn consumer(broker: &Arc<MemoryLog>, config: ChannelConfig) -> ConsumeChannel {
    ConsumeChannel::new("consumer", config, Connection::Log(Arc::new(broker.connect()))).unwrap()
}

#[tokio::test]
async fn per_record_commit_advances_group_offset() {
    let broker = broker(1);
    produce(&broker, &["a", "b", "c"]).await;
    let ch = consumer(&broker, fast_config());
    let ctx = CancellationToken::new();

    for expected in ["a", "b", "c"] {
        let record = ch.receive(&ctx).await.unwrap();
        assert_eq!(record.value, expected.as_bytes());
        ch.commit(&record).await.unwrap();
    }
    assert_eq!(broker.committed(GROUP, TOPIC, 0), Some(3));
    ch.close().await.unwrap();
}

#[tokio::test]
async fn interval_commit_stops_at_first_unprocessed_record() {
    let broker = broker(1);
    produce(&broker, &["0", "1", "2"]).await;
    let ch = consumer(
        &broker,
        ChannelConfig {
            commit_strategy: CommitStrategy::Interval,
            commit_interval: Duration::from_millis(20),
            ..fast_config()
        },
    );
    let ctx = CancellationToken::new();

    let r0 = ch.receive(&ctx).await.unwrap();
    let r1 = ch.receive(&ctx).await.unwrap();
    let r2 = ch.receive(&ctx).await.unwrap();
    ch.commit(&r0).await.unwrap();
    ch.commit(&r2).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(broker.committed(GROUP, TOPIC, 0), Some(1));

    ch.commit(&r1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(broker.committed(GROUP, TOPIC, 0), Some(3));
    ch.close().await.unwrap();
}

#[tokio::test]
async fn close_commits_pending_interval_positions() {
    let broker = broker(1);
    produce(&broker, &["0", "1"]).await;
    let ch = consumer(
        &broker,
        ChannelConfig {
            commit_strategy: CommitStrategy::Interval,
            commit_interval: Duration::from_secs(60),
            ..fast_config()
        },
    );
    let ctx = CancellationToken::new();
    let r0 = ch.receive(&ctx).await.unwrap();
    ch.commit(&r0).await.unwrap();
    assert_eq!(broker.committed(GROUP, TOPIC, 0), None);

    ch.close().await.unwrap();
    assert_eq!(broker.committed(GROUP, TOPIC, 0), Some(1));
}

#[tokio::test]
async fn cancelling_a_waiting_receive_returns_promptly() {
    let broker = broker(1);
    let ch = consumer(
        &broker,
        ChannelConfig {
            max_wait: Duration::from_secs(5),
            ..fast_config()
        },
    );
    let ctx = CancellationToken::new();
    ch.subscribe(&ctx).await.unwrap();

    let cancel = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });
    let started = Instant::now();
    let err = ch.receive(&ctx).await.unwrap_err();
    assert_eq!(err.kind(), ConsumeErrorKind::Cancelled);
    assert!(started.elapsed() < Duration::from_millis(500));

    // the channel is still usable with a fresh context
    produce(&broker, &["after"]).await;
    let record = ch.receive(&CancellationToken::new()).await.unwrap();
    assert_eq!(record.value, b"after");
}

#[tokio::test]
async fn cancellation_interrupts_backoff() {
    let broker = broker(1);
    let log = FaultyLog::new(Arc::new(broker.connect()));
    let ch = ConsumeChannel::new(
        "consumer",
        ChannelConfig {
            backoff_min: Duration::from_secs(10),
            backoff_max: Duration::from_secs(10),
            ..fast_config()
        },
        Connection::Log(log.clone()),
    )
    .unwrap();
    let ctx = CancellationToken::new();
    ch.subscribe(&ctx).await.unwrap();
    log.fail_polls(u32::MAX);

    let cancel = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });
    let started = Instant::now();
    let err = ch.receive(&ctx).await.unwrap_err();
    assert_eq!(err.kind(), ConsumeErrorKind::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn receive_after_close_is_closed_without_traffic() {
    let broker = broker(1);
    let ch = consumer(&broker, fast_config());
    let ctx = CancellationToken::new();
    ch.subscribe(&ctx).await.unwrap();
    ch.close().await.unwrap();

    let before = broker.requests();
    let err = ch.receive(&ctx).await.unwrap_err();
    assert_eq!(err.kind(), ConsumeErrorKind::Closed);
    assert_eq!(broker.requests(), before);
    ch.close().await.unwrap();
}

#[tokio::test]
async fn close_wakes_a_blocked_receive() {
    let broker = broker(1);
    let ch = Arc::new(consumer(
        &broker,
        ChannelConfig {
            max_wait: Duration::from_secs(5),
            ..fast_config()
        },
    ));
    let ctx = CancellationToken::new();
    ch.subscribe(&ctx).await.unwrap();

    let receiver = {
        let ch = Arc::clone(&ch);
        tokio::spawn(async move { ch.receive(&CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    ch.close().await.unwrap();
    let err = receiver.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ConsumeErrorKind::Closed);
}

#[tokio::test]
async fn transient_read_failures_are_retried_internally() {
    let broker = broker(1);
    produce(&broker, &["payload"]).await;
    let log = FaultyLog::new(Arc::new(broker.connect()));
    let ch = ConsumeChannel::new("consumer", fast_config(), Connection::Log(log.clone())).unwrap();
    let ctx = CancellationToken::new();
    ch.subscribe(&ctx).await.unwrap();
    log.fail_polls(3);

    let record = ch.receive(&ctx).await.unwrap();
    assert_eq!(record.value, b"payload");
    assert!(log.polls.load(Ordering::SeqCst) >= 4);
}

#[tokio::test]
async fn per_record_commit_retries_transient_failures() {
    let broker = broker(1);
    produce(&broker, &["x"]).await;
    let log = FaultyLog::new(Arc::new(broker.connect()));
    let ch = ConsumeChannel::new("consumer", fast_config(), Connection::Log(log.clone())).unwrap();
    let ctx = CancellationToken::new();
    let record = ch.receive(&ctx).await.unwrap();

    log.fail_commits(2);
    ch.commit(&record).await.unwrap();
    assert_eq!(log.commits.load(Ordering::SeqCst), 3);
    assert_eq!(broker.committed(GROUP, TOPIC, 0), Some(1));

    // attempts are bounded
    produce(&broker, &["y"]).await;
    let record = ch.receive(&ctx).await.unwrap();
    log.fail_commits(u32::MAX);
    let err = ch.commit(&record).await.unwrap_err();
    assert_eq!(err.kind(), ConsumeErrorKind::Transient);
}

#[tokio::test]
async fn restart_resumes_after_committed_position() {
    let broker = broker(1);
    produce(&broker, &["0", "1", "2"]).await;
    let ctx = CancellationToken::new();

    let first = consumer(&broker, fast_config());
    for _ in 0..2 {
        let record = first.receive(&ctx).await.unwrap();
        first.commit(&record).await.unwrap();
    }
    first.close().await.unwrap();

    let second = consumer(&broker, fast_config());
    let record = second.receive(&ctx).await.unwrap();
    assert_eq!(record.position, 2);
    assert_eq!(record.value, b"2");
}

#[tokio::test]
async fn uncommitted_records_are_redelivered() {
    let broker = broker(1);
    produce(&broker, &["0", "1"]).await;
    let ctx = CancellationToken::new();

    let first = consumer(&broker, fast_config());
    first.receive(&ctx).await.unwrap();
    first.receive(&ctx).await.unwrap();
    first.close().await.unwrap();

    let second = consumer(&broker, fast_config());
    let record = second.receive(&ctx).await.unwrap();
    assert_eq!(record.position, 0);
}

#[tokio::test]
async fn run_skips_and_commits_malformed_payloads() {
    let broker = broker(1);
    let client = broker.connect();
    let good = EventCodec::record(&pe_rain(), chrono::Utc::now());
    client
        .append(TOPIC, &[raw("k", b"{not json"), good], RequiredAcks::All)
        .await
        .unwrap();

    let ch = consumer(&broker, fast_config());
    let ctx = CancellationToken::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let result = {
        let seen = Arc::clone(&seen);
        let stop = ctx.clone();
        ch.run(&ctx, move |event| {
            let seen = Arc::clone(&seen);
            let stop = stop.clone();
            async move {
                seen.lock().push(event);
                stop.cancel();
            }
        })
        .await
    };
    result.unwrap();

    assert_eq!(*seen.lock(), vec![pe_rain()]);
    assert_eq!(broker.committed(GROUP, TOPIC, 0), Some(2));
}

#[tokio::test]
async fn queue_source_acks_processed_deliveries() {
    let queue = MemoryQueue::new();
    let producer = queue.connect();
    for v in ["a", "b"] {
        producer.publish("weather_queue", &raw("", v.as_bytes()), true).await.unwrap();
    }

    let config = ChannelConfig {
        topic: "weather_queue".into(),
        ..fast_config()
    };
    let ch = ConsumeChannel::new("queue", config, Connection::Queue(Arc::new(queue.connect()))).unwrap();
    let ctx = CancellationToken::new();
    let first = ch.receive(&ctx).await.unwrap();
    ch.commit(&first).await.unwrap();
    let second = ch.receive(&ctx).await.unwrap();
    assert_eq!(second.value, b"b");
    // second is left unacknowledged and must come back after close
    ch.close().await.unwrap();

    let again = queue.connect();
    let redelivered = again
        .consume("weather_queue", 10, Duration::from_millis(20))
        .await
        .unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].record.value, b"b");
    assert!(redelivered[0].redelivered);
}
