use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use weather_relay::compression::Compression;
use weather_relay::{
    ChannelConfig, CommitStrategy, ConsumeChannel, Connection, EventCodec, LogBus, MemoryLog,
    MemoryLogConfig, PublishChannel, RequiredAcks, StartOffset, WeatherEvent,
};

fn event() -> WeatherEvent {
    WeatherEvent::new("PE", "rain", "light rain over the coast")
}

fn bench_publish(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("publish");
    for batch_size in [1usize, 16, 128] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &batch_size| {
                let broker = MemoryLog::new(MemoryLogConfig::default());
                let channel = rt.block_on(async {
                    PublishChannel::new(
                        "bench",
                        ChannelConfig {
                            topic: "bench".into(),
                            batch_size,
                            batch_linger: Duration::from_millis(5),
                            compression: Compression::None,
                            ..ChannelConfig::default()
                        },
                        Connection::Log(Arc::new(broker.connect())),
                    )
                })
                .unwrap();
                let channel = &channel;

                // one full batch per iteration
                b.to_async(&rt).iter(|| async move {
                    let sends = (0..batch_size)
                        .map(|_| channel.send(EventCodec::record(&event(), chrono::Utc::now())));
                    for ack in join_all(sends).await {
                        ack.unwrap();
                    }
                });
            },
        );
    }
    group.finish();
}

fn bench_compression(c: &mut Criterion) {
    let mut group = c.benchmark_group("compress");
    let payload = EventCodec::encode(&event()).repeat(32);
    group.throughput(Throughput::Bytes(payload.len() as u64));
    for compression in [Compression::Gzip, Compression::Lz4] {
        group.bench_with_input(
            BenchmarkId::from_parameter(compression),
            &compression,
            |b, compression| {
                b.iter(|| compression.compress(&payload).unwrap());
            },
        );
    }
    group.finish();
}

fn bench_consume(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("consume");
    let records = 500usize;
    group.throughput(Throughput::Elements(records as u64));
    group.bench_function(BenchmarkId::from_parameter(records), |b| {
        let broker = MemoryLog::new(MemoryLogConfig::default());
        let batch: Vec<_> = (0..records)
            .map(|_| EventCodec::record(&event(), chrono::Utc::now()))
            .collect();
        rt.block_on(broker.connect().append("bench", &batch, RequiredAcks::All))
            .unwrap();

        // a fresh group per iteration reads the topic from the start
        let mut round = 0u64;
        b.to_async(&rt).iter(|| {
            round += 1;
            let channel = ConsumeChannel::new(
                "bench",
                ChannelConfig {
                    topic: "bench".into(),
                    group_id: format!("bench-{}", round),
                    start_offset: StartOffset::Earliest,
                    commit_strategy: CommitStrategy::Interval,
                    ..ChannelConfig::default()
                },
                Connection::Log(Arc::new(broker.connect())),
            )
            .unwrap();
            async move {
                let ctx = CancellationToken::new();
                for _ in 0..records {
                    let record = channel.receive(&ctx).await.unwrap();
                    channel.commit(&record).await.unwrap();
                }
                channel.close().await.unwrap();
            }
        });
    });
    group.finish();
}

criterion_group!(benches, bench_publish, bench_compression, bench_consume);
criterion_main!(benches);
