use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use seurat::{
    Domain, DomainConfig, MessagingPattern, SegmentConfig, SegmentManager, TopicConfig, TypeDescriptor,
};
use std::time::Duration;
use tempfile::TempDir;

fn benchmark_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("SamplePool");
    let dir = TempDir::new().unwrap();
    let manager = SegmentManager::new(dir.path(), Duration::from_secs(1));

    let config = SegmentConfig {
        pattern: MessagingPattern::PublishSubscribe,
        type_descriptor: TypeDescriptor::bytes(),
        payload_size: 64,
        slot_count: 1024,
        max_publishers: 1,
        max_subscribers: 1,
        queue_capacity: 16,
        event_capacity: 0,
        persistent: false,
        checksum_payloads: false,
    };
    let handle = manager.open_or_create("bench", "pool", &config).unwrap();
    let pool = handle.pool();

    group.bench_function("acquire_discard", |b| {
        b.iter(|| {
            let slot = pool.acquire(0).unwrap();
            pool.discard(black_box(slot)).unwrap();
        });
    });

    group.bench_function("acquire_publish_release", |b| {
        b.iter(|| {
            let slot = pool.acquire(0).unwrap();
            pool.publish(slot).unwrap();
            pool.retain(slot).unwrap();
            pool.finish_send(slot).unwrap();
            black_box(pool.release(slot).unwrap());
        });
    });

    group.finish();
}

fn benchmark_pubsub(c: &mut Criterion) {
    let mut group = c.benchmark_group("PubSub");
    let dir = TempDir::new().unwrap();
    let domain = Domain::open(DomainConfig::new("bench").with_root_dir(dir.path())).unwrap();

    for size in [64usize, 1024, 16 * 1024].iter() {
        let config = TopicConfig::new(format!("payload-{}", size))
            .with_payload_size(*size)
            .with_pool_capacity(32);
        let subscriber = domain.subscriber(config.clone()).unwrap();
        let publisher = domain.publisher(config).unwrap();
        let payload = vec![0xa5u8; *size];

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::new("send_receive", size), size, |b, _| {
            b.iter(|| {
                publisher.send_copy(&payload).unwrap();
                let sample = subscriber.try_receive().unwrap().unwrap();
                black_box(sample.len());
            });
        });

        group.bench_with_input(BenchmarkId::new("loan_in_place", size), size, |b, &size| {
            b.iter(|| {
                let mut sample = publisher.loan().unwrap();
                sample.payload_mut()[0] = 1;
                sample.set_len(size).unwrap();
                sample.send().unwrap();
                drop(subscriber.try_receive().unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_pool, benchmark_pubsub);
criterion_main!(benches);
