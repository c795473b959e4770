//! Benchmarks for the cache hot paths
//!
//! Target: sub-microsecond local hits and ring lookups

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use risk_cache::cache::entry::CacheEntry;
use risk_cache::cache::shard::{HashRing, DEFAULT_REPLICAS};
use risk_cache::cache::{BoundedStore, Codec, CodecConfig, TierConfig};
use risk_cache::{
    CacheKey, Coordinator, EngineConfig, LocalNode, MemoryStore, RiskCache, SharedBackingStore,
};
use std::sync::Arc;
use std::time::Duration;

fn bench_bounded_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("bounded_store");
    group.throughput(Throughput::Elements(1));

    let store = BoundedStore::new(TierConfig::with_max_entries(10_000));
    for i in 0..10_000 {
        store.insert(CacheEntry::new(
            format!("features:biz-{}", i),
            Bytes::from_static(b"0.42"),
            Duration::ZERO,
            false,
        ));
    }

    group.bench_function("get_hit", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let key = format!("features:biz-{}", counter % 10_000);
            black_box(store.get(black_box(&key)));
        });
    });

    // Store is full, so every insert of a new key evicts the LRU entry
    group.bench_function("insert_with_eviction", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let entry = CacheEntry::new(
                format!("session:u{}", counter),
                Bytes::from_static(b"token"),
                Duration::ZERO,
                false,
            );
            black_box(store.insert(entry));
        });
    });

    group.finish();
}

fn bench_ring_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_ring");
    group.throughput(Throughput::Elements(1));

    let ring = HashRing::with_nodes(DEFAULT_REPLICAS, (0..16).map(|i| format!("cache-{}", i)));
    group.bench_function("route_16_nodes", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let key = format!("score:biz-{}:v0", counter);
            black_box(ring.route(black_box(&key)));
        });
    });

    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let codec = Codec::new(CodecConfig::default());
    let payload: Vec<u8> = (0..16 * 1024).map(|i| (i % 31) as u8).collect();
    group.throughput(Throughput::Bytes(payload.len() as u64));

    group.bench_function("encode_16k", |b| {
        b.iter(|| black_box(codec.encode(black_box(&payload))));
    });

    let frame = codec.encode(&payload).frame;
    group.bench_function("decode_16k", |b| {
        b.iter(|| black_box(codec.decode(black_box(&frame))));
    });

    group.finish();
}

fn bench_engine_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine");
    group.throughput(Throughput::Elements(1));

    let rt = tokio::runtime::Runtime::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    for i in 0..1_000 {
        store.seed(format!("features:biz-{}", i), "0.42");
    }
    let engine = rt.block_on(async {
        let config = EngineConfig::default();
        let nodes = LocalNode::shared_from_config(&config.distributed);
        let engine = Coordinator::new(config, store as SharedBackingStore, nodes).unwrap();
        for i in 0..1_000 {
            engine
                .get(&CacheKey::new("features", format!("biz-{}", i)))
                .await
                .unwrap();
        }
        engine
    });

    group.bench_function("get_local_hit", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let key = CacheKey::new("features", format!("biz-{}", counter % 1_000));
            rt.block_on(async { black_box(engine.get(&key).await.unwrap()) });
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_bounded_store,
    bench_ring_routing,
    bench_codec,
    bench_engine_get
);
criterion_main!(benches);
