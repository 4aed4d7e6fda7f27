//! Operation executor benchmarks against the in-memory ensemble.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use keeper_bench::{background, connected_client, default_client, random_data, repetitive_data};
use keeper_client::{CreateMode, CreateOptions, KeeperError, Lz4CompressionProvider, Op, ANY_VERSION};
use keeper_testkit::fast_config;
use std::sync::Arc;

/// Benchmark reads of nodes of various sizes.
fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    let client = default_client();
    let ctx = background();

    for size in [64, 1024, 16 * 1024].iter() {
        let path = format!("/get/{size}");
        client.ensemble.put(&path, &random_data(*size));

        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &path, |b, path| {
            b.iter(|| {
                let result = client.get(&ctx, black_box(path)).unwrap();
                black_box(result);
            });
        });
    }
    group.finish();
}

/// Benchmark versionless writes.
fn bench_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("set");
    let client = default_client();
    let ctx = background();
    client.ensemble.put("/set", b"");

    for size in [64, 1024, 16 * 1024].iter() {
        let data = random_data(*size);
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| {
                client
                    .set(&ctx, "/set", black_box(data), ANY_VERSION)
                    .unwrap();
            });
        });
    }
    group.finish();
}

/// Benchmark writes through the LZ4 provider.
fn bench_set_compressed(c: &mut Criterion) {
    let mut group = c.benchmark_group("set_lz4");
    let client = keeper_testkit::TestClient::with_config(fast_config(), |b| {
        b.with_compression(Arc::new(Lz4CompressionProvider))
    });
    let ctx = background();
    client.ensemble.put("/set", b"");

    for size in [1024, 16 * 1024].iter() {
        let data = repetitive_data(*size);
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| {
                client
                    .set(&ctx, "/set", black_box(data), ANY_VERSION)
                    .unwrap();
            });
        });
    }
    group.finish();
}

/// Benchmark sequential creates, which grow the parent.
fn bench_create_sequential(c: &mut Criterion) {
    let client = default_client();
    let ctx = background();
    client.ensemble.put("/seq", b"");
    let options = CreateOptions::new().with_mode(CreateMode::PersistentSequential);

    c.bench_function("create_sequential", |b| {
        b.iter(|| {
            let path = client.create(&ctx, "/seq/n-", b"x", &options).unwrap();
            black_box(path);
        });
    });
}

/// Benchmark one retried attempt per call.
fn bench_retry_overhead(c: &mut Criterion) {
    let client = connected_client(fast_config());
    let ctx = background();

    c.bench_function("exists_with_one_retry", |b| {
        b.iter(|| {
            client.ensemble.fail_next(KeeperError::ConnectionLoss, 1);
            let stat = client.exists(&ctx, black_box("/")).unwrap();
            black_box(stat);
        });
    });
}

/// Benchmark atomic batches of sets.
fn bench_multi(c: &mut Criterion) {
    let mut group = c.benchmark_group("multi");
    let client = default_client();
    let ctx = background();

    for batch_size in [1, 10, 100].iter() {
        let paths: Vec<String> = (0..*batch_size).map(|i| format!("/multi/{batch_size}/{i}")).collect();
        for path in &paths {
            client.ensemble.put(path, b"");
        }

        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &paths, |b, paths| {
            b.iter(|| {
                let ops = paths
                    .iter()
                    .map(|p| Op::set_data(p.clone(), b"v".to_vec(), ANY_VERSION))
                    .collect();
                let results = client.multi(&ctx, ops).unwrap();
                black_box(results);
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_get,
    bench_set,
    bench_set_compressed,
    bench_create_sequential,
    bench_retry_overhead,
    bench_multi,
);

criterion_main!(benches);
