use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use occukey_rs::{KeygenConfig, KeygenTuning, LockingKeyService};
use std::hint::black_box;

fn bench_service() -> LockingKeyService {
    let config = KeygenConfig {
        tuning: KeygenTuning {
            wait_before_retry_ms: 1,
            wait_skew_ms: 0,
            ..KeygenTuning::default()
        },
        ..KeygenConfig::default()
    };
    LockingKeyService::in_memory(&config)
}

fn bench_fresh_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("generate_key_fresh");
    group.throughput(Throughput::Elements(1));

    let service = bench_service();
    let mut next_id = 0u64;
    group.bench_function("single_unique", |b| {
        b.iter(|| {
            next_id += 1;
            let unique = format!("occ-{next_id}");
            black_box(service.generate_key([unique], "bench").unwrap())
        })
    });

    let service = bench_service();
    let mut next_id = 0u64;
    group.bench_function("triplet_plus_occurrence_id", |b| {
        b.iter(|| {
            next_id += 1;
            let triplet = format!("ic|cc|cat-{next_id}");
            let occurrence_id = format!("occ-{next_id}");
            black_box(
                service
                    .generate_key([triplet, occurrence_id], "bench")
                    .unwrap(),
            )
        })
    });
    group.finish();
}

fn bench_reuse_and_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("existing_key");
    group.throughput(Throughput::Elements(1));

    let service = bench_service();
    service.generate_key(["hot"], "bench").unwrap();

    group.bench_function("generate_key_reuse", |b| {
        b.iter(|| black_box(service.generate_key(["hot"], "bench").unwrap()))
    });
    group.bench_function("find_key", |b| {
        b.iter(|| black_box(service.find_key(["hot"], "bench").unwrap()))
    });
    group.finish();
}

fn bench_scope_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_keys_by_scope");
    for size in [100u64, 1_000] {
        let service = bench_service();
        for i in 0..size {
            service.generate_key([format!("occ-{i}")], "bench").unwrap();
        }
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| black_box(service.find_keys_by_scope("bench").unwrap()))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_fresh_allocation,
    bench_reuse_and_lookup,
    bench_scope_scan
);
criterion_main!(benches);
