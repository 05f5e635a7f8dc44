//! Benchmarks for instance scoring and pool admission using criterion.
//!
//! These benchmarks measure:
//! - Single weighted-sum score evaluation
//! - Ranking candidate sets of varying size (the hot path of `acquire`)
//! - Acquire/release round trips on an uncontended pool
//! - Admission under contention from concurrent workers

#![allow(missing_docs)]

use std::cmp::Ordering;
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use polyglot::{
    score_instance, DeviceMemory, InstanceId, InstanceKind, InstancePool, InstanceSnapshot,
    PoolConfig, ScoreWeights, WorkloadAffinity,
};
use polyglot_testkit::MockEngineFactory;
use tokio::runtime::Runtime;

/// Creates a tokio runtime for async benchmarks.
fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

/// Deterministic snapshot with per-index variation so scores differ.
fn make_snapshot(idx: u32) -> InstanceSnapshot {
    InstanceSnapshot {
        id: InstanceId(idx),
        kind: InstanceKind::Accelerator,
        device_index: idx,
        affinity: match idx % 3 {
            0 => WorkloadAffinity::Interactive,
            1 => WorkloadAffinity::Batch,
            _ => WorkloadAffinity::Any,
        },
        concurrency_limit: 4,
        in_flight: (idx % 5) as usize,
        avg_response_secs: if idx % 4 == 0 {
            None
        } else {
            Some(0.2 + f64::from(idx % 7) * 0.3)
        },
        total_tasks: u64::from(idx) * 3,
        successful_tasks: u64::from(idx) * 2,
        last_used_at: Utc::now(),
        memory: if idx % 2 == 0 {
            Some(DeviceMemory {
                total_bytes: 16 << 30,
                used_bytes: u64::from(idx % 8) << 30,
            })
        } else {
            None
        },
    }
}

/// Benchmark: Score one instance.
///
/// Measures the cost of a single weighted-sum evaluation.
fn bench_score_single(c: &mut Criterion) {
    let weights = ScoreWeights::default();
    let snapshot = make_snapshot(3);

    let mut group = c.benchmark_group("score_single");
    group.sample_size(100);

    group.bench_function("weighted_sum", |b| {
        b.iter(|| {
            black_box(score_instance(
                black_box(&snapshot),
                WorkloadAffinity::Interactive,
                black_box(1.5),
                &weights,
            ))
        });
    });

    group.finish();
}

/// Benchmark: Rank candidate sets.
///
/// Measures the score-and-sort loop `acquire` runs over the instances of
/// a kind, for candidate sets of varying size.
fn bench_rank_candidates(c: &mut Criterion) {
    let weights = ScoreWeights::default();
    let set_sizes = vec![4usize, 16, 64, 256];

    let mut group = c.benchmark_group("rank_candidates");
    group.sample_size(100);

    for set_size in &set_sizes {
        group.throughput(Throughput::Elements(*set_size as u64));
        group.bench_with_input(
            BenchmarkId::new("score_and_sort", set_size),
            set_size,
            |b, &size| {
                let snapshots: Vec<InstanceSnapshot> =
                    (0..size as u32).map(make_snapshot).collect();

                b.iter(|| {
                    let max_avg = snapshots
                        .iter()
                        .filter_map(|snap| snap.avg_response_secs)
                        .fold(0.0_f64, f64::max);
                    let mut ranked: Vec<(usize, f64)> = snapshots
                        .iter()
                        .enumerate()
                        .map(|(idx, snap)| {
                            (
                                idx,
                                score_instance(
                                    snap,
                                    WorkloadAffinity::Interactive,
                                    max_avg,
                                    &weights,
                                ),
                            )
                        })
                        .collect();
                    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
                    black_box(ranked)
                });
            },
        );
    }

    group.finish();
}

/// Benchmark: Acquire/release round trip.
///
/// Measures one admission cycle on an uncontended pool, including the
/// outcome bookkeeping on release.
fn bench_acquire_release(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("acquire_release");
    group.sample_size(100);
    group.measurement_time(std::time::Duration::from_secs(10));
    group.throughput(Throughput::Elements(1));

    group.bench_function("uncontended", |b| {
        let factory = MockEngineFactory::new();
        let pool = rt.block_on(async {
            Arc::new(
                InstancePool::initialize(
                    PoolConfig::default()
                        .with_cpu_instances(4)
                        .with_cpu_concurrency(8),
                    &factory,
                )
                .await
                .expect("pool init"),
            )
        });

        b.to_async(&rt).iter(|| {
            let pool = Arc::clone(&pool);
            async move {
                let permit = pool
                    .acquire(InstanceKind::Cpu, WorkloadAffinity::Any)
                    .await
                    .expect("acquire should succeed");
                pool.release(permit, true, Duration::from_millis(3)).await;
            }
        });
    });

    group.finish();
}

/// Benchmark: Admission under contention.
///
/// Spawns concurrent workers that each run one acquire/release cycle
/// against a pool with fewer slots than workers.
fn bench_acquire_contention(c: &mut Criterion) {
    let rt = create_runtime();
    let worker_counts = vec![2usize, 8, 16];

    let mut group = c.benchmark_group("acquire_contention");
    group.sample_size(50);
    group.measurement_time(std::time::Duration::from_secs(15));

    for worker_count in &worker_counts {
        group.throughput(Throughput::Elements(*worker_count as u64));
        group.bench_with_input(
            BenchmarkId::new("workers", worker_count),
            worker_count,
            |b, &workers| {
                let factory = MockEngineFactory::new();
                let pool = rt.block_on(async {
                    Arc::new(
                        InstancePool::initialize(
                            PoolConfig::default()
                                .with_cpu_instances(2)
                                .with_cpu_concurrency(2),
                            &factory,
                        )
                        .await
                        .expect("pool init"),
                    )
                });

                b.to_async(&rt).iter(|| {
                    let pool = Arc::clone(&pool);
                    async move {
                        let mut handles = Vec::with_capacity(workers);
                        for _ in 0..workers {
                            let pool = Arc::clone(&pool);
                            handles.push(tokio::spawn(async move {
                                let permit = pool
                                    .acquire(InstanceKind::Cpu, WorkloadAffinity::Any)
                                    .await
                                    .expect("acquire should succeed");
                                pool.release(permit, true, Duration::from_millis(1)).await;
                            }));
                        }
                        for handle in handles {
                            let _ = handle.await;
                        }
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_score_single,
    bench_rank_candidates,
    bench_acquire_release,
    bench_acquire_contention
);
criterion_main!(benches);
