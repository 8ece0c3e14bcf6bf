//! Benchmark: in-memory live store upsert and rank lookup
//!
//! Run: cargo bench --bench bench_live_store

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use kaos_rank::{LiveScoreStore, MemoryLiveStore, PointMode};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;
use tokio::runtime::Runtime;

const BOARD_SIZES: [usize; 3] = [1_000, 10_000, 100_000];
const OPS: u64 = 1_000;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
}

fn seeded_board(rt: &Runtime, mode: PointMode, users: usize) -> MemoryLiveStore {
    let store = MemoryLiveStore::new();
    rt.block_on(async {
        store.open("bench", mode).await.unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        for i in 0..users {
            store
                .upsert("bench", &format!("user-{}", i), rng.gen_range(0..1_000_000))
                .await
                .unwrap();
        }
    });
    store
}

fn bench_upsert(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("upsert");
    group.throughput(Throughput::Elements(OPS));

    for mode in [PointMode::Cumulative, PointMode::Highest] {
        for size in BOARD_SIZES {
            let store = seeded_board(&rt, mode, size);
            let mut rng = StdRng::seed_from_u64(2);
            group.bench_with_input(BenchmarkId::new(mode.as_str(), size), &size, |b, &size| {
                b.iter(|| {
                    rt.block_on(async {
                        for _ in 0..OPS {
                            let user = format!("user-{}", rng.gen_range(0..size));
                            black_box(store.upsert("bench", &user, rng.gen_range(0..1_000)).await.unwrap());
                        }
                    })
                });
            });
        }
    }
    group.finish();
}

fn bench_rank_of(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("rank_of");
    group.throughput(Throughput::Elements(OPS));

    for size in BOARD_SIZES {
        let store = seeded_board(&rt, PointMode::Highest, size);
        let mut rng = StdRng::seed_from_u64(3);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                rt.block_on(async {
                    for _ in 0..OPS {
                        let user = format!("user-{}", rng.gen_range(0..size));
                        black_box(store.rank_of("bench", &user).await.unwrap());
                    }
                })
            });
        });
    }
    group.finish();
}

fn bench_top_n(c: &mut Criterion) {
    let rt = runtime();
    let store = seeded_board(&rt, PointMode::Highest, 100_000);
    c.bench_function("top_100_of_100k", |b| {
        b.iter(|| rt.block_on(async { black_box(store.top_n("bench", 100).await.unwrap()) }))
    });
}

criterion_group!(benches, bench_upsert, bench_rank_of, bench_top_n);
criterion_main!(benches);
