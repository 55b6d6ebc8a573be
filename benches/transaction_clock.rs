//! Benchmarks for transaction marker bookkeeping
//!
//! Run with: cargo bench --bench transaction_clock

use std::hint::black_box;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use aimwatch::TransactionClock;
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};

fn bench_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("TransactionClock");

    group.bench_function("send + acknowledge", |b| {
        let clock = TransactionClock::new();
        b.iter(|| {
            let stamp = clock.send_marker();
            black_box(clock.on_acknowledgment(stamp.id))
        });
    });

    group.bench_function("unknown acknowledgment", |b| {
        let clock = TransactionClock::new();
        for _ in 0..8 {
            let _ = clock.send_marker();
        }
        b.iter(|| black_box(clock.on_acknowledgment(black_box(1234))));
    });

    group.finish();
}

fn bench_deferred_effects(c: &mut Criterion) {
    let mut group = c.benchmark_group("TransactionClock deferred");

    for pending in [1usize, 8, 64] {
        group.bench_with_input(
            BenchmarkId::new("drain on acknowledgment", pending),
            &pending,
            |b, &pending| {
                let counter = Arc::new(AtomicUsize::new(0));
                b.iter_batched(
                    || {
                        let clock = TransactionClock::new();
                        for _ in 0..pending {
                            let counter = Arc::clone(&counter);
                            clock.defer_to_next_marker(Box::new(move || {
                                counter.fetch_add(1, Ordering::Relaxed);
                            }));
                        }
                        let stamp = clock.send_marker();
                        (clock, stamp)
                    },
                    |(clock, stamp)| black_box(clock.on_acknowledgment(stamp.id)),
                    BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_round_trip, bench_deferred_effects);
criterion_main!(benches);
