//! Benchmarks for sensitivity estimation and window encoding
//!
//! Run with: cargo bench --bench estimator

use std::hint::black_box;

use aimwatch::__internal::{encode_window, gcd, RunningMode};
use aimwatch::{EstimatorConfig, RotationSample, SensitivityEstimator, TickFeature};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

/// Deltas a player at a fixed sensitivity would produce.
fn quantized_deltas(count: usize) -> Vec<f32> {
    let step = 0.15f32;
    (0..count).map(|i| step * (1 + (i * 7) % 23) as f32).collect()
}

fn bench_gcd(c: &mut Criterion) {
    let mut group = c.benchmark_group("gcd");

    group.bench_function("quantized pair", |b| {
        b.iter(|| gcd(black_box(3.45), black_box(1.2)));
    });

    group.bench_function("noisy pair", |b| {
        b.iter(|| gcd(black_box(3.451_27), black_box(1.199_83)));
    });

    group.finish();
}

fn bench_running_mode(c: &mut Criterion) {
    let mut group = c.benchmark_group("RunningMode");

    for capacity in [20usize, 80, 320] {
        group.bench_with_input(
            BenchmarkId::new("add + update_mode", capacity),
            &capacity,
            |b, &capacity| {
                let mut mode = RunningMode::new(capacity);
                let values = quantized_deltas(capacity * 2);
                let mut index = 0;
                b.iter(|| {
                    mode.add(f64::from(values[index % values.len()]));
                    index += 1;
                    black_box(mode.update_mode())
                });
            },
        );
    }

    group.finish();
}

fn bench_estimator(c: &mut Criterion) {
    let mut group = c.benchmark_group("SensitivityEstimator");
    let deltas = quantized_deltas(512);

    group.bench_function("observe", |b| {
        let mut estimator = SensitivityEstimator::new(&EstimatorConfig::default());
        let mut index = 0;
        b.iter(|| {
            let delta = deltas[index % deltas.len()];
            index += 1;
            estimator.observe(black_box(RotationSample {
                delta_yaw: delta,
                delta_pitch: delta * 0.5,
            }));
        });
    });

    group.bench_function("readout", |b| {
        let mut estimator = SensitivityEstimator::new(&EstimatorConfig::default());
        for delta in &deltas {
            estimator.observe(RotationSample {
                delta_yaw: *delta,
                delta_pitch: *delta,
            });
        }
        b.iter(|| black_box(estimator.readout()));
    });

    group.finish();
}

fn bench_encode_window(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_window");

    for sequence in [20usize, 40, 160] {
        let ticks: Vec<TickFeature> = quantized_deltas(sequence)
            .into_iter()
            .map(|delta| TickFeature {
                delta_yaw: delta,
                delta_pitch: -delta,
                ..TickFeature::default()
            })
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(sequence), &ticks, |b, ticks| {
            b.iter(|| encode_window(black_box(ticks)));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_gcd,
    bench_running_mode,
    bench_estimator,
    bench_encode_window
);
criterion_main!(benches);
