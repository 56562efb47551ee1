//! Engine benchmarks: import normalization, machine feed, simulation
//!
//! Run with: cargo bench --bench engine_benchmarks

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pvrsd_bench::adapter::{normalize, RawRow};
use pvrsd_bench::machine::{DeviceParams, TestMachine};
use pvrsd_bench::sample::Sample;
use pvrsd_bench::simulation::{compare, simulate, CircuitModel};
use pvrsd_bench::standard::defaults;
use serde_json::json;

const SIZES: [usize; 2] = [1_000, 100_000];

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default()
}

fn raw_rows(n: usize) -> Vec<RawRow> {
    (0..n)
        .map(|i| {
            serde_json::from_value(json!({
                "Timestamp": 1_700_000_000 + i,
                "Current (A)": 0.5,
                "Voltage (V)": 600.0 + (i % 7) as f64,
                "Temperature": 25.0,
            }))
            .unwrap()
        })
        .collect()
}

/// Steady 3 mA at 2200 V, 100 ms apart.
fn hold_trace(n: usize) -> Vec<Sample> {
    (0..n)
        .map(|i| Sample::new(t0() + Duration::milliseconds(100 * i as i64), 0.003, 2200.0))
        .collect()
}

/// Benchmark adapter normalization of JSON-shaped rows
fn bench_normalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalize");
    for size in SIZES {
        let rows = raw_rows(size);
        group.bench_with_input(BenchmarkId::new("rows", size), &rows, |b, rows| {
            b.iter(|| normalize(black_box(rows), 0.05).unwrap());
        });
    }
    group.finish();
}

/// Benchmark dielectric machine feed
fn bench_machine_feed(c: &mut Criterion) {
    let mut group = c.benchmark_group("machine_feed");
    let standard = Arc::new(defaults::dielectric());
    for size in SIZES {
        let trace = hold_trace(size);
        group.bench_with_input(BenchmarkId::new("dielectric", size), &trace, |b, trace| {
            b.iter(|| {
                let mut machine = TestMachine::init(
                    Arc::clone(&standard),
                    DeviceParams::new(600.0, 10.0),
                    Duration::milliseconds(50),
                )
                .unwrap();
                machine.confirm(t0()).unwrap();
                for sample in black_box(trace) {
                    if machine.is_terminal() {
                        break;
                    }
                    machine.feed(sample).unwrap();
                }
                machine.finalize()
            });
        });
    }
    group.finish();
}

/// Benchmark synthetic trace generation and comparison
fn bench_simulation(c: &mut Criterion) {
    let mut group = c.benchmark_group("simulation");
    let model = CircuitModel::default().with_noise(0.01, 7);
    for duration in [60.0, 600.0] {
        group.bench_with_input(
            BenchmarkId::new("simulate", duration),
            &duration,
            |b, &duration| {
                b.iter(|| simulate(black_box(&model), t0(), duration, &[]).unwrap());
            },
        );

        let synthetic = simulate(&model, t0(), duration, &[]).unwrap();
        let reference = simulate(&model.clone().with_noise(0.02, 11), t0(), duration, &[]).unwrap();
        group.bench_with_input(
            BenchmarkId::new("compare", duration),
            &(synthetic, reference),
            |b, (synthetic, reference)| {
                b.iter(|| compare(black_box(synthetic), black_box(reference)).unwrap());
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_normalize, bench_machine_feed, bench_simulation);
criterion_main!(benches);
