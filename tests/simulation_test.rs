//! Simulation engine: synthetic traces against recorded ones

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use pvrsd_bench::clock::ManualClock;
use pvrsd_bench::experiment::MemoryStore;
use pvrsd_bench::machine::DeviceParams;
use pvrsd_bench::orchestrator::{Device, Orchestrator};
use pvrsd_bench::sample::Channel;
use pvrsd_bench::simulation::{compare, downsample, simulate, CircuitModel, ScheduledFault};
use pvrsd_bench::standard::{defaults, TestType};
use pvrsd_bench::Error;

fn t0() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn model() -> CircuitModel {
    CircuitModel::for_device(&DeviceParams::new(600.0, 8.0)).with_noise(0.02, 42)
}

#[test]
fn test_compare_trace_with_itself_is_zero() {
    let trace = simulate(&model(), t0(), 30.0, &[ScheduledFault::short(20.0)]).unwrap();
    let cmp = compare(&trace, &trace).unwrap();
    assert_eq!(cmp.excluded_points, 0);
    assert_eq!(cmp.metrics.compared_points, trace.len());
    assert!(cmp.metrics.mean_abs_error.abs() < f64::EPSILON);
    assert!(cmp.metrics.max_abs_error.abs() < f64::EPSILON);
    assert!(cmp.metrics.time_offset_s.abs() < f64::EPSILON);
    for channel in Channel::ALL {
        let dev = cmp.metrics.per_channel[&channel];
        assert!(dev.mean_abs_error.abs() < f64::EPSILON);
        assert!(dev.max_abs_error.abs() < f64::EPSILON);
        assert!(dev.rmse.abs() < f64::EPSILON);
    }
}

#[test]
fn test_noisy_reference_has_bounded_deviation() {
    let clean = simulate(&model().with_noise(0.0, 0), t0(), 30.0, &[]).unwrap();
    let noisy = simulate(&model(), t0(), 30.0, &[]).unwrap();
    let cmp = compare(&clean, &noisy).unwrap();
    let voltage = cmp.metrics.per_channel[&Channel::Voltage];
    assert!(voltage.mean_abs_error > 0.0);
    // 2 % amplitude on a ~580 V output
    assert!(voltage.max_abs_error < 0.03 * 600.0);
    assert!(voltage.relative_error_pct.unwrap() < 2.0);
}

#[test]
fn test_reference_beyond_synthetic_span_is_excluded() {
    let synthetic = simulate(&model(), t0(), 10.0, &[]).unwrap();
    let reference = simulate(&model(), t0(), 20.0, &[]).unwrap();
    let cmp = compare(&synthetic, &reference).unwrap();
    assert_eq!(cmp.metrics.compared_points, synthetic.len());
    assert_eq!(cmp.excluded_points, reference.len() - synthetic.len());
}

#[test]
fn test_downsample_bounds_persisted_trace() {
    let trace = simulate(&model(), t0(), 120.0, &[]).unwrap();
    assert_eq!(trace.len(), 1201);
    let reduced = downsample(&trace, 500);
    assert_eq!(reduced.len(), 500);
    assert_eq!(reduced.first(), trace.first());
    assert_eq!(reduced.last(), trace.last());
}

#[tokio::test]
async fn test_simulate_against_attaches_summary() {
    let clock = Arc::new(ManualClock::new(t0()));
    let store = Arc::new(MemoryStore::with_standards(defaults::builtin()));
    let bench = Orchestrator::builder(Arc::clone(&store))
        .clock(clock)
        .build()
        .await
        .unwrap();
    let device = Device::new("rsd-3", DeviceParams::new(600.0, 8.0));
    let id = bench
        .start(TestType::Normal, &device, defaults::NORMAL)
        .await
        .unwrap();

    let recorded = simulate(&model(), t0() + Duration::seconds(5), 20.0, &[]).unwrap();
    bench.ingest(&id, &recorded).await.unwrap();

    let run = bench
        .simulate_against(&id, model(), 20.0, Vec::new(), None, None)
        .await
        .unwrap();
    let cmp = run.comparison.unwrap();
    assert_eq!(cmp.excluded_points, 0);
    assert!(cmp.metrics.mean_abs_error.abs() < 1e-9);

    let summaries = store.simulations(&id);
    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].metrics.is_some());
    assert_eq!(summaries[0].synthetic.len(), 201);
}

#[tokio::test]
async fn test_simulate_against_empty_range_is_rejected() {
    let store = Arc::new(MemoryStore::with_standards(defaults::builtin()));
    let bench = Orchestrator::builder(store).build().await.unwrap();
    let device = Device::new("rsd-4", DeviceParams::new(600.0, 8.0));
    let id = bench
        .start(TestType::Dielectric, &device, defaults::DIELECTRIC)
        .await
        .unwrap();
    let err = bench
        .simulate_against(&id, model(), 5.0, Vec::new(), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}
