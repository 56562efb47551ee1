//! Orchestrator lifecycle and concurrency tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pvrsd_bench::clock::ManualClock;
use pvrsd_bench::evaluation::Verdict;
use pvrsd_bench::experiment::{
    Experiment, ExperimentId, ExperimentStatus, MeasurementStore, MemoryStore, NewExperiment,
    TerminalUpdate, TestResult,
};
use pvrsd_bench::machine::{DeviceParams, FixtureEvent, Phase};
use pvrsd_bench::orchestrator::{Device, Orchestrator, Outcome};
use pvrsd_bench::sample::Sample;
use pvrsd_bench::simulation::SimulationSummary;
use pvrsd_bench::standard::{defaults, Standard, TestType};
use pvrsd_bench::{Error, Result};
use serde_json::json;

const EXPERIMENTS: usize = 10;
const SAMPLES_PER_EXPERIMENT: i64 = 100;

fn t(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
}

async fn orchestrator<S: MeasurementStore>(store: Arc<S>) -> Orchestrator<S> {
    Orchestrator::builder(store)
        .clock(Arc::new(ManualClock::new(t(0))))
        .operator("ci")
        .build()
        .await
        .unwrap()
}

fn device(n: usize) -> Device {
    Device::new(format!("rsd-{n:02}"), DeviceParams::new(600.0, 10.0))
}

/// Dielectric trace: even experiments hold 60 s and pass, odd ones leak 7 mA at t=50.
fn trace(n: usize) -> Vec<Sample> {
    (1..=SAMPLES_PER_EXPERIMENT)
        .map(|s| {
            let failing = n % 2 == 1 && s == 50;
            match s {
                _ if failing => Sample::new(t(s), 0.007, 2200.0),
                1..=61 => Sample::new(t(s), 0.003, 2200.0),
                _ => Sample::new(t(s), 0.0, 5.0),
            }
        })
        .collect()
}

async fn start_all<S: MeasurementStore>(bench: &Orchestrator<S>) -> Vec<ExperimentId> {
    let mut ids = Vec::new();
    for n in 0..EXPERIMENTS {
        let id = bench
            .start(TestType::Dielectric, &device(n), defaults::DIELECTRIC)
            .await
            .unwrap();
        bench.confirm(&id, t(0)).await.unwrap();
        ids.push(id);
    }
    ids
}

fn decided(bench: &Orchestrator<MemoryStore>, id: &ExperimentId) -> Verdict {
    match bench.result(id).unwrap() {
        Outcome::Decided(v) => v,
        Outcome::Pending => panic!("{id} still pending"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_ingest_matches_sequential() {
    pvrsd_bench::logging::init("warn");
    // sequential baseline
    let baseline = orchestrator(Arc::new(MemoryStore::with_standards(defaults::builtin()))).await;
    let ids = start_all(&baseline).await;
    for (n, id) in ids.iter().enumerate() {
        for sample in trace(n) {
            baseline.ingest(id, &[sample]).await.unwrap();
        }
    }
    let expected: Vec<Verdict> = ids.iter().map(|id| decided(&baseline, id)).collect();

    // 1,000 single-sample ingests interleaved across 10 experiments
    let bench = Arc::new(
        orchestrator(Arc::new(MemoryStore::with_standards(defaults::builtin()))).await,
    );
    let ids = start_all(&bench).await;
    let mut tasks = Vec::new();
    for (n, id) in ids.iter().cloned().enumerate() {
        let bench = Arc::clone(&bench);
        tasks.push(tokio::spawn(async move {
            for sample in trace(n) {
                bench.ingest(&id, &[sample]).await.unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let actual: Vec<Verdict> = ids.iter().map(|id| decided(&bench, id)).collect();
    assert_eq!(actual, expected);
    assert_eq!(bench.live_count(), 0);
    for (n, verdict) in actual.iter().enumerate() {
        assert_eq!(verdict.pass, n % 2 == 0, "experiment {n}: {verdict}");
        if n % 2 == 1 {
            assert!(verdict.reasons[0].contains("during HOLDING"), "{verdict}");
        }
    }
    for id in &ids {
        let record = bench.experiment(id).await.unwrap();
        assert_eq!(record.status(), ExperimentStatus::Completed);
        assert_ne!(record.result(), TestResult::Pending);
    }
}

#[tokio::test]
async fn test_terminal_record_folds_phases_and_drops() {
    let store = Arc::new(MemoryStore::with_standards(defaults::builtin()));
    let bench = orchestrator(Arc::clone(&store)).await;
    let id = bench
        .start(TestType::Dielectric, &device(0), defaults::DIELECTRIC)
        .await
        .unwrap();
    bench.confirm(&id, t(0)).await.unwrap();
    let report = bench.ingest(&id, &trace(0)).await.unwrap();
    // DONE at t=62, the remaining 38 samples are dropped
    assert_eq!(report.accepted, 62);
    assert_eq!(report.dropped, 38);

    let record = bench.experiment(&id).await.unwrap();
    assert_eq!(record.result(), TestResult::Pass);
    assert_eq!(record.end_time(), Some(t(62)));
    assert!(record.notes().contains("RAMPING -> HOLDING -> RAMPING_DOWN"));
    assert!(record.notes().contains("dropped samples: 38"));
    assert_eq!(store.sample_count(&id), 62);
}

#[tokio::test]
async fn test_events_and_snapshot() {
    let bench = orchestrator(Arc::new(MemoryStore::with_standards(defaults::builtin()))).await;
    let id = bench
        .start(TestType::Normal, &device(1), defaults::NORMAL)
        .await
        .unwrap();
    bench.confirm(&id, t(0)).await.unwrap();
    for _ in 0..4 {
        bench
            .event(&id, t(1), FixtureEvent::CommunicationProbe { ok: true })
            .await
            .unwrap();
    }
    let snapshot = bench.snapshot(&id).unwrap();
    assert_eq!(snapshot.phase, Phase::FunctionalCheck);
    assert_eq!(snapshot.live_stats["communication_probes"], json!(4));

    bench.event(&id, t(2), FixtureEvent::ShutdownCommand).await.unwrap();
    assert_eq!(bench.snapshot(&id).unwrap().phase, Phase::ResponseTiming);
}

#[tokio::test]
async fn test_poll_all_decides_timed_out_holds() {
    let clock = Arc::new(ManualClock::new(t(0)));
    let bench = Orchestrator::builder(Arc::new(MemoryStore::with_standards(defaults::builtin())))
        .clock(clock.clone())
        .build()
        .await
        .unwrap();
    let id = bench
        .start(TestType::Dielectric, &device(0), defaults::DIELECTRIC)
        .await
        .unwrap();
    bench.confirm(&id, t(0)).await.unwrap();
    bench
        .ingest(&id, &[Sample::new(t(1), 0.002, 2200.0)])
        .await
        .unwrap();
    clock.set(t(61));
    assert_eq!(bench.poll_all().await.unwrap(), 0);
    assert_eq!(bench.snapshot(&id).unwrap().phase, Phase::RampingDown);
    bench
        .event(&id, t(70), FixtureEvent::StageComplete)
        .await
        .unwrap();
    assert!(matches!(bench.result(&id).unwrap(), Outcome::Decided(v) if v.pass));
}

#[tokio::test]
async fn test_standard_registry_from_store() {
    let custom = Standard::new("DW-CUSTOM", "custom", TestType::Dielectric)
        .with_parameter("test_voltage", 1000)
        .with_parameter("leakage_limit", 1.0);
    let bench = orchestrator(Arc::new(MemoryStore::with_standards(vec![custom]))).await;
    assert_eq!(bench.registry().len(), 1);
    let id = bench
        .start(TestType::Dielectric, &device(0), "DW-CUSTOM")
        .await
        .unwrap();
    bench.confirm(&id, t(0)).await.unwrap();
    bench
        .ingest(&id, &[Sample::new(t(1), 0.002, 1000.0)])
        .await
        .unwrap();
    let Outcome::Decided(verdict) = bench.result(&id).unwrap() else {
        panic!("2 mA exceeds the 1 mA limit");
    };
    assert!(!verdict.pass);
}

// ============================================================================
// Storage failures
// ============================================================================

/// Memory store whose sample writes fail once `broken` is set.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    broken: AtomicBool,
}

impl MeasurementStore for FlakyStore {
    async fn load_standards(&self) -> Result<Vec<Standard>> {
        Ok(defaults::builtin())
    }

    async fn create_experiment(&self, new: NewExperiment) -> Result<ExperimentId> {
        self.inner.create_experiment(new).await
    }

    async fn update_terminal(&self, id: &ExperimentId, update: TerminalUpdate) -> Result<()> {
        self.inner.update_terminal(id, update).await
    }

    async fn append_samples(&self, id: &ExperimentId, samples: &[Sample]) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::Storage("connection reset".into()));
        }
        self.inner.append_samples(id, samples).await
    }

    async fn sample_range(
        &self,
        id: &ExperimentId,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Sample>> {
        self.inner.sample_range(id, from, to).await
    }

    async fn get_experiment(&self, id: &ExperimentId) -> Result<Option<Experiment>> {
        self.inner.get_experiment(id).await
    }

    async fn attach_simulation(&self, id: &ExperimentId, summary: SimulationSummary) -> Result<()> {
        self.inner.attach_simulation(id, summary).await
    }
}

#[tokio::test]
async fn test_storage_error_propagates_unchanged() {
    let store = Arc::new(FlakyStore::default());
    let bench = orchestrator(Arc::clone(&store)).await;
    let id = bench
        .start(TestType::Dielectric, &device(0), defaults::DIELECTRIC)
        .await
        .unwrap();
    bench.confirm(&id, t(0)).await.unwrap();
    store.broken.store(true, Ordering::SeqCst);

    let err = bench
        .ingest(&id, &[Sample::new(t(1), 0.001, 500.0)])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Storage(ref msg) if msg == "connection reset"));
    // the machine still advanced; the experiment stays live
    assert_eq!(bench.result(&id).unwrap(), Outcome::Pending);

    store.broken.store(false, Ordering::SeqCst);
    bench
        .ingest(&id, &[Sample::new(t(2), 0.001, 600.0)])
        .await
        .unwrap();
    assert_eq!(store.inner.sample_count(&id), 1);
}

#[tokio::test]
async fn test_cancel_during_precheck() {
    let bench = orchestrator(Arc::new(MemoryStore::with_standards(defaults::builtin()))).await;
    let id = bench
        .start(TestType::Abnormal, &device(2), defaults::ABNORMAL)
        .await
        .unwrap();
    bench
        .ingest(&id, &[Sample::new(t(1), 1.0, 600.0)])
        .await
        .unwrap();
    assert!(bench.cancel(&id, "fixture fault").await.unwrap());
    let record = bench.experiment(&id).await.unwrap();
    assert_eq!(record.status(), ExperimentStatus::Cancelled);
    assert_eq!(record.result(), TestResult::Fail);
    assert!(record.notes().contains("fixture fault"));

    let late = bench.ingest(&id, &[Sample::new(t(2), 1.0, 600.0)]).await.unwrap();
    assert_eq!(late.dropped, 1);
    assert!(matches!(
        bench.event(&id, t(3), FixtureEvent::StageComplete).await,
        Ok(())
    ));
}
