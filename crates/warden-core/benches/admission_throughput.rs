//! Throughput benchmark for the Admission Controller's hot path:
//! `preflightRun` -> `acquireSlot` -> `releaseSlot` -> `endRun`.


use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};

use warden_core::admission::AdmissionController;
use warden_core::config::AdmissionPolicy;
use warden_core::model::RunKind;
use warden_core::pressure::NullPressureProvider;

use bench_common::{emit_bench_artifacts, BenchBudget};

const BUDGETS: &[BenchBudget] = &[BenchBudget {
    name: "preflight_acquire_release_end",
    budget: "< 2ms per full lease cycle on a warm lock file",
}];

fn bench_lease_cycle(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let controller = AdmissionController::new(
        dir.path().join("state.json"),
        dir.path().join("state.lock"),
        dir.path().join("events.ndjson"),
        AdmissionPolicy::default(),
        Box::new(NullPressureProvider),
        1024 * 1024,
        5,
        Duration::from_secs(3600),
    );

    let mut counter: u64 = 0;
    c.bench_function("preflight_acquire_release_end", |b| {
        b.iter(|| {
            counter += 1;
            let run_id = format!("bench-run-{counter}");
            let run = controller
                .preflight_run(&run_id, RunKind::Subagent, 0, None)
                .expect("grant");
            let slot = controller
                .acquire_slot(&run.run_id, 0, "worker")
                .expect("slot grant");
            controller.release_slot(&slot);
            controller.end_run(&run);
        });
    });

    emit_bench_artifacts("admission_throughput", BUDGETS);
}

criterion_group!(benches, bench_lease_cycle);
criterion_main!(benches);
