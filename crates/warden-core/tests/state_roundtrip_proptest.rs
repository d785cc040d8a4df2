//! Property-based round-trip and idempotence laws (spec.md §8).

use std::time::Duration;

use proptest::prelude::*;
use warden_core::admission::AdmissionController;
use warden_core::config::AdmissionPolicy;
use warden_core::model::{AdmissionState, RunKind};
use warden_core::pressure::NullPressureProvider;

fn controller() -> (tempfile::TempDir, AdmissionController) {
    let dir = tempfile::tempdir().expect("tempdir");
    let ctrl = AdmissionController::new(
        dir.path().join("state.json"),
        dir.path().join("state.lock"),
        dir.path().join("events.ndjson"),
        AdmissionPolicy::default(),
        Box::new(NullPressureProvider),
        1024 * 1024,
        5,
        Duration::from_millis(0),
    );
    (dir, ctrl)
}

proptest! {
    /// `releaseSlot(releaseSlot(G)) == releaseSlot(G)` for any sequence of
    /// extra no-op releases after the first.
    #[test]
    fn release_slot_is_idempotent_under_repetition(extra_releases in 0usize..8) {
        let (_dir, ctrl) = controller();
        let run = ctrl.preflight_run_at("A", RunKind::Team, 0, None, 0).unwrap();
        let slot = ctrl.acquire_slot_at(&run.run_id, 0, "worker", 0).unwrap();

        for _ in 0..=extra_releases {
            ctrl.release_slot_at(&slot, 0);
        }

        let status = ctrl.get_status().unwrap();
        prop_assert_eq!(status.active_slots, 0);
    }

    /// `endRun(endRun(G)) == endRun(G)`.
    #[test]
    fn end_run_is_idempotent_under_repetition(extra_ends in 0usize..8) {
        let (_dir, ctrl) = controller();
        let run = ctrl.preflight_run_at("A", RunKind::Team, 0, None, 0).unwrap();

        for _ in 0..=extra_ends {
            ctrl.end_run_at(&run, 0);
        }

        let status = ctrl.get_status().unwrap();
        prop_assert_eq!(status.active_runs, 0);
    }

    /// `preflightRun(k) . preflightRun(k)` with the same live idempotency
    /// key behaves as a single call: the run count never grows past one.
    #[test]
    fn repeated_preflight_with_same_idempotency_key_never_grows_run_count(repeats in 1usize..6) {
        let (_dir, ctrl) = controller();
        let mut first_lease = None;
        for i in 0..repeats {
            let grant = ctrl
                .preflight_run_at(&format!("run-{i}"), RunKind::Team, 0, Some("shared-key"), 0)
                .unwrap();
            match &first_lease {
                None => first_lease = Some(grant.lease_id.clone()),
                Some(lease_id) => prop_assert_eq!(lease_id, &grant.lease_id),
            }
        }
        let status = ctrl.get_status().unwrap();
        prop_assert_eq!(status.active_runs, 1);
    }

    /// State file law: `write(read(S)) == S` for any reachable admission
    /// state — serializing a deserialized document reproduces it exactly.
    #[test]
    fn state_document_round_trips_through_json(
        call_count in 0u64..10_000,
        result_count in 0u64..10_000,
        last_activity_ms in 0u64..1_000_000_000,
    ) {
        let mut state = AdmissionState::default();
        state.call_count = call_count;
        state.result_count = result_count.min(call_count);
        state.last_activity_ms = last_activity_ms;

        let json = serde_json::to_string(&state).unwrap();
        let restored: AdmissionState = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(state.clone(), restored.clone());

        let json_again = serde_json::to_string(&restored).unwrap();
        prop_assert_eq!(json, json_again);
    }
}
