//! Admission Controller (§4.1).
//!
//! Grants and denies run/slot leases against the persisted
//! [`AdmissionState`], enforcing the run cap, slot cap, recursion-depth
//! cap, idempotency dedup, and the fail-closed circuit breaker. Denials
//! are first-class [`DenialCode`] values, never [`crate::Error`] — only
//! genuine I/O/state failures convert to [`DenialCode::StateError`].

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::config::AdmissionPolicy;
use crate::events::AdmissionEvent;
use crate::lock;
use crate::log_writer::BoundedLogWriter;
use crate::model::{
    AdmissionState, BreakerReason, Circuit, DenialCode, PressureSnapshot, PressureSeverity,
    RunKind, RunLease, SlotLease,
};
use crate::pressure::PressureProvider;

/// Grant/deny outcome. Denials are data, not errors — see module docs.
pub type AdmissionOutcome<T> = std::result::Result<T, DenialCode>;

/// Returned by a successful `preflightRun`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunGrant {
    pub run_id: String,
    pub lease_id: String,
    pub depth: u32,
    pub kind: RunKind,
}

/// Returned by a successful `acquireSlot`.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotGrant {
    pub slot_id: String,
    pub run_id: String,
    pub lease_id: String,
    pub depth: u32,
    pub agent: String,
}

/// Point-in-time admission snapshot for `getStatus`.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub active_runs: usize,
    pub active_slots: usize,
    pub gap: u64,
    pub circuit: Circuit,
    pub pressure: Option<PressureSnapshot>,
    pub last_activity_ms: u64,
}

pub struct AdmissionController {
    state_path: PathBuf,
    lock_path: PathBuf,
    policy: AdmissionPolicy,
    pressure: Box<dyn PressureProvider>,
    log: Mutex<BoundedLogWriter>,
    serialize: Mutex<()>,
}

impl AdmissionController {
    #[must_use]
    pub fn new(
        state_path: PathBuf,
        lock_path: PathBuf,
        event_log_path: PathBuf,
        policy: AdmissionPolicy,
        pressure: Box<dyn PressureProvider>,
        log_max_bytes: u64,
        log_max_backups: u32,
        log_check_interval: std::time::Duration,
    ) -> Self {
        Self {
            state_path,
            lock_path,
            policy,
            pressure,
            log: Mutex::new(BoundedLogWriter::new(
                event_log_path,
                log_max_bytes,
                log_max_backups,
                log_check_interval,
            )),
            serialize: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    pub fn preflight_run(
        &self,
        run_id: &str,
        kind: RunKind,
        depth: u32,
        idempotency_key: Option<&str>,
    ) -> AdmissionOutcome<RunGrant> {
        self.preflight_run_at(run_id, kind, depth, idempotency_key, now_epoch_ms())
    }

    pub fn preflight_run_at(
        &self,
        run_id: &str,
        kind: RunKind,
        depth: u32,
        idempotency_key: Option<&str>,
        now_ms: u64,
    ) -> AdmissionOutcome<RunGrant> {
        self.with_locked_state(now_ms, |state| {
            preflight_run_pure(
                state,
                &self.policy,
                self.pressure.sample(now_ms),
                now_ms,
                run_id,
                kind,
                depth,
                idempotency_key,
            )
        })
    }

    pub fn acquire_slot(&self, run_id: &str, depth: u32, agent: &str) -> AdmissionOutcome<SlotGrant> {
        self.acquire_slot_at(run_id, depth, agent, now_epoch_ms())
    }

    pub fn acquire_slot_at(
        &self,
        run_id: &str,
        depth: u32,
        agent: &str,
        now_ms: u64,
    ) -> AdmissionOutcome<SlotGrant> {
        self.with_locked_state(now_ms, |state| {
            acquire_slot_pure(state, &self.policy, now_ms, run_id, depth, agent)
        })
    }

    pub fn release_slot(&self, grant: &SlotGrant) {
        self.release_slot_at(grant, now_epoch_ms());
    }

    pub fn release_slot_at(&self, grant: &SlotGrant, now_ms: u64) {
        let _ = self.with_locked_state(now_ms, |state| -> (AdmissionOutcome<()>, Vec<AdmissionEvent>) {
            if let Some(existing) = state.active_slots.get(&grant.slot_id) {
                if existing.lease_id == grant.lease_id {
                    state.active_slots.remove(&grant.slot_id);
                }
            }
            (Ok(()), Vec::new())
        });
    }

    pub fn end_run(&self, grant: &RunGrant) {
        self.end_run_at(grant, now_epoch_ms());
    }

    pub fn end_run_at(&self, grant: &RunGrant, now_ms: u64) {
        let _ = self.with_locked_state(now_ms, |state| -> (AdmissionOutcome<()>, Vec<AdmissionEvent>) {
            if let Some(existing) = state.active_runs.get(&grant.run_id) {
                if existing.lease_id == grant.lease_id {
                    state.active_runs.remove(&grant.run_id);
                    state.idempotency.retain(|_, rid| rid != &grant.run_id);
                }
            }
            (Ok(()), Vec::new())
        });
    }

    pub fn record_tool_call(&self) {
        self.record_tool_call_at(now_epoch_ms());
    }

    pub fn record_tool_call_at(&self, now_ms: u64) {
        let _ = self.with_locked_state(now_ms, |state| -> (AdmissionOutcome<()>, Vec<AdmissionEvent>) {
            state.call_count += 1;
            state.last_call_ms = now_ms;
            (Ok(()), Vec::new())
        });
    }

    pub fn record_tool_result(&self) {
        self.record_tool_result_at(now_epoch_ms());
    }

    pub fn record_tool_result_at(&self, now_ms: u64) {
        let _ = self.with_locked_state(now_ms, |state| -> (AdmissionOutcome<()>, Vec<AdmissionEvent>) {
            state.result_count += 1;
            (Ok(()), Vec::new())
        });
    }

    pub fn get_status(&self) -> AdmissionOutcome<StatusSnapshot> {
        let now_ms = now_epoch_ms();
        self.with_locked_state(now_ms, |state| {
            let snapshot = StatusSnapshot {
                active_runs: state.active_runs.len(),
                active_slots: state.active_slots.len(),
                gap: state.gap(),
                circuit: state.circuit.clone(),
                pressure: self.pressure.sample(now_ms),
                last_activity_ms: state.last_activity_ms,
            };
            (Ok(snapshot), Vec::new())
        })
    }

    /// Acquire the cross-process lock, load state (sweeping expired
    /// leases), run `f`, persist the result, and append any events.
    fn with_locked_state<T>(
        &self,
        now_ms: u64,
        f: impl FnOnce(&mut AdmissionState) -> (AdmissionOutcome<T>, Vec<AdmissionEvent>),
    ) -> AdmissionOutcome<T> {
        let _in_process = self.serialize.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let guard = match lock::acquire(&self.lock_path, self.policy.lock_wait(), self.policy.lock_stale()) {
            Ok(guard) => guard,
            Err(_) => return Err(DenialCode::StateError),
        };

        let mut state = match self.load_state() {
            Ok(state) => state,
            Err(_) => {
                self.log_state_error(now_ms, "failed to read admission state");
                drop(guard);
                return Err(DenialCode::StateError);
            }
        };

        sweep_expired(&mut state, now_ms);
        state.last_activity_ms = now_ms;

        let (outcome, events) = f(&mut state);

        if self.save_state(&state).is_err() {
            self.log_state_error(now_ms, "failed to persist admission state");
            drop(guard);
            return Err(DenialCode::StateError);
        }

        drop(guard);

        if let Ok(mut log) = self.log.lock() {
            for event in events {
                log.append(&event);
            }
        }

        outcome
    }

    fn load_state(&self) -> std::io::Result<AdmissionState> {
        if !self.state_path.exists() {
            return Ok(AdmissionState::default());
        }
        let text = std::fs::read_to_string(&self.state_path)?;
        serde_json::from_str(&text).map_err(std::io::Error::other)
    }

    fn save_state(&self, state: &AdmissionState) -> std::io::Result<()> {
        if let Some(parent) = self.state_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.state_path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(state).map_err(std::io::Error::other)?;
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            std::io::Write::write_all(&mut file, json.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.state_path)
    }

    fn log_state_error(&self, now_ms: u64, detail: &str) {
        if let Ok(mut log) = self.log.lock() {
            log.append(&AdmissionEvent::StateError {
                ts: now_ms,
                detail: detail.to_string(),
            });
        }
    }
}

fn sweep_expired(state: &mut AdmissionState, now_ms: u64) {
    state.active_runs.retain(|_, lease| lease.expires_at_ms > now_ms);
    let valid_runs: HashSet<String> = state.active_runs.keys().cloned().collect();
    state
        .active_slots
        .retain(|_, slot| slot.expires_at_ms > now_ms && valid_runs.contains(&slot.run_id));
    state.idempotency.retain(|_, run_id| valid_runs.contains(run_id));
}

#[allow(clippy::too_many_arguments)]
fn preflight_run_pure(
    state: &mut AdmissionState,
    policy: &AdmissionPolicy,
    pressure: Option<PressureSnapshot>,
    now_ms: u64,
    run_id: &str,
    kind: RunKind,
    depth: u32,
    idempotency_key: Option<&str>,
) -> (AdmissionOutcome<RunGrant>, Vec<AdmissionEvent>) {
    if depth > policy.max_depth {
        return (
            Err(DenialCode::DepthExceeded),
            vec![AdmissionEvent::RunDenied {
                ts: now_ms,
                code: DenialCode::DepthExceeded,
                run_id: run_id.to_string(),
                depth,
            }],
        );
    }

    if let Some(key) = idempotency_key {
        if let Some(existing_run_id) = state.idempotency.get(key) {
            if let Some(existing) = state.active_runs.get(existing_run_id) {
                return (
                    Ok(RunGrant {
                        run_id: existing.run_id.clone(),
                        lease_id: existing.lease_id.clone(),
                        depth: existing.depth,
                        kind: existing.kind,
                    }),
                    Vec::new(),
                );
            }
        }
    }

    if let Some(denial) = evaluate_breaker(state, policy, pressure, now_ms) {
        return (
            Err(denial),
            vec![AdmissionEvent::RunDenied {
                ts: now_ms,
                code: denial,
                run_id: run_id.to_string(),
                depth,
            }],
        );
    }

    if state.active_runs.len() as u32 >= policy.max_runs {
        return (
            Err(DenialCode::RunCapReached),
            vec![AdmissionEvent::RunDenied {
                ts: now_ms,
                code: DenialCode::RunCapReached,
                run_id: run_id.to_string(),
                depth,
            }],
        );
    }

    let lease_id = mint_lease_id(run_id, now_ms);
    let lease = RunLease {
        run_id: run_id.to_string(),
        kind,
        depth,
        lease_id: lease_id.clone(),
        granted_at_ms: now_ms,
        expires_at_ms: now_ms + policy.run_lease_ttl_ms,
        idempotency_key: idempotency_key.map(str::to_string),
    };
    state.active_runs.insert(run_id.to_string(), lease);
    if let Some(key) = idempotency_key {
        state.idempotency.insert(key.to_string(), run_id.to_string());
    }

    let event = AdmissionEvent::RunAllowed {
        ts: now_ms,
        run_id: run_id.to_string(),
        lease_id: lease_id.clone(),
        kind_of_run: kind,
        depth,
        idempotency_key: idempotency_key.map(str::to_string),
    };

    (
        Ok(RunGrant {
            run_id: run_id.to_string(),
            lease_id,
            depth,
            kind,
        }),
        vec![event],
    )
}

/// Breaker evaluation, in the spec's numbered precedence: reopen check,
/// then host pressure, then call/result gap.
fn evaluate_breaker(
    state: &mut AdmissionState,
    policy: &AdmissionPolicy,
    pressure: Option<PressureSnapshot>,
    now_ms: u64,
) -> Option<DenialCode> {
    if state.circuit.open {
        if now_ms.saturating_sub(state.circuit.opened_at_ms) < state.circuit.cooldown_ms {
            return Some(match state.circuit.reason {
                Some(BreakerReason::HostPressure) => DenialCode::CircuitOpenHostPressure,
                Some(BreakerReason::CallResultGap) => DenialCode::CircuitOpenCallResultGap,
                None => DenialCode::CircuitOpen,
            });
        }
        state.circuit.open = false;
        state.circuit.reason = None;
    }

    if let Some(snapshot) = pressure {
        if snapshot.severity == PressureSeverity::Critical {
            state.circuit = Circuit {
                open: true,
                reason: Some(BreakerReason::HostPressure),
                opened_at_ms: now_ms,
                cooldown_ms: policy.breaker_cooldown_ms,
            };
            return Some(DenialCode::CircuitOpenHostPressure);
        }
    }

    if now_ms.saturating_sub(state.last_call_ms) >= policy.gap_reset_quiet_ms {
        state.call_count = state.result_count;
    }
    let gap = state.gap();
    if gap > policy.call_result_gap_max {
        state.circuit = Circuit {
            open: true,
            reason: Some(BreakerReason::CallResultGap),
            opened_at_ms: now_ms,
            cooldown_ms: policy.breaker_cooldown_ms,
        };
        return Some(DenialCode::CircuitOpenCallResultGap);
    }

    None
}

fn acquire_slot_pure(
    state: &mut AdmissionState,
    policy: &AdmissionPolicy,
    now_ms: u64,
    run_id: &str,
    depth: u32,
    agent: &str,
) -> (AdmissionOutcome<SlotGrant>, Vec<AdmissionEvent>) {
    if !state.active_runs.contains_key(run_id) {
        return (
            Err(DenialCode::RunNotFound),
            vec![AdmissionEvent::SlotDenied {
                ts: now_ms,
                run_id: run_id.to_string(),
                code: DenialCode::RunNotFound,
            }],
        );
    }

    if state.active_slots.len() as u32 >= policy.max_slots {
        return (
            Err(DenialCode::SlotCapReached),
            vec![AdmissionEvent::SlotDenied {
                ts: now_ms,
                run_id: run_id.to_string(),
                code: DenialCode::SlotCapReached,
            }],
        );
    }

    let slot_id = mint_lease_id(&format!("{run_id}:{agent}"), now_ms);
    let lease_id = mint_lease_id(&format!("slot:{slot_id}"), now_ms);
    let lease = SlotLease {
        slot_id: slot_id.clone(),
        run_id: run_id.to_string(),
        depth,
        agent: agent.to_string(),
        lease_id: lease_id.clone(),
        granted_at_ms: now_ms,
        expires_at_ms: now_ms + policy.slot_lease_ttl_ms,
    };
    state.active_slots.insert(slot_id.clone(), lease);

    (
        Ok(SlotGrant {
            slot_id: slot_id.clone(),
            run_id: run_id.to_string(),
            lease_id,
            depth,
            agent: agent.to_string(),
        }),
        vec![AdmissionEvent::SlotAllowed {
            ts: now_ms,
            run_id: run_id.to_string(),
            slot_id,
        }],
    )
}

fn mint_lease_id(seed: &str, now_ms: u64) -> String {
    let nonce: u64 = rand::random();
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(now_ms.to_le_bytes());
    hasher.update(nonce.to_le_bytes());
    hex::encode(hasher.finalize())[..24].to_string()
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pressure::{FixedPressureProvider, NullPressureProvider};
    use std::time::Duration;

    fn controller(policy: AdmissionPolicy, pressure: Box<dyn PressureProvider>) -> (tempfile::TempDir, AdmissionController) {
        let dir = tempfile::tempdir().unwrap();
        let ctrl = AdmissionController::new(
            dir.path().join("state.json"),
            dir.path().join("state.lock"),
            dir.path().join("events.ndjson"),
            policy,
            pressure,
            1024 * 1024,
            5,
            Duration::from_millis(0),
        );
        (dir, ctrl)
    }

    #[test]
    fn cap_enforcement_denies_second_run_and_slot() {
        let policy = AdmissionPolicy {
            max_runs: 1,
            max_slots: 1,
            ..AdmissionPolicy::default()
        };
        let (_dir, ctrl) = controller(policy, Box::new(NullPressureProvider));

        let grant_a = ctrl.preflight_run_at("A", RunKind::Team, 0, None, 0).unwrap();
        let deny_b = ctrl.preflight_run_at("B", RunKind::Team, 0, None, 0).unwrap_err();
        assert_eq!(deny_b, DenialCode::RunCapReached);

        let slot = ctrl.acquire_slot_at(&grant_a.run_id, 0, "worker", 0).unwrap();
        let deny_slot = ctrl.acquire_slot_at(&grant_a.run_id, 0, "worker", 0).unwrap_err();
        assert_eq!(deny_slot, DenialCode::SlotCapReached);
        let _ = slot;
    }

    #[test]
    fn idempotency_dedup_returns_same_lease() {
        let (_dir, ctrl) = controller(AdmissionPolicy::default(), Box::new(NullPressureProvider));
        let first = ctrl
            .preflight_run_at("A", RunKind::Team, 0, Some("team:core:goal"), 0)
            .unwrap();
        let second = ctrl
            .preflight_run_at("B-ignored", RunKind::Team, 0, Some("team:core:goal"), 1)
            .unwrap();
        assert_eq!(first.run_id, second.run_id);
        assert_eq!(first.lease_id, second.lease_id);
        let status = ctrl.get_status().unwrap();
        assert_eq!(status.active_runs, 1);
    }

    #[test]
    fn host_pressure_opens_breaker_and_clears_after_cooldown() {
        let policy = AdmissionPolicy {
            breaker_cooldown_ms: 1_000,
            ..AdmissionPolicy::default()
        };
        let critical = FixedPressureProvider {
            severity: PressureSeverity::Critical,
            node_count: 1,
            node_rss_mb: 9000,
            total_processes: 1,
        };
        let (_dir, ctrl) = controller(policy, Box::new(critical));

        let deny = ctrl.preflight_run_at("A", RunKind::Team, 0, None, 0).unwrap_err();
        assert_eq!(deny, DenialCode::CircuitOpenHostPressure);
    }

    #[test]
    fn gap_breaker_self_recovers_after_cooldown_and_quiet_window() {
        let policy = AdmissionPolicy {
            call_result_gap_max: 1,
            breaker_cooldown_ms: 1_000,
            gap_reset_quiet_ms: 2_000,
            ..AdmissionPolicy::default()
        };
        let (_dir, ctrl) = controller(policy, Box::new(NullPressureProvider));

        ctrl.record_tool_call_at(0);
        ctrl.record_tool_call_at(0);
        let deny = ctrl.preflight_run_at("A", RunKind::Team, 0, None, 0).unwrap_err();
        assert_eq!(deny, DenialCode::CircuitOpenCallResultGap);

        let ok = ctrl.preflight_run_at("A", RunKind::Team, 0, None, 3_500).unwrap();
        assert_eq!(ok.run_id, "A");
    }

    #[test]
    fn depth_exceeded_is_denied_before_breaker() {
        let policy = AdmissionPolicy {
            max_depth: 1,
            ..AdmissionPolicy::default()
        };
        let (_dir, ctrl) = controller(policy, Box::new(NullPressureProvider));
        let deny = ctrl.preflight_run_at("A", RunKind::Subagent, 2, None, 0).unwrap_err();
        assert_eq!(deny, DenialCode::DepthExceeded);
    }

    #[test]
    fn gap_boundary_at_exactly_max_is_allowed() {
        let policy = AdmissionPolicy {
            call_result_gap_max: 2,
            ..AdmissionPolicy::default()
        };
        let (_dir, ctrl) = controller(policy, Box::new(NullPressureProvider));
        ctrl.record_tool_call_at(0);
        ctrl.record_tool_call_at(0);
        let ok = ctrl.preflight_run_at("A", RunKind::Team, 0, None, 0);
        assert!(ok.is_ok());
    }

    #[test]
    fn release_slot_is_idempotent() {
        let (_dir, ctrl) = controller(AdmissionPolicy::default(), Box::new(NullPressureProvider));
        let run = ctrl.preflight_run_at("A", RunKind::Team, 0, None, 0).unwrap();
        let slot = ctrl.acquire_slot_at(&run.run_id, 0, "worker", 0).unwrap();
        ctrl.release_slot_at(&slot, 0);
        ctrl.release_slot_at(&slot, 0);
        let status = ctrl.get_status().unwrap();
        assert_eq!(status.active_slots, 0);
    }

    #[test]
    fn end_run_decrements_active_runs_within_one_tick() {
        let (_dir, ctrl) = controller(AdmissionPolicy::default(), Box::new(NullPressureProvider));
        let run = ctrl.preflight_run_at("A", RunKind::Team, 0, None, 0).unwrap();
        ctrl.end_run_at(&run, 0);
        let status = ctrl.get_status().unwrap();
        assert_eq!(status.active_runs, 0);
    }

    #[test]
    fn ttl_sweep_reclaims_expired_run_and_orphaned_slot() {
        let policy = AdmissionPolicy {
            run_lease_ttl_ms: 100,
            slot_lease_ttl_ms: 100,
            ..AdmissionPolicy::default()
        };
        let (_dir, ctrl) = controller(policy, Box::new(NullPressureProvider));
        let run = ctrl.preflight_run_at("A", RunKind::Team, 0, None, 0).unwrap();
        let _slot = ctrl.acquire_slot_at(&run.run_id, 0, "worker", 0).unwrap();
        let status = ctrl.get_status_at_for_test(500);
        assert_eq!(status.active_runs, 0);
        assert_eq!(status.active_slots, 0);
    }

    impl AdmissionController {
        fn get_status_at_for_test(&self, now_ms: u64) -> StatusSnapshot {
            self.with_locked_state(now_ms, |state| {
                let snapshot = StatusSnapshot {
                    active_runs: state.active_runs.len(),
                    active_slots: state.active_slots.len(),
                    gap: state.gap(),
                    circuit: state.circuit.clone(),
                    pressure: None,
                    last_activity_ms: state.last_activity_ms,
                };
                (Ok(snapshot), Vec::new())
            })
            .unwrap()
        }
    }
}
