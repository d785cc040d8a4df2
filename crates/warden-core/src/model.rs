//! Core data model shared by the admission controller, supervisor, health
//! monitor and governor.
//!
//! Field names match the admission state file's external schema (§6):
//! `version`, `activeRuns`, `activeSlots`, `idempotency`, `callCount`,
//! `resultCount`, `circuit`, `lastActivityMs`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Current schema version of the persisted admission state document.
pub const STATE_VERSION: u32 = 1;

/// Kind of a delegated run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Team,
    Pipeline,
    Subagent,
}

/// A leased, active delegated run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLease {
    pub run_id: String,
    pub kind: RunKind,
    pub depth: u32,
    pub lease_id: String,
    pub granted_at_ms: u64,
    pub expires_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// A leased, active agent slot within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotLease {
    pub slot_id: String,
    pub run_id: String,
    pub depth: u32,
    pub agent: String,
    pub lease_id: String,
    pub granted_at_ms: u64,
    pub expires_at_ms: u64,
}

/// Reason the circuit breaker most recently opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerReason {
    HostPressure,
    CallResultGap,
}

/// Circuit breaker state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Circuit {
    pub open: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<BreakerReason>,
    pub opened_at_ms: u64,
    pub cooldown_ms: u64,
}

impl Default for Circuit {
    fn default() -> Self {
        Self {
            open: false,
            reason: None,
            opened_at_ms: 0,
            cooldown_ms: 0,
        }
    }
}

/// The full persisted admission state document — a single JSON file guarded
/// by an advisory lock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionState {
    pub version: u32,
    pub active_runs: HashMap<String, RunLease>,
    pub active_slots: HashMap<String, SlotLease>,
    pub idempotency: HashMap<String, String>,
    pub call_count: u64,
    pub result_count: u64,
    pub circuit: Circuit,
    pub last_activity_ms: u64,
    /// Epoch ms of the most recent `recordToolCall`. Not part of the
    /// externally documented schema; drives the call/result gap's
    /// quiet-window self-clear and defaults to 0 on older documents.
    #[serde(default)]
    pub last_call_ms: u64,
}

impl Default for AdmissionState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            active_runs: HashMap::new(),
            active_slots: HashMap::new(),
            idempotency: HashMap::new(),
            call_count: 0,
            result_count: 0,
            circuit: Circuit::default(),
            last_activity_ms: 0,
            last_call_ms: 0,
        }
    }
}

impl AdmissionState {
    /// `callCount - resultCount`, never negative by invariant.
    #[must_use]
    pub fn gap(&self) -> u64 {
        self.call_count.saturating_sub(self.result_count)
    }
}

/// Render an epoch-millisecond timestamp as RFC 3339 for operator-facing
/// output (`warden status`/`warden tail`). Falls back to the raw number if
/// the value is out of `chrono`'s representable range.
#[must_use]
pub fn format_epoch_ms(ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(ms as i64)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

/// Severity bucket reported by a pressure probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureSeverity {
    Ok,
    Warn,
    Critical,
}

/// A single sample from the host-pressure probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PressureSnapshot {
    pub ts: u64,
    pub severity: PressureSeverity,
    pub node_count: u32,
    pub node_rss_mb: u64,
    pub total_processes: u32,
}

/// Denial codes returned by the admission controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenialCode {
    DepthExceeded,
    RunCapReached,
    SlotCapReached,
    CircuitOpen,
    CircuitOpenHostPressure,
    CircuitOpenCallResultGap,
    RunNotFound,
    StateError,
}

impl std::fmt::Display for DenialCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DepthExceeded => "DEPTH_EXCEEDED",
            Self::RunCapReached => "RUN_CAP_REACHED",
            Self::SlotCapReached => "SLOT_CAP_REACHED",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::CircuitOpenHostPressure => "CIRCUIT_OPEN_HOST_PRESSURE",
            Self::CircuitOpenCallResultGap => "CIRCUIT_OPEN_CALL_RESULT_GAP",
            Self::RunNotFound => "RUN_NOT_FOUND",
            Self::StateError => "STATE_ERROR",
        };
        f.write_str(s)
    }
}
