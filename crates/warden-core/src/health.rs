//! Health Monitor (§4.3).
//!
//! Pure, per-Supervisor classifier: no IO, no clock access. Time and tool
//! identity are passed in by the caller on every `evaluate` tick, mirroring
//! the Supervisor's own polling cadence.

use serde::{Deserialize, Serialize};

use crate::config::HealthPolicy;

/// Tool-kind bucket used to pick an abort threshold (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    /// read, write, edit, grep, find, ls, web_search.
    Quick,
    /// bash, team_run, pipeline_run, subagent.
    Active,
    /// Anything else, or no tool currently active.
    Unknown,
}

impl ToolKind {
    #[must_use]
    pub fn classify(tool_name: &str) -> Self {
        match tool_name {
            "read" | "write" | "edit" | "grep" | "find" | "ls" | "web_search" => Self::Quick,
            "bash" | "team_run" | "pipeline_run" | "subagent" => Self::Active,
            _ => Self::Unknown,
        }
    }
}

/// Progress classification, monotone in `(noProgressMs, sameFingerprintPolls)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Healthy,
    Slow,
    Stalled,
    Wedged,
}

/// Per-Supervisor health state (§3 `HealthState`).
#[derive(Debug, Clone)]
pub struct HealthState {
    pub started_at_ms: u64,
    pub last_event_at_ms: u64,
    pub last_progress_at_ms: u64,
    pub last_fingerprint: Option<String>,
    pub fingerprint_stable_since_ms: u64,
    pub same_fingerprint_polls: u32,
    pub active_tool: Option<ToolKind>,
    pub classification: Classification,
    pub warning_count: u32,
    pub stall_episodes: u32,
    last_warning_at_ms: Option<u64>,
}

impl HealthState {
    #[must_use]
    pub fn new(started_at_ms: u64) -> Self {
        Self {
            started_at_ms,
            last_event_at_ms: started_at_ms,
            last_progress_at_ms: started_at_ms,
            last_fingerprint: None,
            fingerprint_stable_since_ms: started_at_ms,
            same_fingerprint_polls: 0,
            active_tool: None,
            classification: Classification::Healthy,
            warning_count: 0,
            stall_episodes: 0,
            last_warning_at_ms: None,
        }
    }

    /// Record a new stdout marker at `now_ms`. `fingerprint` is the opaque,
    /// caller-derived progress signature; a repeated fingerprint resets
    /// nothing, an absent one is treated as always-novel (can't detect
    /// staleness without one).
    pub fn on_marker(&mut self, now_ms: u64, tool: Option<ToolKind>, fingerprint: Option<&str>) {
        self.last_event_at_ms = now_ms;
        if let Some(tool) = tool {
            self.active_tool = Some(tool);
        }

        match fingerprint {
            Some(fp) if self.last_fingerprint.as_deref() == Some(fp) => {
                self.same_fingerprint_polls += 1;
            }
            Some(fp) => {
                self.last_fingerprint = Some(fp.to_string());
                self.fingerprint_stable_since_ms = now_ms;
                self.same_fingerprint_polls = 0;
                self.last_progress_at_ms = now_ms;
            }
            None => {
                self.last_progress_at_ms = now_ms;
                self.same_fingerprint_polls = 0;
            }
        }
    }

    fn abort_threshold_ms(&self, policy: &HealthPolicy) -> u64 {
        match self.active_tool {
            Some(ToolKind::Quick) => policy.abort_quick_tool_ms,
            Some(ToolKind::Active) => policy.abort_active_tool_ms,
            _ => policy.abort_no_progress_ms.max(policy.abort_active_tool_ms),
        }
    }

    /// Evaluate classification at `now_ms`. Returns `Some(reason)` only
    /// when the caller should abort the Supervisor; warnings are recorded
    /// internally and rate-limited by `warnCooldownMs`.
    pub fn evaluate(&mut self, now_ms: u64, policy: &HealthPolicy) -> Option<String> {
        let no_progress_ms = now_ms.saturating_sub(self.last_progress_at_ms);
        let abort_threshold = self.abort_threshold_ms(policy);
        let fingerprint_stable_ms = now_ms.saturating_sub(self.fingerprint_stable_since_ms);

        self.classification = if no_progress_ms < policy.warn_no_progress_ms {
            Classification::Healthy
        } else if no_progress_ms < abort_threshold {
            Classification::Slow
        } else if self.same_fingerprint_polls >= 3 || fingerprint_stable_ms >= abort_threshold {
            Classification::Wedged
        } else {
            Classification::Stalled
        };

        if self.classification == Classification::Slow {
            let should_warn = self
                .last_warning_at_ms
                .is_none_or(|last| now_ms.saturating_sub(last) >= policy.warn_cooldown_ms);
            if should_warn {
                self.warning_count += 1;
                self.last_warning_at_ms = Some(now_ms);
            }
        }

        let should_abort = matches!(self.classification, Classification::Stalled | Classification::Wedged)
            && !policy.aborts_disabled;

        if should_abort {
            self.stall_episodes += 1;
            Some(format!(
                "{:?} after {no_progress_ms}ms without progress (tool={:?})",
                self.classification, self.active_tool
            ))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> HealthPolicy {
        HealthPolicy {
            warn_no_progress_ms: 30_000,
            abort_no_progress_ms: 900_000,
            abort_quick_tool_ms: 90_000,
            abort_active_tool_ms: 1_800_000,
            warn_cooldown_ms: 60_000,
            aborts_disabled: false,
        }
    }

    #[test]
    fn quick_tool_stall_aborts_after_95s() {
        let mut state = HealthState::new(0);
        state.on_marker(0, Some(ToolKind::Quick), Some("fp1"));
        let reason = state.evaluate(95_000, &policy());
        assert!(reason.is_some());
        assert!(matches!(
            state.classification,
            Classification::Stalled | Classification::Wedged
        ));
    }

    #[test]
    fn healthy_when_progress_is_recent() {
        let mut state = HealthState::new(0);
        state.on_marker(0, Some(ToolKind::Quick), Some("fp1"));
        assert!(state.evaluate(5_000, &policy()).is_none());
        assert_eq!(state.classification, Classification::Healthy);
    }

    #[test]
    fn repeated_fingerprint_promotes_stalled_to_wedged() {
        let mut state = HealthState::new(0);
        state.on_marker(0, Some(ToolKind::Quick), Some("fp1"));
        state.on_marker(10_000, Some(ToolKind::Quick), Some("fp1"));
        state.on_marker(20_000, Some(ToolKind::Quick), Some("fp1"));
        state.on_marker(30_000, Some(ToolKind::Quick), Some("fp1"));
        let reason = state.evaluate(95_000, &policy());
        assert!(reason.is_some());
        assert_eq!(state.classification, Classification::Wedged);
    }

    #[test]
    fn aborts_disabled_suppresses_abort_verdict() {
        let mut policy = policy();
        policy.aborts_disabled = true;
        let mut state = HealthState::new(0);
        state.on_marker(0, Some(ToolKind::Quick), Some("fp1"));
        assert!(state.evaluate(95_000, &policy).is_none());
    }

    #[test]
    fn warnings_are_rate_limited_by_cooldown() {
        let mut state = HealthState::new(0);
        state.on_marker(0, Some(ToolKind::Active), Some("fp1"));
        state.evaluate(40_000, &policy());
        assert_eq!(state.warning_count, 1);
        state.evaluate(41_000, &policy());
        assert_eq!(state.warning_count, 1, "cooldown should suppress a second warning");
        state.evaluate(101_000, &policy());
        assert_eq!(state.warning_count, 2);
    }
}
