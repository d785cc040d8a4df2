//! Recovery Coordinator (§4.5).
//!
//! Pure decision function over a Supervisor [`Outcome`] and a
//! [`RecoveryPolicy`]: retry with backoff, fail, or complete (optionally
//! degraded). An optional quorum mode tracks votes across retries by a
//! normalized output fingerprint.

use std::collections::HashMap;

use crate::supervisor::{AbortOrigin, Outcome};

/// Reason the coordinator attributes to a non-success outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    Signal,
    Budget,
    Policy,
    Health,
    Stall,
    LockContention,
    ExitCode,
    Unknown,
}

impl FailureReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Signal => "signal",
            Self::Budget => "budget",
            Self::Policy => "policy",
            Self::Health => "health",
            Self::Stall => "stall",
            Self::LockContention => "lock_contention",
            Self::ExitCode => "exit_code",
            Self::Unknown => "unknown",
        }
    }
}

/// Classify an [`Outcome`] into a [`FailureReason`] per §4.5.
#[must_use]
pub fn classify(outcome: &Outcome) -> FailureReason {
    match outcome.abort_origin {
        Some(AbortOrigin::Signal) => return FailureReason::Signal,
        Some(AbortOrigin::Budget) => return FailureReason::Budget,
        Some(AbortOrigin::Policy) => return FailureReason::Policy,
        Some(AbortOrigin::Health) => return FailureReason::Health,
        _ => {}
    }
    if outcome.health_classification_stalled_or_wedged {
        return FailureReason::Stall;
    }
    let stderr_lower = outcome.stderr.to_lowercase();
    if stderr_lower.contains("lock") || stderr_lower.contains("eexist") || stderr_lower.contains("busy") {
        return FailureReason::LockContention;
    }
    if outcome.exit_code.is_some_and(|c| c != 0) {
        return FailureReason::ExitCode;
    }
    FailureReason::Unknown
}

/// Backoff schedule for retries.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

/// `min(baseMs * multiplier^(attempt-1) + jitter(10%), maxDelayMs)`.
#[must_use]
pub fn backoff_delay_ms(policy: &BackoffPolicy, attempt: u32, jitter_unit: f64) -> u64 {
    let attempt = attempt.max(1);
    let raw = policy.base_ms as f64 * policy.multiplier.powi(attempt as i32 - 1);
    let jitter = raw * 0.10 * jitter_unit.clamp(-1.0, 1.0);
    let with_jitter = (raw + jitter).max(0.0);
    (with_jitter as u64).min(policy.max_delay_ms)
}

/// Optional quorum completion policy.
#[derive(Debug, Clone)]
pub struct QuorumPolicy {
    pub min_successes: u32,
    pub max_attempts: u32,
}

/// Tracks quorum votes keyed by normalized output fingerprint.
#[derive(Debug, Clone, Default)]
pub struct QuorumTracker {
    votes: HashMap<String, (u32, String)>,
    attempts: u32,
}

impl QuorumTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize(output: &str) -> String {
        let collapsed = output.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
        collapsed.chars().take(2000).collect()
    }

    /// Record one attempt's output. Returns a completion sample once a
    /// fingerprint reaches `minSuccesses`, or a "soft miss" plurality
    /// winner once `maxAttempts` is exhausted; otherwise `None`.
    pub fn record(&mut self, output: &str, policy: &QuorumPolicy) -> Option<String> {
        self.attempts += 1;
        let fingerprint = Self::normalize(output);
        let entry = self.votes.entry(fingerprint).or_insert((0, output.to_string()));
        entry.0 += 1;
        if entry.0 >= policy.min_successes {
            return Some(entry.1.clone());
        }

        if self.attempts >= policy.max_attempts {
            return self
                .votes
                .values()
                .filter(|(_, sample)| !sample.is_empty())
                .max_by_key(|(count, _)| *count)
                .map(|(_, sample)| sample.clone());
        }

        None
    }
}

/// Policy controlling the recovery decision.
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    pub max_attempts: u32,
    pub retry_on: Vec<FailureReason>,
    pub backoff: BackoffPolicy,
    pub allow_degraded: bool,
    pub min_degraded_output_length: usize,
}

/// Decision returned by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryDecision {
    Retry { delay_ms: u64 },
    Fail { reason: &'static str },
    Complete { degraded: bool },
}

/// Decide what to do with one Supervisor attempt (§4.5 decision order).
#[must_use]
pub fn decide(outcome: &Outcome, attempt: u32, output_len: usize, policy: &RecoveryPolicy, jitter_unit: f64) -> RecoveryDecision {
    let success = !outcome.aborted && outcome.exit_code == Some(0);
    if success {
        return RecoveryDecision::Complete { degraded: false };
    }

    let reason = classify(outcome);

    if policy.allow_degraded
        && output_len >= policy.min_degraded_output_length
        && matches!(reason, FailureReason::Stall | FailureReason::Health | FailureReason::ExitCode)
    {
        return RecoveryDecision::Complete { degraded: true };
    }

    if attempt < policy.max_attempts && policy.retry_on.contains(&reason) {
        return RecoveryDecision::Retry {
            delay_ms: backoff_delay_ms(&policy.backoff, attempt, jitter_unit),
        };
    }

    RecoveryDecision::Fail { reason: reason.as_str() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(exit_code: Option<i32>, aborted: bool, origin: Option<AbortOrigin>, stderr: &str) -> Outcome {
        Outcome {
            exit_code,
            stderr: stderr.to_string(),
            aborted,
            abort_origin: origin,
            abort_reason: None,
            health_classification_stalled_or_wedged: false,
        }
    }

    #[test]
    fn success_always_completes() {
        let o = outcome(Some(0), false, None, "");
        let policy = RecoveryPolicy {
            max_attempts: 3,
            retry_on: vec![],
            backoff: BackoffPolicy { base_ms: 100, multiplier: 2.0, max_delay_ms: 5000 },
            allow_degraded: false,
            min_degraded_output_length: 0,
        };
        assert_eq!(decide(&o, 1, 0, &policy, 0.0), RecoveryDecision::Complete { degraded: false });
    }

    #[test]
    fn degraded_completion_when_output_is_substantial() {
        let mut o = outcome(Some(1), false, None, "");
        o.health_classification_stalled_or_wedged = true;
        let policy = RecoveryPolicy {
            max_attempts: 3,
            retry_on: vec![FailureReason::Stall],
            backoff: BackoffPolicy { base_ms: 100, multiplier: 2.0, max_delay_ms: 5000 },
            allow_degraded: true,
            min_degraded_output_length: 10,
        };
        assert_eq!(decide(&o, 1, 500, &policy, 0.0), RecoveryDecision::Complete { degraded: true });
    }

    #[test]
    fn retries_within_attempt_budget() {
        let o = outcome(Some(1), false, None, "");
        let policy = RecoveryPolicy {
            max_attempts: 3,
            retry_on: vec![FailureReason::ExitCode],
            backoff: BackoffPolicy { base_ms: 100, multiplier: 2.0, max_delay_ms: 5000 },
            allow_degraded: false,
            min_degraded_output_length: 0,
        };
        assert_eq!(decide(&o, 1, 0, &policy, 0.0), RecoveryDecision::Retry { delay_ms: 100 });
        assert_eq!(decide(&o, 2, 0, &policy, 0.0), RecoveryDecision::Retry { delay_ms: 200 });
    }

    #[test]
    fn fails_once_attempts_exhausted() {
        let o = outcome(Some(1), false, None, "");
        let policy = RecoveryPolicy {
            max_attempts: 1,
            retry_on: vec![FailureReason::ExitCode],
            backoff: BackoffPolicy { base_ms: 100, multiplier: 2.0, max_delay_ms: 5000 },
            allow_degraded: false,
            min_degraded_output_length: 0,
        };
        assert_eq!(decide(&o, 1, 0, &policy, 0.0), RecoveryDecision::Fail { reason: "exit_code" });
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let policy = BackoffPolicy { base_ms: 1000, multiplier: 3.0, max_delay_ms: 4000 };
        assert_eq!(backoff_delay_ms(&policy, 5, 0.0), 4000);
    }

    #[test]
    fn quorum_completes_on_first_fingerprint_reaching_min_successes() {
        let mut tracker = QuorumTracker::new();
        let policy = QuorumPolicy { min_successes: 2, max_attempts: 5 };
        assert!(tracker.record("Result: OK", &policy).is_none());
        let completed = tracker.record("result:   ok", &policy);
        assert_eq!(completed.as_deref(), Some("Result: OK"));
    }

    #[test]
    fn quorum_soft_misses_with_plurality_winner_after_max_attempts() {
        let mut tracker = QuorumTracker::new();
        let policy = QuorumPolicy { min_successes: 10, max_attempts: 3 };
        tracker.record("a", &policy);
        tracker.record("a", &policy);
        let result = tracker.record("b", &policy);
        assert_eq!(result.as_deref(), Some("a"));
    }
}
