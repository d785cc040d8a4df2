//! Adaptive Governor (§4.4).
//!
//! Pure, windowed scorer over the parent session's own tool/assistant
//! activity. It never inspects child processes; it is fed
//! [`SessionEvent`]s as the orchestrator emits tool starts/ends and
//! assistant messages.

use std::collections::{HashSet, VecDeque};

use crate::config::GovernorMode;

/// One entry in the governor's rolling window (§3 `GovernorWindow`).
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub at_ms: u64,
    pub kind: SessionEventKind,
    pub signature: Option<String>,
    pub chars: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    ToolStart,
    ToolEndOk,
    ToolEndErr,
    Assistant,
}

/// Direct, strike-bypassing abort/warn reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorReason {
    LowProgress,
    LoopDetected,
    RetryChurn,
    BudgetCostExceeded,
    BudgetTokensExceeded,
    EmergencyFuseExceeded,
}

impl GovernorReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LowProgress => "low_progress",
            Self::LoopDetected => "loop_detected",
            Self::RetryChurn => "retry_churn",
            Self::BudgetCostExceeded => "budget_cost_exceeded",
            Self::BudgetTokensExceeded => "budget_tokens_exceeded",
            Self::EmergencyFuseExceeded => "emergency_fuse_exceeded",
        }
    }
}

/// Verdict of one `evaluate` tick.
#[derive(Debug, Clone, PartialEq)]
pub enum GovernorVerdict {
    Ok,
    Warn { reason: &'static str, message: String },
    Abort { reason: &'static str, message: String },
}

/// Budget usage reported by the caller; the governor does not track cost
/// or token accounting itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct BudgetUsage {
    pub cost_exceeded: bool,
    pub tokens_exceeded: bool,
}

pub struct AdaptiveGovernor {
    mode: GovernorMode,
    window_ms: u64,
    emergency_fuse_ms: u64,
    session_started_ms: u64,
    events: VecDeque<SessionEvent>,
    strikes: u32,
    failure_streak: u32,
    last_failure_signature: Option<String>,
    warned: HashSet<(&'static str, String)>,
}

impl AdaptiveGovernor {
    #[must_use]
    pub fn new(mode: GovernorMode, window_seconds: u64, emergency_fuse_seconds: u64, session_started_ms: u64) -> Self {
        Self {
            mode,
            window_ms: window_seconds * 1000,
            emergency_fuse_ms: emergency_fuse_seconds * 1000,
            session_started_ms,
            events: VecDeque::new(),
            strikes: 0,
            failure_streak: 0,
            last_failure_signature: None,
            warned: HashSet::new(),
        }
    }

    pub fn record(&mut self, event: SessionEvent) {
        match event.kind {
            SessionEventKind::ToolEndErr => {
                if self.last_failure_signature.as_deref() == event.signature.as_deref() {
                    self.failure_streak += 1;
                } else {
                    self.failure_streak = 1;
                    self.last_failure_signature = event.signature.clone();
                }
            }
            SessionEventKind::ToolEndOk => self.failure_streak = 0,
            _ => {}
        }
        self.events.push_back(event);
    }

    fn prune(&mut self, now_ms: u64) {
        while let Some(front) = self.events.front() {
            if now_ms.saturating_sub(front.at_ms) > self.window_ms {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    fn window_score(&self, now_ms: u64) -> f64 {
        let tool_starts = self
            .events
            .iter()
            .filter(|e| e.kind == SessionEventKind::ToolStart)
            .count() as f64;
        let tool_end_ok = self
            .events
            .iter()
            .filter(|e| e.kind == SessionEventKind::ToolEndOk)
            .count() as f64;
        let tool_end_err = self
            .events
            .iter()
            .filter(|e| e.kind == SessionEventKind::ToolEndErr)
            .count() as f64;
        let novel_signatures = {
            let mut seen = HashSet::new();
            self.events
                .iter()
                .filter(|e| e.kind == SessionEventKind::ToolStart)
                .filter(|e| e.signature.as_ref().is_some_and(|sig| seen.insert(sig.clone())))
                .count() as f64
        };
        let assistant_chars: u32 = self
            .events
            .iter()
            .filter(|e| e.kind == SessionEventKind::Assistant)
            .filter_map(|e| e.chars)
            .sum();

        let mut score = 0.0;
        score += (tool_starts * 0.2).min(0.8);
        score += (tool_end_ok * 0.8).min(2.4);
        score += (novel_signatures * 0.4).min(1.2);
        if assistant_chars >= 900 {
            score += 0.9;
        } else if assistant_chars >= 250 {
            score += 0.4;
        }
        if self.has_verification_call() {
            score += 0.8;
        }
        if tool_end_ok >= tool_end_err && tool_end_err > 0.0 {
            score += 0.4;
        }
        score -= (tool_end_err * 0.9).min(2.7);
        if self.is_soft_loop(assistant_chars) {
            score -= 1.2;
        }
        if self.failure_streak >= 2 {
            score -= 0.6;
        }

        if let Some(last) = self.events.back() {
            let idle_ms = now_ms.saturating_sub(last.at_ms);
            if idle_ms > 90_000 {
                let idle_minutes = (idle_ms - 90_000) as f64 / 60_000.0;
                score -= 0.35 * idle_minutes;
            }
        }

        score.clamp(-4.0, 6.0)
    }

    fn has_verification_call(&self) -> bool {
        self.events.iter().any(|e| {
            e.kind == SessionEventKind::ToolStart
                && e.signature
                    .as_deref()
                    .is_some_and(|sig| sig.contains("test") || sig.contains("lint") || sig.contains("build") || sig.contains("typecheck"))
        })
    }

    /// Hard-loop detector: last 4 tool-start signatures identical, low
    /// assistant output, no novel signatures in the window.
    fn hard_loop(&self, now_ms: u64) -> bool {
        let session_age_ms = now_ms.saturating_sub(self.session_started_ms);
        if session_age_ms < 10 * 60 * 1000 {
            return false;
        }
        let tail: Vec<&str> = self
            .events
            .iter()
            .rev()
            .filter(|e| e.kind == SessionEventKind::ToolStart)
            .filter_map(|e| e.signature.as_deref())
            .take(4)
            .collect();
        if tail.len() < 4 || !tail.windows(2).all(|w| w[0] == w[1]) {
            return false;
        }
        let assistant_chars: u32 = self
            .events
            .iter()
            .filter(|e| e.kind == SessionEventKind::Assistant)
            .filter_map(|e| e.chars)
            .sum();
        assistant_chars < 120
    }

    fn is_soft_loop(&self, assistant_chars: u32) -> bool {
        if assistant_chars >= 250 {
            return false;
        }
        let tail: Vec<&str> = self
            .events
            .iter()
            .rev()
            .filter_map(|e| e.signature.as_deref())
            .take(2)
            .collect();
        tail.len() == 2 && tail[0] == tail[1]
    }

    fn threshold_schedule(&self, now_ms: u64) -> (f64, u32) {
        let age_minutes = now_ms.saturating_sub(self.session_started_ms) as f64 / 60_000.0;
        if age_minutes < 5.0 {
            (-0.25, 4)
        } else if age_minutes < 15.0 {
            (0.35, 3)
        } else if age_minutes < 45.0 {
            (0.85, 2)
        } else {
            (1.10, 2)
        }
    }

    /// Evaluate the current window at `now_ms`, folding in direct reasons
    /// and strike-budget accounting.
    pub fn evaluate(&mut self, now_ms: u64, budget: BudgetUsage) -> GovernorVerdict {
        self.prune(now_ms);

        let direct = if now_ms.saturating_sub(self.session_started_ms) > self.emergency_fuse_ms {
            Some(GovernorReason::EmergencyFuseExceeded)
        } else if budget.cost_exceeded {
            Some(GovernorReason::BudgetCostExceeded)
        } else if budget.tokens_exceeded {
            Some(GovernorReason::BudgetTokensExceeded)
        } else if self.hard_loop(now_ms) {
            Some(GovernorReason::LoopDetected)
        } else if self.failure_streak >= 3 {
            Some(GovernorReason::RetryChurn)
        } else {
            None
        };

        if let Some(reason) = direct {
            return self.finalize(reason, format!("{} triggered directly", reason.as_str()));
        }

        let (min_score, strike_budget) = self.threshold_schedule(now_ms);
        let score = self.window_score(now_ms);
        if score < min_score {
            self.strikes += 1;
        } else {
            self.strikes = self.strikes.saturating_sub(1);
        }

        if self.strikes > strike_budget {
            return self.finalize(
                GovernorReason::LowProgress,
                format!("windowScore={score:.2} below minScore={min_score:.2} for {} strikes", self.strikes),
            );
        }

        GovernorVerdict::Ok
    }

    fn finalize(&mut self, reason: GovernorReason, message: String) -> GovernorVerdict {
        match self.mode {
            GovernorMode::Observe => GovernorVerdict::Ok,
            GovernorMode::Warn => {
                let key = (reason.as_str(), message.clone());
                if self.warned.insert(key) {
                    GovernorVerdict::Warn {
                        reason: reason.as_str(),
                        message,
                    }
                } else {
                    GovernorVerdict::Ok
                }
            }
            GovernorMode::Enforce => GovernorVerdict::Abort {
                reason: reason.as_str(),
                message,
            },
        }
    }
}
