//! Host-pressure probe interface (§6).
//!
//! The admission controller consults a pluggable [`PressureProvider`] before
//! granting a run. Tests and embedders supply a deterministic provider;
//! the `pressure-probe` feature adds a default sampler over `/proc`.

use crate::model::{PressureSeverity, PressureSnapshot};

/// Thresholds (both on process count and aggregate RSS) that map a raw
/// sample to a [`PressureSeverity`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PressureThresholds {
    pub warn_rss_mb: u64,
    pub critical_rss_mb: u64,
    pub warn_count: u32,
    pub critical_count: u32,
}

impl PressureThresholds {
    #[must_use]
    pub fn classify(&self, rss_mb: u64, count: u32) -> PressureSeverity {
        if rss_mb >= self.critical_rss_mb || count >= self.critical_count {
            PressureSeverity::Critical
        } else if rss_mb >= self.warn_rss_mb || count >= self.warn_count {
            PressureSeverity::Warn
        } else {
            PressureSeverity::Ok
        }
    }
}

/// A source of host-pressure samples. Returning `None` means "no sample
/// available"; the admission controller treats that as `ok`.
pub trait PressureProvider: Send + Sync {
    fn sample(&self, now_ms: u64) -> Option<PressureSnapshot>;
}

/// A provider that always reports the same fixed snapshot. Used in tests to
/// drive the breaker deterministically (see end-to-end scenario 3 in the
/// testable-properties list).
pub struct FixedPressureProvider {
    pub severity: PressureSeverity,
    pub node_count: u32,
    pub node_rss_mb: u64,
    pub total_processes: u32,
}

impl PressureProvider for FixedPressureProvider {
    fn sample(&self, now_ms: u64) -> Option<PressureSnapshot> {
        Some(PressureSnapshot {
            ts: now_ms,
            severity: self.severity,
            node_count: self.node_count,
            node_rss_mb: self.node_rss_mb,
            total_processes: self.total_processes,
        })
    }
}

/// A provider with no signal. `preflightRun` never denies on pressure.
pub struct NullPressureProvider;

impl PressureProvider for NullPressureProvider {
    fn sample(&self, _now_ms: u64) -> Option<PressureSnapshot> {
        None
    }
}

/// Default OS process-table sampler: aggregates RSS across processes whose
/// command line matches `binary_name`. Only built with `pressure-probe`
/// since it shells out to read `/proc` and is not portable.
#[cfg(feature = "pressure-probe")]
pub struct ProcessTableProvider {
    pub binary_name: String,
    pub thresholds: PressureThresholds,
}

#[cfg(feature = "pressure-probe")]
impl PressureProvider for ProcessTableProvider {
    fn sample(&self, now_ms: u64) -> Option<PressureSnapshot> {
        let (node_count, node_rss_mb) = scan_proc(&self.binary_name);
        let total_processes = count_all_processes();
        let severity = self.thresholds.classify(node_rss_mb, node_count);
        Some(PressureSnapshot {
            ts: now_ms,
            severity,
            node_count,
            node_rss_mb,
            total_processes,
        })
    }
}

#[cfg(feature = "pressure-probe")]
fn scan_proc(binary_name: &str) -> (u32, u64) {
    let mut count = 0u32;
    let mut rss_kb_total = 0u64;
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return (0, 0);
    };
    for entry in entries.flatten() {
        let pid_dir = entry.path();
        let Some(pid_name) = pid_dir.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if pid_name.parse::<u32>().is_err() {
            continue;
        }
        let Ok(cmdline) = std::fs::read_to_string(pid_dir.join("cmdline")) else {
            continue;
        };
        if !cmdline.contains(binary_name) {
            continue;
        }
        count += 1;
        if let Ok(status) = std::fs::read_to_string(pid_dir.join("status")) {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    if let Some(kb) = rest.trim().split_whitespace().next() {
                        rss_kb_total += kb.parse::<u64>().unwrap_or(0);
                    }
                }
            }
        }
    }
    (count, rss_kb_total / 1024)
}

#[cfg(feature = "pressure-probe")]
fn count_all_processes() -> u32 {
    std::fs::read_dir("/proc")
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| {
                    e.path()
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.parse::<u32>().is_ok())
                })
                .count() as u32
        })
        .unwrap_or(0)
}
