//! Configuration management for warden.
//!
//! Mirrors the teacher crate's `Config` pattern: a struct-of-structs with
//! per-field `#[serde(default = "...")]` functions, a matching `Default`
//! impl, and a `load()`/`load_from(path)` pair. Unlike a stub, `load()`
//! here actually reads `WARDEN_CONFIG` (or `<data_dir>/warden.toml`) and
//! then applies the environment-variable overrides enumerated in
//! spec.md §6, clamping each to the safe bounds §5 promises.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WardenConfig {
    #[serde(default)]
    pub admission: AdmissionPolicy,
    #[serde(default)]
    pub supervisor: SupervisorPolicy,
    #[serde(default)]
    pub health: HealthPolicy,
    #[serde(default)]
    pub governor: GovernorPolicy,
    #[serde(default)]
    pub log: LogPolicy,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            admission: AdmissionPolicy::default(),
            supervisor: SupervisorPolicy::default(),
            health: HealthPolicy::default(),
            governor: GovernorPolicy::default(),
            log: LogPolicy::default(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> String {
    "~/.local/share/warden".to_string()
}

/// Admission Controller policy (spec.md §6, admission-related rows).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdmissionPolicy {
    #[serde(default = "default_max_runs")]
    pub max_runs: u32,
    #[serde(default = "default_max_slots")]
    pub max_slots: u32,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    #[serde(default = "default_breaker_cooldown_ms")]
    pub breaker_cooldown_ms: u64,
    #[serde(default = "default_call_result_gap_max")]
    pub call_result_gap_max: u64,
    #[serde(default = "default_gap_reset_quiet_ms")]
    pub gap_reset_quiet_ms: u64,
    #[serde(default = "default_run_lease_ttl_ms")]
    pub run_lease_ttl_ms: u64,
    #[serde(default = "default_slot_lease_ttl_ms")]
    pub slot_lease_ttl_ms: u64,
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
    #[serde(default = "default_lock_stale_ms")]
    pub lock_stale_ms: u64,
}

fn default_max_runs() -> u32 {
    6
}
fn default_max_slots() -> u32 {
    16
}
fn default_max_depth() -> u32 {
    2
}
fn default_breaker_cooldown_ms() -> u64 {
    30_000
}
fn default_call_result_gap_max() -> u64 {
    24
}
fn default_gap_reset_quiet_ms() -> u64 {
    45_000
}
fn default_run_lease_ttl_ms() -> u64 {
    1_800_000
}
fn default_slot_lease_ttl_ms() -> u64 {
    600_000
}
fn default_lock_wait_ms() -> u64 {
    5_000
}
fn default_lock_stale_ms() -> u64 {
    60_000
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            max_runs: default_max_runs(),
            max_slots: default_max_slots(),
            max_depth: default_max_depth(),
            breaker_cooldown_ms: default_breaker_cooldown_ms(),
            call_result_gap_max: default_call_result_gap_max(),
            gap_reset_quiet_ms: default_gap_reset_quiet_ms(),
            run_lease_ttl_ms: default_run_lease_ttl_ms(),
            slot_lease_ttl_ms: default_slot_lease_ttl_ms(),
            lock_wait_ms: default_lock_wait_ms(),
            lock_stale_ms: default_lock_stale_ms(),
        }
    }
}

impl AdmissionPolicy {
    /// Clamp all fields to the safe bounds the spec promises at load time.
    fn clamp(&mut self) {
        self.max_runs = self.max_runs.clamp(1, 256);
        self.max_slots = self.max_slots.clamp(1, 2048);
        self.max_depth = self.max_depth.clamp(0, 16);
        self.breaker_cooldown_ms = self.breaker_cooldown_ms.clamp(1_000, 3_600_000);
        self.gap_reset_quiet_ms = self.gap_reset_quiet_ms.clamp(1_000, 3_600_000);
        self.run_lease_ttl_ms = self.run_lease_ttl_ms.clamp(10_000, 86_400_000);
        self.slot_lease_ttl_ms = self.slot_lease_ttl_ms.clamp(10_000, 86_400_000);
        self.lock_wait_ms = self.lock_wait_ms.clamp(100, 120_000);
        self.lock_stale_ms = self.lock_stale_ms.clamp(self.lock_wait_ms, 3_600_000);
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }

    pub fn lock_stale(&self) -> Duration {
        Duration::from_millis(self.lock_stale_ms)
    }
}

/// Delegated Run Supervisor policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorPolicy {
    #[serde(default = "default_force_kill_after_ms")]
    pub force_kill_after_ms: u64,
    #[serde(default = "default_max_stderr_bytes")]
    pub max_stderr_bytes: usize,
}

fn default_force_kill_after_ms() -> u64 {
    5_000
}
fn default_max_stderr_bytes() -> usize {
    64 * 1024
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self {
            force_kill_after_ms: default_force_kill_after_ms(),
            max_stderr_bytes: default_max_stderr_bytes(),
        }
    }
}

impl SupervisorPolicy {
    fn clamp(&mut self) {
        self.force_kill_after_ms = self.force_kill_after_ms.clamp(100, 120_000);
        self.max_stderr_bytes = self.max_stderr_bytes.clamp(4 * 1024, 16 * 1024 * 1024);
    }
}

/// Health Monitor policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthPolicy {
    #[serde(default = "default_warn_no_progress_ms")]
    pub warn_no_progress_ms: u64,
    #[serde(default = "default_abort_no_progress_ms")]
    pub abort_no_progress_ms: u64,
    #[serde(default = "default_abort_quick_tool_ms")]
    pub abort_quick_tool_ms: u64,
    #[serde(default = "default_abort_active_tool_ms")]
    pub abort_active_tool_ms: u64,
    #[serde(default = "default_warn_cooldown_ms")]
    pub warn_cooldown_ms: u64,
    #[serde(default)]
    pub aborts_disabled: bool,
}

fn default_warn_no_progress_ms() -> u64 {
    120_000
}
fn default_abort_no_progress_ms() -> u64 {
    900_000
}
fn default_abort_quick_tool_ms() -> u64 {
    300_000
}
fn default_abort_active_tool_ms() -> u64 {
    1_800_000
}
fn default_warn_cooldown_ms() -> u64 {
    60_000
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            warn_no_progress_ms: default_warn_no_progress_ms(),
            abort_no_progress_ms: default_abort_no_progress_ms(),
            abort_quick_tool_ms: default_abort_quick_tool_ms(),
            abort_active_tool_ms: default_abort_active_tool_ms(),
            warn_cooldown_ms: default_warn_cooldown_ms(),
            aborts_disabled: false,
        }
    }
}

impl HealthPolicy {
    fn clamp(&mut self) {
        self.warn_no_progress_ms = self.warn_no_progress_ms.clamp(1_000, 3_600_000);
        self.abort_no_progress_ms = self.abort_no_progress_ms.clamp(self.warn_no_progress_ms, 86_400_000);
        self.abort_quick_tool_ms = self.abort_quick_tool_ms.clamp(1_000, 86_400_000);
        self.abort_active_tool_ms = self.abort_active_tool_ms.clamp(1_000, 86_400_000);
        self.warn_cooldown_ms = self.warn_cooldown_ms.clamp(1_000, 3_600_000);
    }
}

/// Adaptive Governor policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GovernorPolicy {
    #[serde(default = "default_governor_mode")]
    pub mode: GovernorMode,
    #[serde(default = "default_governor_check_seconds")]
    pub check_seconds: u64,
    #[serde(default = "default_governor_window_seconds")]
    pub window_seconds: u64,
    #[serde(default = "default_emergency_fuse_seconds")]
    pub emergency_fuse_seconds: u64,
}

/// Operating mode of the Adaptive Governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GovernorMode {
    /// Score only; never interrupt.
    Observe,
    /// Emit warnings; do not abort.
    Warn,
    /// Convert reasons to abort.
    Enforce,
}

fn default_governor_mode() -> GovernorMode {
    GovernorMode::Warn
}
fn default_governor_check_seconds() -> u64 {
    75
}
fn default_governor_window_seconds() -> u64 {
    180
}
fn default_emergency_fuse_seconds() -> u64 {
    14_400
}

impl Default for GovernorPolicy {
    fn default() -> Self {
        Self {
            mode: default_governor_mode(),
            check_seconds: default_governor_check_seconds(),
            window_seconds: default_governor_window_seconds(),
            emergency_fuse_seconds: default_emergency_fuse_seconds(),
        }
    }
}

impl GovernorPolicy {
    fn clamp(&mut self) {
        self.check_seconds = self.check_seconds.clamp(5, 3_600);
        self.window_seconds = self.window_seconds.clamp(30, 86_400);
        self.emergency_fuse_seconds = self.emergency_fuse_seconds.clamp(60, 604_800);
    }
}

/// Bounded Log Writer policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogPolicy {
    #[serde(default = "default_event_log_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_event_log_max_backups")]
    pub max_backups: u32,
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
}

fn default_event_log_max_bytes() -> u64 {
    10_485_760
}
fn default_event_log_max_backups() -> u32 {
    5
}
fn default_check_interval_ms() -> u64 {
    1_000
}

impl Default for LogPolicy {
    fn default() -> Self {
        Self {
            max_bytes: default_event_log_max_bytes(),
            max_backups: default_event_log_max_backups(),
            check_interval_ms: default_check_interval_ms(),
        }
    }
}

impl LogPolicy {
    fn clamp(&mut self) {
        self.max_bytes = self.max_bytes.clamp(64 * 1024, 1024 * 1024 * 1024);
        self.max_backups = self.max_backups.clamp(1, 20);
        self.check_interval_ms = self.check_interval_ms.clamp(50, 60_000);
    }
}

impl WardenConfig {
    /// Load configuration from `WARDEN_CONFIG`, falling back to
    /// `<data_dir>/warden.toml`, then apply environment-variable overrides.
    /// Missing files are not an error — defaults apply.
    pub fn load() -> Result<Self> {
        let mut cfg = if let Ok(path) = std::env::var("WARDEN_CONFIG") {
            Self::load_from(Path::new(&path))?
        } else {
            let default_path = Self::default_config_path();
            if default_path.exists() {
                Self::load_from(&default_path)?
            } else {
                Self::default()
            }
        };
        cfg.apply_env_overrides();
        cfg.clamp();
        Ok(cfg)
    }

    /// Load configuration from a specific path, without env overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut cfg: Self = toml::from_str(&text)?;
        cfg.clamp();
        Ok(cfg)
    }

    fn default_config_path() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("warden")
            .join("warden.toml")
    }

    /// Apply the "Environment-driven configuration" table from spec.md §6.
    fn apply_env_overrides(&mut self) {
        set_u32_env(&mut self.admission.max_runs, "WARDEN_MAX_RUNS");
        set_u32_env(&mut self.admission.max_slots, "WARDEN_MAX_SLOTS");
        set_u32_env(&mut self.admission.max_depth, "WARDEN_MAX_DEPTH");
        set_u64_env(&mut self.admission.breaker_cooldown_ms, "WARDEN_BREAKER_COOLDOWN_MS");
        set_u64_env(&mut self.admission.call_result_gap_max, "WARDEN_CALL_RESULT_GAP_MAX");
        set_u64_env(&mut self.admission.gap_reset_quiet_ms, "WARDEN_GAP_RESET_QUIET_MS");
        set_u64_env(&mut self.admission.run_lease_ttl_ms, "WARDEN_RUN_LEASE_TTL_MS");
        set_u64_env(&mut self.admission.slot_lease_ttl_ms, "WARDEN_SLOT_LEASE_TTL_MS");

        if let Ok(raw) = std::env::var("WARDEN_GOVERNOR_MODE") {
            self.governor.mode = match raw.to_ascii_lowercase().as_str() {
                "observe" => GovernorMode::Observe,
                "enforce" => GovernorMode::Enforce,
                _ => GovernorMode::Warn,
            };
        }
        set_u64_env(&mut self.governor.check_seconds, "WARDEN_GOVERNOR_CHECK_SECONDS");
        set_u64_env(&mut self.governor.window_seconds, "WARDEN_GOVERNOR_WINDOW_SECONDS");
        set_u64_env(&mut self.governor.emergency_fuse_seconds, "WARDEN_EMERGENCY_FUSE_SECONDS");

        set_u64_env(&mut self.health.warn_no_progress_ms, "WARDEN_DELEGATED_HEALTH_WARN_MS");
        set_u64_env(&mut self.health.abort_no_progress_ms, "WARDEN_DELEGATED_HEALTH_ABORT_MS");
        set_u64_env(&mut self.health.abort_quick_tool_ms, "WARDEN_DELEGATED_HEALTH_QUICK_TOOL_MS");
        set_u64_env(&mut self.health.abort_active_tool_ms, "WARDEN_DELEGATED_HEALTH_ACTIVE_TOOL_MS");

        set_u64_env(&mut self.log.max_bytes, "WARDEN_EVENT_LOG_MAX_BYTES");
        set_u32_env(&mut self.log.max_backups, "WARDEN_EVENT_LOG_MAX_BACKUPS");

        if let Ok(dir) = std::env::var("WARDEN_DATA_DIR") {
            self.data_dir = dir;
        }
    }

    fn clamp(&mut self) {
        self.admission.clamp();
        self.supervisor.clamp();
        self.health.clamp();
        self.governor.clamp();
        self.log.clamp();
    }

    /// Resolve `data_dir`, expanding a leading `~` the way shells do.
    pub fn resolved_data_dir(&self) -> PathBuf {
        if let Some(rest) = self.data_dir.strip_prefix("~/") {
            dirs::home_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join(rest)
        } else {
            PathBuf::from(&self.data_dir)
        }
    }

    pub fn admission_state_path(&self) -> PathBuf {
        self.resolved_data_dir().join("admission.json")
    }

    pub fn admission_lock_path(&self) -> PathBuf {
        self.resolved_data_dir().join("admission.lock")
    }

    pub fn event_log_path(&self) -> PathBuf {
        self.resolved_data_dir().join("events.ndjson")
    }
}

fn set_u32_env(field: &mut u32, key: &str) {
    if let Ok(raw) = std::env::var(key) {
        if let Ok(v) = raw.parse() {
            *field = v;
        }
    }
}

fn set_u64_env(field: &mut u64, key: &str) {
    if let Ok(raw) = std::env::var(key) {
        if let Ok(v) = raw.parse() {
            *field = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = WardenConfig::default();
        assert_eq!(config.admission.max_runs, 6);
        assert_eq!(config.admission.max_slots, 16);
        assert_eq!(config.admission.max_depth, 2);
        assert_eq!(config.governor.mode, GovernorMode::Warn);
    }

    #[test]
    fn clamp_enforces_log_bounds() {
        let mut log = LogPolicy {
            max_bytes: 1,
            max_backups: 0,
            check_interval_ms: 0,
        };
        log.clamp();
        assert_eq!(log.max_bytes, 64 * 1024);
        assert_eq!(log.max_backups, 1);
        assert_eq!(log.check_interval_ms, 50);
    }

    #[test]
    fn load_from_missing_file_is_an_error() {
        let result = WardenConfig::load_from(Path::new("/nonexistent/warden.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn load_from_parses_partial_toml_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.toml");
        std::fs::write(&path, "[admission]\nmax_runs = 3\n").unwrap();
        let cfg = WardenConfig::load_from(&path).unwrap();
        assert_eq!(cfg.admission.max_runs, 3);
        assert_eq!(cfg.admission.max_slots, 16);
    }

    #[test]
    fn lock_stale_never_below_lock_wait() {
        let mut policy = AdmissionPolicy {
            lock_wait_ms: 10_000,
            lock_stale_ms: 500,
            ..AdmissionPolicy::default()
        };
        policy.clamp();
        assert!(policy.lock_stale_ms >= policy.lock_wait_ms);
    }
}
