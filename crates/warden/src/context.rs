//! Shared setup used by every subcommand: resolve configuration, then build
//! an `AdmissionController` pointed at the resolved data directory.

use std::time::Duration;

use anyhow::{Context, Result};
use warden_core::admission::AdmissionController;
use warden_core::config::WardenConfig;
use warden_core::pressure::NullPressureProvider;

/// Load configuration, honoring `--data-dir` as the highest-precedence
/// override (above `WARDEN_DATA_DIR` and the config file's own value).
pub fn load_config(data_dir_override: Option<&str>) -> Result<WardenConfig> {
    let mut config = WardenConfig::load().context("loading warden configuration")?;
    if let Some(dir) = data_dir_override {
        config.data_dir = dir.to_string();
    }
    Ok(config)
}

/// Build a controller against the resolved admission state/lock/event paths.
/// The CLI never supplies a pressure probe of its own — the operator surface
/// is read-mostly and relies on whatever orchestrator process is already
/// sampling pressure and writing to the shared state file.
pub fn build_controller(config: &WardenConfig) -> AdmissionController {
    AdmissionController::new(
        config.admission_state_path(),
        config.admission_lock_path(),
        config.event_log_path(),
        config.admission.clone(),
        Box::new(NullPressureProvider),
        config.log.max_bytes,
        config.log.max_backups,
        Duration::from_millis(config.log.check_interval_ms),
    )
}
