//! `warden policy` — print the fully resolved configuration.

use anyhow::Result;
use clap::Args;

use crate::context::load_config;
use crate::output::OutputFormat;

#[derive(Args, Debug)]
pub struct PolicyArgs {}

pub fn run(_args: PolicyArgs, format: OutputFormat, data_dir: Option<&str>) -> Result<()> {
    let config = load_config(data_dir)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
        OutputFormat::Plain => {
            println!("warden {}", warden_core::VERSION);
            println!("data dir:  {}", config.resolved_data_dir().display());
            println!(
                "admission: max_runs={} max_slots={} max_depth={} gap_max={} breaker_cooldown_ms={}",
                config.admission.max_runs,
                config.admission.max_slots,
                config.admission.max_depth,
                config.admission.call_result_gap_max,
                config.admission.breaker_cooldown_ms
            );
            println!(
                "governor:  mode={:?} window={}s fuse={}s check={}s",
                config.governor.mode, config.governor.window_seconds, config.governor.emergency_fuse_seconds, config.governor.check_seconds
            );
            println!(
                "health:    warn={}ms quick_abort={}ms active_abort={}ms aborts_disabled={}",
                config.health.warn_no_progress_ms,
                config.health.abort_quick_tool_ms,
                config.health.abort_active_tool_ms,
                config.health.aborts_disabled
            );
            println!(
                "log:       max_bytes={} max_backups={} check_interval_ms={}",
                config.log.max_bytes, config.log.max_backups, config.log.check_interval_ms
            );
        }
    }
    Ok(())
}
