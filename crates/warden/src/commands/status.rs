//! `warden status` — one-screen admission snapshot (spec.md §6).

use anyhow::{anyhow, Result};
use clap::Args;

use crate::context::{build_controller, load_config};
use crate::output::OutputFormat;

#[derive(Args, Debug)]
pub struct StatusArgs {}

pub fn run(_args: StatusArgs, format: OutputFormat, data_dir: Option<&str>) -> Result<()> {
    let config = load_config(data_dir)?;
    let controller = build_controller(&config);
    let snapshot = controller
        .get_status()
        .map_err(|code| anyhow!("could not read admission state: {code}"))?;

    match format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "activeRuns": snapshot.active_runs,
                "activeSlots": snapshot.active_slots,
                "gap": snapshot.gap,
                "circuitOpen": snapshot.circuit.open,
                "circuitReason": snapshot.circuit.reason,
                "pressure": snapshot.pressure,
                "lastActivityMs": snapshot.last_activity_ms,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Plain => {
            println!("active runs:     {}", snapshot.active_runs);
            println!("active slots:    {}", snapshot.active_slots);
            println!("call/result gap: {}", snapshot.gap);
            if snapshot.circuit.open {
                println!("circuit:         OPEN ({:?})", snapshot.circuit.reason);
            } else {
                println!("circuit:         closed");
            }
            match &snapshot.pressure {
                Some(p) => println!(
                    "pressure:        {:?} (rss={}MB, procs={})",
                    p.severity, p.node_rss_mb, p.node_count
                ),
                None => println!("pressure:        no probe configured"),
            }
            println!(
                "last activity:   {}",
                warden_core::model::format_epoch_ms(snapshot.last_activity_ms)
            );
        }
    }
    Ok(())
}
