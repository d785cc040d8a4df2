//! `warden tail` — print the last N lines of the admission event log.

use anyhow::Result;
use clap::Args;

use crate::context::load_config;
use crate::output::OutputFormat;

#[derive(Args, Debug)]
pub struct TailArgs {
    /// Number of trailing NDJSON lines to print
    #[arg(short = 'n', long, default_value_t = 20)]
    pub lines: usize,
}

pub fn run(args: TailArgs, format: OutputFormat, data_dir: Option<&str>) -> Result<()> {
    let config = load_config(data_dir)?;
    let path = config.event_log_path();
    let content = std::fs::read_to_string(&path).unwrap_or_default();
    let all_lines: Vec<&str> = content.lines().collect();
    let start = all_lines.len().saturating_sub(args.lines);
    let tail = &all_lines[start..];

    match format {
        OutputFormat::Json => {
            let values: Vec<serde_json::Value> =
                tail.iter().filter_map(|line| serde_json::from_str(line).ok()).collect();
            println!("{}", serde_json::to_string_pretty(&values)?);
        }
        OutputFormat::Plain => {
            for line in tail {
                let prefix = serde_json::from_str::<serde_json::Value>(line)
                    .ok()
                    .and_then(|v| v.get("ts").and_then(serde_json::Value::as_u64))
                    .map(|ts| format!("[{}] ", warden_core::model::format_epoch_ms(ts)))
                    .unwrap_or_default();
                println!("{prefix}{line}");
            }
        }
    }
    Ok(())
}
