//! `warden run` — dispatch one delegated child through the whole admission
//! and supervision pipeline: `preflightRun` -> `acquireSlot` -> the
//! Supervisor -> `releaseSlot`/`endRun`, then print the terminal Outcome.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use clap::Args;
use warden_core::model::RunKind;
use warden_core::supervisor::{LaunchDescriptor, Supervisor};

use crate::context::{build_controller, load_config};
use crate::output::OutputFormat;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Program and arguments to launch as the delegated child
    #[arg(required = true, trailing_var_arg = true)]
    pub argv: Vec<String>,

    /// Run kind admitted against the recursion-depth cap
    #[arg(long, default_value = "subagent", value_parser = ["team", "pipeline", "subagent"])]
    pub kind: String,

    /// Recursion depth of this run
    #[arg(long, default_value_t = 0)]
    pub depth: u32,

    /// Agent label recorded on the acquired slot
    #[arg(long)]
    pub agent: Option<String>,

    /// Dedup key: a concurrent call with the same key reuses the active lease
    #[arg(long)]
    pub idempotency_key: Option<String>,

    /// Overall wall-clock budget for the child before it is aborted
    #[arg(long)]
    pub runtime_limit_ms: Option<u64>,
}

pub async fn run(args: RunArgs, format: OutputFormat, data_dir: Option<&str>) -> Result<()> {
    let config = load_config(data_dir)?;
    let controller = build_controller(&config);

    let kind = match args.kind.as_str() {
        "team" => RunKind::Team,
        "pipeline" => RunKind::Pipeline,
        _ => RunKind::Subagent,
    };
    let run_id = format!("cli-{}", args.argv.join("-"));

    let grant = controller
        .preflight_run(&run_id, kind, args.depth, args.idempotency_key.as_deref())
        .map_err(|code| anyhow!("admission denied: {code}"))?;

    let agent_name = args.agent.clone().unwrap_or_else(|| "cli".to_string());
    let slot = match controller.acquire_slot(&grant.run_id, grant.depth, &agent_name) {
        Ok(slot) => slot,
        Err(code) => {
            controller.end_run(&grant);
            return Err(anyhow!("slot denied: {code}"));
        }
    };

    let supervisor = Supervisor::new(config.health.clone());
    let descriptor = LaunchDescriptor {
        label: run_id,
        argv: args.argv,
        env: HashMap::new(),
        cwd: None,
        runtime_limit_ms: args.runtime_limit_ms,
        force_kill_after_ms: config.supervisor.force_kill_after_ms,
        max_stderr_bytes: config.supervisor.max_stderr_bytes,
    };
    let (_cancel_tx, cancel_rx) = tokio::sync::mpsc::channel(1);
    let outcome = supervisor.run(descriptor, cancel_rx).await;

    controller.release_slot(&slot);
    controller.end_run(&grant);

    let failed = outcome.aborted || outcome.exit_code != Some(0);

    match format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "exitCode": outcome.exit_code,
                "aborted": outcome.aborted,
                "abortOrigin": outcome.abort_origin.map(|o| format!("{o:?}")),
                "abortReason": outcome.abort_reason,
                "stderr": outcome.stderr,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Plain => {
            println!("exit code: {:?}", outcome.exit_code);
            println!("aborted:   {}", outcome.aborted);
            if let Some(origin) = outcome.abort_origin {
                println!("origin:    {origin:?}");
            }
            if let Some(reason) = &outcome.abort_reason {
                println!("reason:    {reason}");
            }
            if !outcome.stderr.is_empty() {
                println!("stderr:\n{}", outcome.stderr);
            }
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}
