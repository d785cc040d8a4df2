//! `warden` — operator CLI for the admission and supervision fabric.
//!
//! Thin wrapper over `warden-core`: every subcommand loads configuration,
//! builds an `AdmissionController` against the resolved data directory, and
//! either reads its state or drives one delegated run through it.

mod commands;
mod context;
mod output;

use clap::{Parser, Subcommand};
use output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "warden", version = warden_core::VERSION, about = "Admission and supervision fabric for delegated agent subprocesses")]
struct Cli {
    /// Output rendering for whichever subcommand runs
    #[arg(short = 'o', long = "format", value_enum, default_value_t = OutputFormat::Plain, global = true)]
    format: OutputFormat,

    /// Override the resolved data directory (beats `WARDEN_DATA_DIR` and the config file)
    #[arg(long, global = true)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// One-screen admission snapshot
    Status(commands::status::StatusArgs),
    /// Print the last N lines of the admission event log
    Tail(commands::tail::TailArgs),
    /// Print the fully resolved configuration
    Policy(commands::policy::PolicyArgs),
    /// Run a delegated child through admission and supervision
    Run(commands::run::RunArgs),
}

#[tokio::main]
async fn main() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_env("WARDEN_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let data_dir = cli.data_dir.as_deref();

    let result = match cli.command {
        Commands::Status(args) => commands::status::run(args, cli.format, data_dir),
        Commands::Tail(args) => commands::tail::run(args, cli.format, data_dir),
        Commands::Policy(args) => commands::policy::run(args, cli.format, data_dir),
        Commands::Run(args) => commands::run::run(args, cli.format, data_dir).await,
    };

    if let Err(err) = result {
        eprintln!("error: {err:#}");
        std::process::exit(2);
    }
}
