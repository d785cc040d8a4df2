//! Shared `--format` flag for every subcommand.

use clap::ValueEnum;

/// Output rendering selected by `--format`/`-o`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable, no ANSI escapes — safe to pipe or diff.
    #[default]
    Plain,
    /// Stable, pretty-printed JSON for automation.
    Json,
}
