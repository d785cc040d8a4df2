//! Error types for warden-core.
//!
//! Admission denials are not modeled here — they are first-class
//! [`crate::admission::AdmissionDecision`] values, never `Result` errors,
//! per the "denials are not errors" rule. `Error` covers genuine failures:
//! I/O, malformed state, and the rare case a spawn fails before the
//! Supervisor state machine can even start.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the library's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for warden-core.
#[derive(Error, Debug)]
pub enum Error {
    /// Filesystem I/O failure (state file, lock file, NDJSON log).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Admission state document failed to (de)serialize.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file failed to parse.
    #[error("config error: {0}")]
    Toml(#[from] toml::de::Error),

    /// The advisory lock on the admission state file could not be acquired
    /// within `lockWaitMs`.
    #[error("timed out waiting {waited_ms}ms for advisory lock on {path}")]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    /// The admission state document on disk could not be trusted (missing
    /// fields, version mismatch, or a read/write race left it truncated).
    #[error("admission state corrupt: {detail}")]
    StateCorrupt { detail: String },

    /// A child process could not be spawned at all (binary missing, exec
    /// permission denied, etc). Distinct from a Supervisor abort, which
    /// covers a child that spawned and later had to be killed.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}
