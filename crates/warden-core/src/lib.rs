//! Host-wide admission and supervision fabric for delegated agent
//! subprocesses.
//!
//! See [`admission`] for the Admission Controller, [`supervisor`] for the
//! Delegated Run Supervisor, [`health`] for the Health Monitor,
//! [`governor`] for the Adaptive Governor, and [`recovery`] for the
//! Recovery Coordinator. [`log_writer`] is the shared bounded NDJSON
//! sink all of the above append through.

pub mod admission;
pub mod config;
pub mod error;
pub mod events;
pub mod governor;
pub mod health;
pub mod lock;
pub mod log_writer;
pub mod model;
pub mod pressure;
pub mod recovery;
pub mod supervisor;
pub mod wait;

pub use error::{Error, Result};

/// Crate version, surfaced in telemetry and the `policy` CLI command.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
