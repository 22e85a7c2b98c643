//! Error taxonomy for Shuttle
//!
//! Per-file soft and hard errors stay inside the pipeline as outcomes; the
//! variants here are the conditions the orchestrator must tell apart because
//! they change how the process exits.

use std::path::PathBuf;
use thiserror::Error;

/// Process exit codes. Zero is success; everything else is a distinct
/// failure class so operators can branch on `$?` in scheduled jobs.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const FATAL: i32 = 1;
    pub const PARTIAL: i32 = 2;
    pub const INTERRUPTED: i32 = 3;
}

#[derive(Error, Debug)]
pub enum ShuttleError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Preflight check failed: {0}")]
    Preflight(String),

    #[error("Another instance holds the lock file: {0}")]
    LockHeld(PathBuf),

    #[error("Tracker persistence failed: {0}")]
    TrackerPersistence(String),

    #[error("Run interrupted by signal")]
    Interrupted,

    #[error("Run completed with {failed} failed file(s)")]
    Partial { failed: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShuttleError {
    /// Map an error to the process exit code its class demands.
    pub fn exit_code(&self) -> i32 {
        match self {
            ShuttleError::Config(_)
            | ShuttleError::Preflight(_)
            | ShuttleError::LockHeld(_)
            | ShuttleError::TrackerPersistence(_)
            | ShuttleError::Io(_) => exit_code::FATAL,
            ShuttleError::Partial { .. } => exit_code::PARTIAL,
            ShuttleError::Interrupted => exit_code::INTERRUPTED,
        }
    }
}
