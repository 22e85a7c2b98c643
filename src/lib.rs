//! # Shuttle - Scanned batch file transfer
//!
//! Shuttle moves files from an untrusted source tree to a trusted destination
//! tree, but only after each file has been scanned by one or more on-demand
//! malware scanners. Clean files are delivered with hash verification; suspect
//! files are encrypted into a hazard archive or surrendered to the platform
//! defender.
//!
//! ## Features
//!
//! - **Quarantine staging**: files are copied into a per-run quarantine before
//!   scanning; the destination only ever sees verified-clean content
//! - **Admission control**: free-space headroom plus daily and per-run
//!   file-count and volume caps
//! - **Crash-safe accounting**: a per-day tracker records every file's
//!   progress and survives interrupted runs
//! - **Scanner abstraction**: Microsoft Defender and ClamAV results are
//!   normalized into a single verdict
//!
//! ## Quick Start
//!
//! ```bash
//! shuttle --source-path /srv/inbound \
//!         --destination-path /srv/clean \
//!         --quarantine-path /srv/quarantine
//! ```

pub mod cli;
pub mod config;
pub mod disposition;
pub mod error;
pub mod files;
pub mod gate;
pub mod ledger;
pub mod notify;
pub mod pipeline;
pub mod report;
pub mod scanner;
pub mod throttle;
pub mod tracker;

pub use cli::{Cli, Output};
pub use config::ShuttleConfig;
pub use error::ShuttleError;

/// Result type alias for Shuttle operations
pub type Result<T> = anyhow::Result<T>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
