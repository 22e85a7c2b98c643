//! Preflight checks
//!
//! Everything that must hold before the first file is touched: external
//! tools present, directories writable, no stale partials, no competing
//! instance, today's tracker loaded, and the installed defender version
//! cleared by the ledger.

use anyhow::Result;
use chrono::Local;
use std::sync::Arc;
use tracing::{info, warn};

use super::lock::InstanceLock;
use crate::config::ShuttleConfig;
use crate::error::ShuttleError;
use crate::files;
use crate::ledger::Ledger;
use crate::scanner::clamav::{CLAMAV_COMMAND, clamav_version};
use crate::scanner::defender::{DEFENDER_COMMAND, defender_version};
use crate::tracker::DailyTracker;

pub struct Preflight {
    // Held for the whole run; dropping it releases the single-instance lock
    pub lock: InstanceLock,
    pub tracker: Arc<DailyTracker>,
    pub scanner_versions: Vec<(String, String)>,
}

pub fn run(config: &ShuttleConfig) -> Result<Preflight> {
    check_required_tools(config)?;
    prepare_directories(config)?;

    // Partial `.copying` files under destination or hazard archive are
    // leftovers from a crashed run and must never be mistaken for deliveries
    let removed = files::cleanup_stale_partials(config.destination_path());
    if let Some(hazard) = &config.paths.hazard_archive_path {
        if hazard.exists() {
            files::cleanup_stale_partials(hazard);
        }
    }
    if removed > 0 {
        info!(removed, "Removed stale partial files from a previous run");
    }

    let lock = InstanceLock::acquire(&config.lock_file())?;

    let tracker_path = config.tracker_file_path();
    let tracker = DailyTracker::load_or_create(&tracker_path, Local::now().date_naive())
        .map_err(|e| ShuttleError::TrackerPersistence(format!("{e:#}")))?;

    if !config.scanning.on_demand_defender && !config.scanning.on_demand_clam_av {
        warn!("No scanners are enabled; files will be delivered unscanned");
    }

    let scanner_versions = collect_scanner_versions(config)?;

    Ok(Preflight {
        lock,
        tracker: Arc::new(tracker),
        scanner_versions,
    })
}

fn check_required_tools(config: &ShuttleConfig) -> Result<()> {
    let mut required: Vec<&str> = Vec::new();
    if config.scanning.on_demand_defender {
        required.push(DEFENDER_COMMAND);
    }
    if config.scanning.on_demand_clam_av {
        required.push(CLAMAV_COMMAND);
    }
    if config.hazard_archiving_enabled() {
        required.push("gpg");
    }
    for tool in required {
        if which::which(tool).is_err() {
            return Err(ShuttleError::Preflight(format!("required tool not on PATH: {tool}")).into());
        }
    }
    Ok(())
}

fn prepare_directories(config: &ShuttleConfig) -> Result<()> {
    let source = config.source_path();
    if !source.is_dir() {
        return Err(ShuttleError::Preflight(format!(
            "source path does not exist or is not a directory: {}",
            source.display()
        ))
        .into());
    }

    let mut writable = vec![
        config.destination_path().to_path_buf(),
        config.quarantine_path().to_path_buf(),
    ];
    if let Some(hazard) = &config.paths.hazard_archive_path {
        writable.push(hazard.clone());
    }
    if let Some(tracking) = &config.paths.tracking_data_path {
        writable.push(tracking.clone());
    }
    // Deleting sources means writing to the source directory
    if config.settings.delete_source_files_after_copying {
        writable.push(source.to_path_buf());
    }

    for dir in writable {
        if !dir.exists() {
            std::fs::create_dir_all(&dir).map_err(|e| {
                ShuttleError::Preflight(format!("cannot create {}: {e}", dir.display()))
            })?;
        }
        files::test_write_access(&dir)
            .map_err(|e| ShuttleError::Preflight(format!("{e:#}")))?;
    }

    if let Some(key) = &config.paths.hazard_encryption_key_path {
        if !key.is_file() {
            return Err(ShuttleError::Preflight(format!(
                "hazard encryption key not found: {}",
                key.display()
            ))
            .into());
        }
    }

    Ok(())
}

/// Collect scanner versions for the report, and enforce the ledger: a
/// defender version that has not passed the detection test suite refuses to
/// run. The check applies when a ledger file is configured.
fn collect_scanner_versions(config: &ShuttleConfig) -> Result<Vec<(String, String)>> {
    let mut versions = Vec::new();

    if config.scanning.on_demand_defender {
        match (&config.paths.ledger_file_path, defender_version()) {
            (Some(ledger_path), Ok(version)) => {
                let ledger = Ledger::load(ledger_path)
                    .map_err(|e| ShuttleError::Preflight(format!("{e:#}")))?;
                if !ledger.is_version_tested(&version) {
                    return Err(ShuttleError::Preflight(format!(
                        "defender version {version} has not passed the ledger test; run shuttle-defender-test first"
                    ))
                    .into());
                }
                versions.push(("defender".to_string(), version));
            }
            (Some(_), Err(e)) => {
                return Err(
                    ShuttleError::Preflight(format!("cannot determine defender version: {e:#}"))
                        .into(),
                );
            }
            (None, Ok(version)) => {
                warn!("No ledger file configured; skipping defender version check");
                versions.push(("defender".to_string(), version));
            }
            (None, Err(e)) => {
                warn!(error = %format!("{e:#}"), "Could not determine defender version");
            }
        }
    }

    if config.scanning.on_demand_clam_av {
        match clamav_version() {
            Ok(version) => versions.push(("clamav".to_string(), version)),
            Err(e) => warn!(error = %format!("{e:#}"), "Could not determine clamav version"),
        }
    }

    Ok(versions)
}
