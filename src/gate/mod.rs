//! Stability gate
//!
//! Decides per file whether a source file may be admitted to quarantine in
//! this run. A file is eligible only when its name is safe, its mtime has
//! been stable for the configured window, and no other process holds it open.
//! Every check errs toward skipping: a file left in source is reconsidered on
//! the next run, a file admitted too early is a hazard.

use fs2::FileExt;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::Command;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, warn};

use crate::files::{is_filename_safe, is_pathname_safe};

/// Outcome of the per-file eligibility check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    SkipUnstable,
    SkipOpen,
    SkipUnsafeName,
    SkipError,
}

/// Default minimum age of a file's mtime before it is considered stable.
pub const DEFAULT_STABILITY_WINDOW_SECS: u64 = 5;

pub struct StabilityGate {
    stability_window: Duration,
    skip_stability_check: bool,
    lsof_available: bool,
}

impl StabilityGate {
    pub fn new(stability_window_secs: u64, skip_stability_check: bool) -> Self {
        if skip_stability_check {
            warn!("Stability check is DISABLED - this is a testing mode, do not use in production");
        }
        let lsof_available = which::which("lsof").is_ok();
        if !lsof_available {
            warn!("lsof not found on PATH; open-file probe degrades to advisory locks only");
        }
        Self {
            stability_window: Duration::from_secs(stability_window_secs),
            skip_stability_check,
            lsof_available,
        }
    }

    /// Run all eligibility checks for a candidate source file. `rel` is the
    /// path relative to the source root, used for the path-mode name check.
    pub fn check(&self, path: &Path, rel: &Path) -> Eligibility {
        let Some(file_name) = path.file_name() else {
            return Eligibility::SkipUnsafeName;
        };
        if !is_filename_safe(file_name) || !is_pathname_safe(rel.as_os_str()) {
            debug!(file = %path.display(), "Skipping file with unsafe name");
            return Eligibility::SkipUnsafeName;
        }

        if !self.skip_stability_check {
            match self.is_stable(path) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(file = %path.display(), "File is not yet stable");
                    return Eligibility::SkipUnstable;
                }
                Err(e) => {
                    error!(file = %path.display(), error = %e, "Error checking file stability");
                    return Eligibility::SkipError;
                }
            }
        }

        match self.is_open_elsewhere(path) {
            Ok(false) => Eligibility::Eligible,
            Ok(true) => {
                debug!(file = %path.display(), "File is currently open by another process");
                Eligibility::SkipOpen
            }
            Err(e) => {
                error!(file = %path.display(), error = %e, "Open-file probe failed; skipping");
                Eligibility::SkipError
            }
        }
    }

    fn is_stable(&self, path: &Path) -> anyhow::Result<bool> {
        let mtime = std::fs::metadata(path)?.modified()?;
        let age = SystemTime::now()
            .duration_since(mtime)
            .unwrap_or(Duration::ZERO);
        Ok(age >= self.stability_window)
    }

    /// Probe whether another process holds the file open. The advisory-lock
    /// attempt catches cooperating writers; lsof, when installed, also sees
    /// processes that never take locks.
    fn is_open_elsewhere(&self, path: &Path) -> anyhow::Result<bool> {
        let file = OpenOptions::new().read(true).open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = fs2::FileExt::unlock(&file);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(true),
            Err(e) => return Err(e.into()),
        }

        if self.lsof_available {
            return lsof_reports_open(path);
        }
        Ok(false)
    }
}

/// lsof exit code 0 with output means at least one process has the file
/// open; exit code 1 means none do. Anything else is a probe failure.
fn lsof_reports_open(path: &Path) -> anyhow::Result<bool> {
    let output = Command::new("lsof").arg("--").arg(path).output()?;
    match output.status.code() {
        Some(0) => Ok(!output.stdout.is_empty()),
        Some(1) => Ok(false),
        _ => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("lsof probe failed: {}", stderr.trim());
        }
    }
}
