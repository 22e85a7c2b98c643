//! Disk-space and throughput admission control
//!
//! Consulted once per candidate file, before the quarantine copy. A candidate
//! is admitted only when every enabled cap holds; the first rejection is
//! treated by the orchestrator as a stop signal for the rest of the run, so
//! enumeration order stays fair and a large early file is never starved by a
//! small later one.

use anyhow::Result;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

use crate::tracker::{DailySnapshot, RunView};

pub const BYTES_PER_MB: u64 = 1024 * 1024;

/// Why a candidate was refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThrottleReason {
    NoSpaceDest,
    NoSpaceQuarantine,
    NoSpaceHazard,
    DailyFileCap,
    DailyByteCap,
    RunFileCap,
    RunByteCap,
}

impl fmt::Display for ThrottleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ThrottleReason::NoSpaceDest => "insufficient free space in destination",
            ThrottleReason::NoSpaceQuarantine => "insufficient free space in quarantine",
            ThrottleReason::NoSpaceHazard => "insufficient free space in hazard archive",
            ThrottleReason::DailyFileCap => "daily file count limit reached",
            ThrottleReason::DailyByteCap => "daily volume limit reached",
            ThrottleReason::RunFileCap => "per-run file count limit reached",
            ThrottleReason::RunByteCap => "per-run volume limit reached",
        };
        f.write_str(s)
    }
}

/// Admission decision for one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected(ThrottleReason),
}

/// The configured caps. Any `max` of zero disables that cap.
#[derive(Debug, Clone, Default)]
pub struct ThrottleBudget {
    pub enabled: bool,
    pub min_free_space_mb: u64,
    pub max_files_per_run: u64,
    pub max_volume_per_run_mb: u64,
    pub max_files_per_day: u64,
    pub max_volume_per_day_mb: u64,
}

/// Source of free-space readings. The production reader asks the OS; tests
/// inject fixed numbers.
pub trait FreeSpace: Send + Sync {
    fn available_bytes(&self, path: &Path) -> Result<u64>;
}

pub struct SysFreeSpace;

impl FreeSpace for SysFreeSpace {
    fn available_bytes(&self, path: &Path) -> Result<u64> {
        Ok(fs2::available_space(path)?)
    }
}

pub struct ThrottleController {
    budget: ThrottleBudget,
    destination: PathBuf,
    quarantine: PathBuf,
    hazard_archive: Option<PathBuf>,
    free_space: Box<dyn FreeSpace>,
}

impl ThrottleController {
    pub fn new(
        budget: ThrottleBudget,
        destination: PathBuf,
        quarantine: PathBuf,
        hazard_archive: Option<PathBuf>,
    ) -> Self {
        Self::with_free_space(
            budget,
            destination,
            quarantine,
            hazard_archive,
            Box::new(SysFreeSpace),
        )
    }

    pub fn with_free_space(
        budget: ThrottleBudget,
        destination: PathBuf,
        quarantine: PathBuf,
        hazard_archive: Option<PathBuf>,
        free_space: Box<dyn FreeSpace>,
    ) -> Self {
        Self {
            budget,
            destination,
            quarantine,
            hazard_archive,
            free_space,
        }
    }

    /// Decide whether one more candidate of `candidate_bytes` may enter the
    /// pipeline, given the day's totals and the current run's view (which
    /// includes bytes still in flight).
    pub fn admit(
        &self,
        candidate_bytes: u64,
        daily: &DailySnapshot,
        run: &RunView,
    ) -> Admission {
        if !self.budget.enabled {
            return Admission::Admitted;
        }

        let pending_bytes = run.pending_bytes;

        for (dir, reason) in self.space_checked_dirs() {
            match self.has_headroom(dir, pending_bytes, candidate_bytes) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(dir = %dir.display(), %reason, "Throttle rejection");
                    return Admission::Rejected(reason);
                }
                Err(e) => {
                    // A directory whose free space cannot be read must not
                    // accept more work
                    error!(dir = %dir.display(), error = %e, "Free space reading failed");
                    return Admission::Rejected(reason);
                }
            }
        }

        let max = &self.budget;
        if max.max_files_per_day > 0
            && daily.terminal_files + run.pending_files + 1 > max.max_files_per_day
        {
            return Admission::Rejected(ThrottleReason::DailyFileCap);
        }
        if max.max_volume_per_day_mb > 0
            && daily.terminal_bytes + pending_bytes + candidate_bytes
                > max.max_volume_per_day_mb * BYTES_PER_MB
        {
            return Admission::Rejected(ThrottleReason::DailyByteCap);
        }
        if max.max_files_per_run > 0
            && run.completed_files + run.pending_files + 1 > max.max_files_per_run
        {
            return Admission::Rejected(ThrottleReason::RunFileCap);
        }
        if max.max_volume_per_run_mb > 0
            && run.completed_bytes + pending_bytes + candidate_bytes
                > max.max_volume_per_run_mb * BYTES_PER_MB
        {
            return Admission::Rejected(ThrottleReason::RunByteCap);
        }

        Admission::Admitted
    }

    fn space_checked_dirs(&self) -> Vec<(&Path, ThrottleReason)> {
        let mut dirs = vec![
            (self.destination.as_path(), ThrottleReason::NoSpaceDest),
            (self.quarantine.as_path(), ThrottleReason::NoSpaceQuarantine),
        ];
        if let Some(hazard) = &self.hazard_archive {
            dirs.push((hazard.as_path(), ThrottleReason::NoSpaceHazard));
        }
        dirs
    }

    /// Free space must cover what is already in flight, the candidate, and
    /// still leave the configured headroom.
    fn has_headroom(&self, dir: &Path, pending_bytes: u64, candidate_bytes: u64) -> Result<bool> {
        if self.budget.min_free_space_mb == 0 {
            return Ok(true);
        }
        let free = self.free_space.available_bytes(dir)?;
        let needed = pending_bytes
            .saturating_add(candidate_bytes)
            .saturating_add(self.budget.min_free_space_mb * BYTES_PER_MB);
        Ok(free >= needed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedFreeSpace(u64);

    impl FreeSpace for FixedFreeSpace {
        fn available_bytes(&self, _path: &Path) -> Result<u64> {
            Ok(self.0)
        }
    }

    fn controller(budget: ThrottleBudget, free_bytes: u64) -> ThrottleController {
        ThrottleController::with_free_space(
            budget,
            PathBuf::from("/dest"),
            PathBuf::from("/quarantine"),
            Some(PathBuf::from("/hazard")),
            Box::new(FixedFreeSpace(free_bytes)),
        )
    }

    fn idle_run() -> RunView {
        RunView::default()
    }

    fn quiet_day() -> DailySnapshot {
        DailySnapshot::default()
    }

    #[test]
    fn test_disabled_throttle_admits_everything() {
        let ctl = controller(ThrottleBudget::default(), 0);
        assert_eq!(
            ctl.admit(u64::MAX / 4, &quiet_day(), &idle_run()),
            Admission::Admitted
        );
    }

    #[test]
    fn test_no_space_rejection() {
        // 3 MB free, 100 MB headroom required: the first 1 MB file is refused
        let budget = ThrottleBudget {
            enabled: true,
            min_free_space_mb: 100,
            ..Default::default()
        };
        let ctl = controller(budget, 3 * BYTES_PER_MB);
        assert_eq!(
            ctl.admit(BYTES_PER_MB, &quiet_day(), &idle_run()),
            Admission::Rejected(ThrottleReason::NoSpaceDest)
        );
    }

    #[test]
    fn test_free_space_accounts_for_pending_bytes() {
        let budget = ThrottleBudget {
            enabled: true,
            min_free_space_mb: 10,
            ..Default::default()
        };
        // 15 MB free is enough for one 1 MB candidate with 10 MB headroom...
        let ctl = controller(budget, 15 * BYTES_PER_MB);
        assert_eq!(
            ctl.admit(BYTES_PER_MB, &quiet_day(), &idle_run()),
            Admission::Admitted
        );
        // ...but not when 5 MB of admitted work is still in flight
        let busy = RunView {
            pending_files: 5,
            pending_bytes: 5 * BYTES_PER_MB,
            ..Default::default()
        };
        assert_eq!(
            ctl.admit(BYTES_PER_MB, &quiet_day(), &busy),
            Admission::Rejected(ThrottleReason::NoSpaceDest)
        );
    }

    #[test]
    fn test_daily_file_cap() {
        let budget = ThrottleBudget {
            enabled: true,
            max_files_per_day: 3,
            ..Default::default()
        };
        let ctl = controller(budget, 0);
        let day = DailySnapshot {
            terminal_files: 3,
            ..Default::default()
        };
        assert_eq!(
            ctl.admit(1, &day, &idle_run()),
            Admission::Rejected(ThrottleReason::DailyFileCap)
        );
        let day = DailySnapshot {
            terminal_files: 2,
            ..Default::default()
        };
        assert_eq!(ctl.admit(1, &day, &idle_run()), Admission::Admitted);
    }

    #[test]
    fn test_daily_byte_cap_counts_pending_and_candidate() {
        let budget = ThrottleBudget {
            enabled: true,
            max_volume_per_day_mb: 10,
            ..Default::default()
        };
        let ctl = controller(budget, 0);
        let day = DailySnapshot {
            terminal_bytes: 6 * BYTES_PER_MB,
            ..Default::default()
        };
        let run = RunView {
            pending_bytes: 3 * BYTES_PER_MB,
            pending_files: 3,
            ..Default::default()
        };
        assert_eq!(ctl.admit(BYTES_PER_MB, &day, &run), Admission::Admitted);
        assert_eq!(
            ctl.admit(2 * BYTES_PER_MB, &day, &run),
            Admission::Rejected(ThrottleReason::DailyByteCap)
        );
    }

    #[test]
    fn test_run_caps() {
        let budget = ThrottleBudget {
            enabled: true,
            max_files_per_run: 2,
            max_volume_per_run_mb: 4,
            ..Default::default()
        };
        let ctl = controller(budget, 0);
        let run = RunView {
            completed_files: 1,
            completed_bytes: BYTES_PER_MB,
            pending_files: 1,
            pending_bytes: BYTES_PER_MB,
        };
        assert_eq!(
            ctl.admit(1, &quiet_day(), &run),
            Admission::Rejected(ThrottleReason::RunFileCap)
        );

        let run = RunView {
            completed_files: 1,
            completed_bytes: 2 * BYTES_PER_MB,
            pending_files: 0,
            pending_bytes: 0,
        };
        assert_eq!(
            ctl.admit(3 * BYTES_PER_MB, &quiet_day(), &run),
            Admission::Rejected(ThrottleReason::RunByteCap)
        );
        assert_eq!(
            ctl.admit(2 * BYTES_PER_MB, &quiet_day(), &run),
            Admission::Admitted
        );
    }

    #[test]
    fn test_zero_caps_are_disabled() {
        let budget = ThrottleBudget {
            enabled: true,
            ..Default::default()
        };
        let ctl = controller(budget, 0);
        let day = DailySnapshot {
            terminal_files: 1_000_000,
            terminal_bytes: u64::MAX / 2,
            ..Default::default()
        };
        assert_eq!(ctl.admit(BYTES_PER_MB, &day, &idle_run()), Admission::Admitted);
    }
}
