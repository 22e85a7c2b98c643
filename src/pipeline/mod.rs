//! Pipeline orchestrator
//!
//! Glues the gate, throttle, tracker, scanners and disposition together:
//! preflight, then enumerate the source tree into quarantine while a worker
//! pool scans and disposes, then drain, clean up and summarize. Enumeration
//! runs on its own thread and hands work to a bounded channel; back-pressure
//! comes from the channel being full.

mod lock;
mod preflight;
mod workers;

pub use lock::InstanceLock;

use anyhow::{Result, anyhow};
use chrono::Local;
use crossbeam::channel::{Sender, bounded};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::ShuttleConfig;
use crate::disposition::{DispositionHandler, GpgEncryptor, HazardArchive};
use crate::error::ShuttleError;
use crate::files;
use crate::gate::{Eligibility, StabilityGate};
use crate::report::RunSummary;
use crate::scanner::{ClamAvScanner, DefenderScanner, ScanRunner, Scanner};
use crate::throttle::{Admission, ThrottleController, ThrottleReason};
use crate::tracker::DailyTracker;
use workers::{WorkerContext, worker_loop};

/// One file staged for scanning. Owned by exactly one worker from dequeue to
/// disposition.
pub struct QuarantineItem {
    pub record_id: u64,
    pub quarantine_path: PathBuf,
    pub source_path: PathBuf,
    pub rel_path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Default)]
struct EnumerationStats {
    enqueued: u64,
    skipped_unstable: u64,
    skipped_open: u64,
    skipped_unsafe_name: u64,
    skipped_error: u64,
    throttle_rejection: Option<ThrottleReason>,
    tracker_fatal: bool,
}

impl EnumerationStats {
    fn record_skip(&mut self, eligibility: Eligibility) {
        match eligibility {
            Eligibility::SkipUnstable => self.skipped_unstable += 1,
            Eligibility::SkipOpen => self.skipped_open += 1,
            Eligibility::SkipUnsafeName => self.skipped_unsafe_name += 1,
            Eligibility::SkipError => self.skipped_error += 1,
            Eligibility::Eligible => {}
        }
    }
}

pub struct Pipeline {
    config: ShuttleConfig,
    /// Set by the SIGINT/SIGTERM handler.
    signal: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(config: ShuttleConfig, signal: Arc<AtomicBool>) -> Self {
        Self { config, signal }
    }

    pub fn run(&self) -> Result<RunSummary> {
        let config = &self.config;
        let preflight = preflight::run(config)?;
        let tracker = Arc::clone(&preflight.tracker);

        let mut summary = RunSummary::new();
        summary.scanner_versions = preflight.scanner_versions.clone();

        let gate = StabilityGate::new(
            config.scanning.stability_window_seconds,
            config.scanning.skip_stability_check,
        );
        let throttle = ThrottleController::new(
            config.throttle_budget(),
            config.destination_path().to_path_buf(),
            config.quarantine_path().to_path_buf(),
            config
                .hazard_archiving_enabled()
                .then(|| config.paths.hazard_archive_path.clone().expect("validated")),
        );

        let halt = Arc::new(AtomicBool::new(false));
        let timeout_storm = Arc::new(AtomicBool::new(false));
        let tracker_fatal = Arc::new(AtomicBool::new(false));

        let ctx = WorkerContext {
            runner: ScanRunner::new(
                build_scanners(config),
                config.scan_policy(),
                config.scanning.defender_handles_suspect_files,
            ),
            disposition: DispositionHandler::new(
                config.destination_path().to_path_buf(),
                self.hazard_archive(),
                config.settings.delete_source_files_after_copying,
            ),
            tracker: Arc::clone(&tracker),
            halt: Arc::clone(&halt),
            timeout_storm: Arc::clone(&timeout_storm),
            tracker_fatal: Arc::clone(&tracker_fatal),
        };

        let worker_count = config.settings.max_scan_threads;
        let (work_tx, work_rx) = bounded::<QuarantineItem>(worker_count * 2);
        let (result_tx, result_rx) = bounded::<workers::WorkResult>(worker_count * 4);

        let enum_stats = crossbeam::thread::scope(|s| {
            for _ in 0..worker_count {
                let work_rx = work_rx.clone();
                let result_tx = result_tx.clone();
                let ctx = &ctx;
                s.spawn(move |_| worker_loop(ctx, work_rx, result_tx));
            }

            let producer = {
                let gate = &gate;
                let throttle = &throttle;
                let tracker = &tracker;
                let halt = &halt;
                s.spawn(move |_| self.enumerate(gate, throttle, tracker, halt, work_tx))
            };

            // The collector owns these handles; dropping them here lets the
            // result channel close once the workers finish
            drop(result_tx);
            drop(work_rx);

            while let Ok(result) = result_rx.recv() {
                summary.record_outcome(
                    &result.item.rel_path.to_string_lossy(),
                    result.item.size_bytes,
                    &result.outcome,
                );
            }

            producer.join().expect("enumeration thread panicked")
        })
        .map_err(|_| anyhow!("scan worker thread panicked"))?;

        summary.skipped_unstable = enum_stats.skipped_unstable;
        summary.skipped_open = enum_stats.skipped_open;
        summary.skipped_unsafe_name = enum_stats.skipped_unsafe_name;
        summary.skipped_error = enum_stats.skipped_error;
        summary.timeout_shutdown = timeout_storm.load(Ordering::SeqCst);
        if let Some(reason) = enum_stats.throttle_rejection {
            summary.record_throttle_rejection(reason);
        }

        self.cleanup();

        tracker
            .finalize()
            .map_err(|e| ShuttleError::TrackerPersistence(format!("{e:#}")))?;
        drop(preflight.lock);

        summary.finish();

        if enum_stats.tracker_fatal || tracker_fatal.load(Ordering::SeqCst) {
            return Err(ShuttleError::TrackerPersistence(
                "tracker could not persist during the run".to_string(),
            )
            .into());
        }

        info!(
            enqueued = enum_stats.enqueued,
            attempted = summary.attempted_files,
            delivered = summary.delivered_files,
            suspect = summary.suspect_files,
            failed = summary.failed_files,
            "Run complete"
        );
        Ok(summary)
    }

    /// Walk the source tree in name order, gate and throttle each candidate,
    /// copy admitted files into quarantine and enqueue them.
    fn enumerate(
        &self,
        gate: &StabilityGate,
        throttle: &ThrottleController,
        tracker: &DailyTracker,
        halt: &AtomicBool,
        work_tx: Sender<QuarantineItem>,
    ) -> EnumerationStats {
        let source_root = self.config.source_path();
        let quarantine_root = self.config.quarantine_path();
        let mut stats = EnumerationStats::default();

        let walker = WalkDir::new(source_root)
            .follow_links(false)
            .sort_by_file_name();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Walk error in source tree");
                    stats.skipped_error += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            if self.signal.load(Ordering::SeqCst) {
                halt.store(true, Ordering::SeqCst);
            }
            if halt.load(Ordering::SeqCst) {
                info!("Stopping enumeration; shutdown requested");
                break;
            }

            if let Err(e) = tracker.rollover_if_new_day(Local::now().date_naive()) {
                error!(error = %format!("{e:#}"), "Tracker rollover failed");
                stats.tracker_fatal = true;
                halt.store(true, Ordering::SeqCst);
                break;
            }

            let path = entry.path();
            let rel = path
                .strip_prefix(source_root)
                .expect("walked entries live under the source root");

            let eligibility = gate.check(path, rel);
            if eligibility != Eligibility::Eligible {
                stats.record_skip(eligibility);
                continue;
            }

            let size_bytes = match entry.metadata() {
                Ok(metadata) => metadata.len(),
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Failed to stat file");
                    stats.skipped_error += 1;
                    continue;
                }
            };

            match throttle.admit(size_bytes, &tracker.daily_snapshot(), &tracker.run_view()) {
                Admission::Admitted => {}
                Admission::Rejected(reason) => {
                    // First rejection stops the run: processing a later small
                    // file while an earlier large one waits would break FIFO
                    // fairness
                    warn!(file = %path.display(), %reason, "Throttle rejected candidate; stopping enumeration");
                    stats.throttle_rejection = Some(reason);
                    break;
                }
            }

            let quarantine_path = quarantine_root.join(rel);
            if let Err(e) = files::copy_temp_then_rename(path, &quarantine_path) {
                error!(file = %path.display(), error = %format!("{e:#}"), "Quarantine copy failed");
                stats.skipped_error += 1;
                continue;
            }

            let record_id = match tracker.begin(path, size_bytes) {
                Ok(id) => id,
                Err(e) => {
                    error!(error = %format!("{e:#}"), "Tracker begin failed; stopping run");
                    let _ = std::fs::remove_file(&quarantine_path);
                    stats.tracker_fatal = true;
                    halt.store(true, Ordering::SeqCst);
                    break;
                }
            };

            debug!(file = %rel.display(), size_bytes, "File admitted to quarantine");
            let item = QuarantineItem {
                record_id,
                quarantine_path,
                source_path: path.to_path_buf(),
                rel_path: rel.to_path_buf(),
                size_bytes,
            };
            if work_tx.send(item).is_err() {
                break; // workers gone
            }
            stats.enqueued += 1;
        }

        stats
    }

    fn hazard_archive(&self) -> Option<HazardArchive> {
        if !self.config.hazard_archiving_enabled() {
            return None;
        }
        let path = self
            .config
            .paths
            .hazard_archive_path
            .clone()
            .expect("validated");
        let key = self
            .config
            .paths
            .hazard_encryption_key_path
            .clone()
            .expect("validated");
        Some(HazardArchive {
            path,
            encryptor: Box::new(GpgEncryptor::new(key)),
        })
    }

    /// Empty the quarantine and prune source directories left empty by
    /// deletions.
    fn cleanup(&self) {
        if let Err(e) = files::remove_directory_contents(self.config.quarantine_path()) {
            warn!(error = %format!("{e:#}"), "Failed to empty quarantine directory");
        }
        if self.config.settings.delete_source_files_after_copying {
            files::remove_empty_directories(self.config.source_path(), true);
        }
    }
}

fn build_scanners(config: &ShuttleConfig) -> Vec<Box<dyn Scanner>> {
    let mut scanners: Vec<Box<dyn Scanner>> = Vec::new();
    if config.scanning.on_demand_defender {
        scanners.push(Box::new(DefenderScanner));
    }
    if config.scanning.on_demand_clam_av {
        scanners.push(Box::new(ClamAvScanner));
    }
    scanners
}
