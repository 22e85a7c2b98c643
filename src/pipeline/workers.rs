//! Scan worker pool
//!
//! Fixed-size pool of OS threads consuming quarantined items from a bounded
//! channel. Each worker runs the scanners, applies the disposition, and
//! reports to the tracker before releasing the item. Workers share nothing
//! mutable beyond the tracker and the stop flags.

use crossbeam::channel::{Receiver, Sender};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, warn};

use super::QuarantineItem;
use crate::disposition::{DispositionHandler, DispositionOutcome};
use crate::scanner::ScanRunner;
use crate::tracker::DailyTracker;

pub struct WorkResult {
    pub item: QuarantineItem,
    pub outcome: DispositionOutcome,
}

pub struct WorkerContext {
    pub runner: ScanRunner,
    pub disposition: DispositionHandler,
    pub tracker: Arc<DailyTracker>,
    /// Stop admitting and scanning new items (signal, timeout storm, or
    /// fatal tracker error).
    pub halt: Arc<AtomicBool>,
    /// Set when a scanner exhausts its retries on timeouts.
    pub timeout_storm: Arc<AtomicBool>,
    /// Set when the tracker can no longer persist.
    pub tracker_fatal: Arc<AtomicBool>,
}

impl WorkerContext {
    fn should_stop(&self) -> bool {
        self.halt.load(Ordering::SeqCst)
    }
}

pub fn worker_loop(
    ctx: &WorkerContext,
    work_rx: Receiver<QuarantineItem>,
    result_tx: Sender<WorkResult>,
) {
    while let Ok(item) = work_rx.recv() {
        let outcome = if ctx.should_stop() {
            // Already-quarantined items are failed rather than scanned; the
            // source copy survives and is retried on the next run
            debug!(file = %item.rel_path.display(), "Draining item unscanned due to shutdown");
            DispositionOutcome::Failed {
                reason: "run shut down before this file was scanned".to_string(),
            }
        } else {
            let scan = ctx.runner.scan(&item.quarantine_path, item.size_bytes);
            if scan.timeout_exhausted {
                warn!(
                    file = %item.rel_path.display(),
                    "Scan retries exhausted on timeouts; initiating shutdown"
                );
                ctx.timeout_storm.store(true, Ordering::SeqCst);
                ctx.halt.store(true, Ordering::SeqCst);
            }
            ctx.disposition.dispose(
                &item.quarantine_path,
                &item.source_path,
                &item.rel_path,
                &scan,
            )
        };

        if let Err(e) = ctx
            .tracker
            .complete(item.record_id, outcome.tracker_outcome(), outcome.details())
        {
            error!(
                file = %item.rel_path.display(),
                error = %format!("{e:#}"),
                "Failed to record disposition; stopping run"
            );
            ctx.tracker_fatal.store(true, Ordering::SeqCst);
            ctx.halt.store(true, Ordering::SeqCst);
        }

        if result_tx.send(WorkResult { item, outcome }).is_err() {
            break; // collector gone
        }
    }
}
