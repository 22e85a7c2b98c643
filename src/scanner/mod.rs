//! Scanner abstraction and result normalization
//!
//! Each enabled scanner runs as an external process against the quarantined
//! copy of a file and reports a [`ScanVerdict`]. The [`ScanRunner`] applies
//! the per-file timeout and retry policy, then collapses the per-scanner
//! results into one combined verdict: Suspect if any scanner says Suspect,
//! Clean only if every enabled scanner says Clean, ScanFailed otherwise.

pub mod clamav;
pub mod defender;
pub mod exec;

pub use clamav::ClamAvScanner;
pub use defender::{DefenderScanner, defender_version, parse_defender_output};

use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Normalized outcome of a single scanner invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanVerdict {
    Clean,
    Suspect,
    ScanFailed,
    NotFound,
    Timeout,
}

/// One on-demand malware scanner. Implementations execute an external
/// process with a bounded timeout and parse its output; the simulator used
/// by the test suite is just another implementation of this trait.
pub trait Scanner: Send + Sync {
    fn name(&self) -> &'static str;
    fn scan(&self, path: &Path, timeout: Option<Duration>) -> ScanVerdict;
}

/// Timeout and retry knobs. Zero disables the respective bound.
#[derive(Debug, Clone, Default)]
pub struct ScanPolicy {
    pub base_timeout_secs: u64,
    pub timeout_ms_per_byte: f64,
    pub retry_count: u32,
    pub retry_wait_secs: u64,
}

impl ScanPolicy {
    /// Deadline for one scan attempt of a file of `size_bytes`, or `None`
    /// when both bounds are disabled.
    pub fn timeout_for(&self, size_bytes: u64) -> Option<Duration> {
        let base_ms = self.base_timeout_secs * 1000;
        let per_byte_ms = (self.timeout_ms_per_byte * size_bytes as f64) as u64;
        let total_ms = base_ms + per_byte_ms;
        if total_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(total_ms))
        }
    }
}

/// Result of running every enabled scanner against one file.
#[derive(Debug)]
pub struct ScanOutcome {
    pub verdict: ScanVerdict,
    /// At least one scanner exhausted its retries on timeouts. The
    /// orchestrator treats this as a shutdown signal: timeout storms usually
    /// mean the scanner itself is wedged.
    pub timeout_exhausted: bool,
    /// The file vanished from quarantine during scanning while the defender
    /// is configured to quarantine suspects itself.
    pub removed_by_defender: bool,
    pub per_scanner: Vec<(&'static str, ScanVerdict)>,
}

/// Combined verdict over the enabled scanners. With no scanners enabled this
/// is vacuously Clean; preflight warns loudly about that configuration.
pub fn combine_verdicts(results: &[(&'static str, ScanVerdict)]) -> ScanVerdict {
    if results.iter().any(|(_, v)| *v == ScanVerdict::Suspect) {
        return ScanVerdict::Suspect;
    }
    if results.iter().all(|(_, v)| *v == ScanVerdict::Clean) {
        return ScanVerdict::Clean;
    }
    ScanVerdict::ScanFailed
}

pub struct ScanRunner {
    scanners: Vec<Box<dyn Scanner>>,
    policy: ScanPolicy,
    defender_handles_suspect: bool,
}

impl ScanRunner {
    pub fn new(
        scanners: Vec<Box<dyn Scanner>>,
        policy: ScanPolicy,
        defender_handles_suspect: bool,
    ) -> Self {
        Self {
            scanners,
            policy,
            defender_handles_suspect,
        }
    }

    pub fn scanner_count(&self) -> usize {
        self.scanners.len()
    }

    /// Scan one quarantined file with every enabled scanner.
    pub fn scan(&self, path: &Path, size_bytes: u64) -> ScanOutcome {
        let timeout = self.policy.timeout_for(size_bytes);
        let mut per_scanner = Vec::with_capacity(self.scanners.len());
        let mut timeout_exhausted = false;

        for scanner in &self.scanners {
            let verdict = self.scan_with_retry(scanner.as_ref(), path, timeout);
            if verdict == ScanVerdict::Timeout {
                timeout_exhausted = true;
            }
            per_scanner.push((scanner.name(), verdict));
        }

        let mut verdict = combine_verdicts(&per_scanner);

        // When the defender quarantines suspects itself, the file being gone
        // after a scan is a detection, not an error
        let removed_by_defender = self.defender_handles_suspect && !path.exists();
        if removed_by_defender {
            info!(file = %path.display(), "File removed during scan; treating as defender-handled suspect");
            verdict = ScanVerdict::Suspect;
        }

        ScanOutcome {
            verdict,
            timeout_exhausted,
            removed_by_defender,
            per_scanner,
        }
    }

    fn scan_with_retry(
        &self,
        scanner: &dyn Scanner,
        path: &Path,
        timeout: Option<Duration>,
    ) -> ScanVerdict {
        let mut verdict = scanner.scan(path, timeout);
        let mut retries = 0;
        while verdict == ScanVerdict::Timeout && retries < self.policy.retry_count {
            retries += 1;
            warn!(
                scanner = scanner.name(),
                file = %path.display(),
                retry = retries,
                max = self.policy.retry_count,
                "Scan timed out; retrying"
            );
            if self.policy.retry_wait_secs > 0 {
                std::thread::sleep(Duration::from_secs(self.policy.retry_wait_secs));
            }
            verdict = scanner.scan(path, timeout);
        }
        verdict
    }
}
