//! File disposition
//!
//! Applies a scan verdict to the quarantined copy of a file and to its
//! source. Clean files are delivered atomically and verified by hash before
//! the source may be deleted; suspect files are encrypted into the hazard
//! archive (or left to the defender); anything else is a failure that
//! preserves the source for the next run.

pub mod encrypt;

pub use encrypt::{Encryptor, GpgEncryptor};

use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::files;
use crate::scanner::{ScanOutcome, ScanVerdict};
use crate::tracker::FileOutcome;

/// Terminal result of disposing one quarantined file.
#[derive(Debug)]
pub enum DispositionOutcome {
    DeliveredClean {
        destination: PathBuf,
    },
    /// `archive` is `None` when hazard archiving is not configured and the
    /// quarantined copy was discarded instead.
    ArchivedSuspect {
        archive: Option<PathBuf>,
        archive_hash: Option<String>,
    },
    DefenderHandled,
    Failed {
        reason: String,
    },
}

impl DispositionOutcome {
    /// The tracker bucket this outcome lands in.
    pub fn tracker_outcome(&self) -> FileOutcome {
        match self {
            DispositionOutcome::DeliveredClean { .. } => FileOutcome::Completed,
            DispositionOutcome::ArchivedSuspect { .. } | DispositionOutcome::DefenderHandled => {
                FileOutcome::Suspect
            }
            DispositionOutcome::Failed { .. } => FileOutcome::Failed,
        }
    }

    pub fn details(&self) -> Option<String> {
        match self {
            DispositionOutcome::DeliveredClean { destination } => {
                Some(format!("delivered to {}", destination.display()))
            }
            DispositionOutcome::ArchivedSuspect {
                archive: Some(archive),
                ..
            } => Some(format!("archived to {}", archive.display())),
            DispositionOutcome::ArchivedSuspect { archive: None, .. } => {
                Some("suspect discarded (hazard archiving not configured)".to_string())
            }
            DispositionOutcome::DefenderHandled => Some("handled by defender".to_string()),
            DispositionOutcome::Failed { reason } => Some(reason.clone()),
        }
    }
}

/// Hazard-archive settings, present only when archiving is configured.
pub struct HazardArchive {
    pub path: PathBuf,
    pub encryptor: Box<dyn Encryptor>,
}

pub struct DispositionHandler {
    destination_root: PathBuf,
    hazard: Option<HazardArchive>,
    delete_source: bool,
}

impl DispositionHandler {
    pub fn new(
        destination_root: PathBuf,
        hazard: Option<HazardArchive>,
        delete_source: bool,
    ) -> Self {
        Self {
            destination_root,
            hazard,
            delete_source,
        }
    }

    /// Apply the combined scan outcome to one quarantined file.
    ///
    /// `quarantine_path` is the scanned copy, `source_path` the original in
    /// the source tree, `rel_path` the path relative to the source root that
    /// determines where a clean file lands in the destination.
    pub fn dispose(
        &self,
        quarantine_path: &Path,
        source_path: &Path,
        rel_path: &Path,
        scan: &ScanOutcome,
    ) -> DispositionOutcome {
        match scan.verdict {
            ScanVerdict::Clean => self.deliver_clean(quarantine_path, source_path, rel_path),
            ScanVerdict::Suspect => {
                self.handle_suspect(quarantine_path, source_path, scan.removed_by_defender)
            }
            ScanVerdict::ScanFailed | ScanVerdict::NotFound | ScanVerdict::Timeout => {
                DispositionOutcome::Failed {
                    reason: format!("scan did not complete cleanly ({:?})", scan.verdict),
                }
            }
        }
    }

    fn deliver_clean(
        &self,
        quarantine_path: &Path,
        source_path: &Path,
        rel_path: &Path,
    ) -> DispositionOutcome {
        let destination = self.destination_root.join(rel_path);

        if let Err(e) = files::copy_temp_then_rename(quarantine_path, &destination) {
            return DispositionOutcome::Failed {
                reason: format!("copy to destination failed: {e:#}"),
            };
        }

        // The delivered bytes must match what is in the source tree right
        // now; only a verified destination justifies deleting the source
        match files::verify_file_integrity(source_path, &destination) {
            Ok(check) if check.matches => {}
            Ok(_) => {
                let _ = fs::remove_file(&destination);
                return DispositionOutcome::Failed {
                    reason: format!(
                        "integrity verification failed for {}",
                        destination.display()
                    ),
                };
            }
            Err(e) => {
                let _ = fs::remove_file(&destination);
                return DispositionOutcome::Failed {
                    reason: format!("integrity verification errored: {e:#}"),
                };
            }
        }

        if self.delete_source {
            files::remove_file_with_logging(source_path);
        }

        info!(destination = %destination.display(), "Delivered clean file");
        DispositionOutcome::DeliveredClean { destination }
    }

    fn handle_suspect(
        &self,
        quarantine_path: &Path,
        source_path: &Path,
        removed_by_defender: bool,
    ) -> DispositionOutcome {
        if removed_by_defender {
            // The defender already quarantined the file on its own terms; it
            // acted on the source too, so nothing here may touch it
            info!(file = %quarantine_path.display(), "Suspect already handled by defender");
            return DispositionOutcome::DefenderHandled;
        }

        let Some(hazard) = &self.hazard else {
            warn!(
                file = %quarantine_path.display(),
                "Hazard archiving not configured; discarding quarantined suspect"
            );
            files::remove_file_with_logging(quarantine_path);
            return DispositionOutcome::ArchivedSuspect {
                archive: None,
                archive_hash: None,
            };
        };

        let source_hash = match files::file_hash(quarantine_path) {
            Ok(hash) => hash,
            Err(e) => {
                return DispositionOutcome::Failed {
                    reason: format!("failed to hash suspect file: {e:#}"),
                };
            }
        };

        let archive_path = hazard.path.join(archive_name(quarantine_path));
        if let Err(e) = fs::create_dir_all(&hazard.path) {
            return DispositionOutcome::Failed {
                reason: format!("failed to create hazard archive directory: {e}"),
            };
        }

        if let Err(e) = hazard.encryptor.encrypt(quarantine_path, &archive_path) {
            // The quarantined copy is retained for later inspection
            error!(file = %quarantine_path.display(), error = %e, "Failed to encrypt suspect file");
            return DispositionOutcome::Failed {
                reason: format!("encryption failed: {e:#}"),
            };
        }

        let archive_hash = match files::file_hash(&archive_path) {
            Ok(hash) => hash,
            Err(e) => {
                return DispositionOutcome::Failed {
                    reason: format!("failed to hash archive: {e:#}"),
                };
            }
        };

        files::remove_file_with_logging(quarantine_path);
        if self.delete_source {
            files::remove_file_with_logging(source_path);
        }

        info!(
            archive = %archive_path.display(),
            source_hash,
            archive_hash,
            "Suspect file archived and encrypted"
        );
        DispositionOutcome::ArchivedSuspect {
            archive: Some(archive_path),
            archive_hash: Some(archive_hash),
        }
    }
}

/// `<YYYYMMDDhhmmss>_<original name>.gpg`
fn archive_name(quarantine_path: &Path) -> String {
    let original = quarantine_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    format!("{}_{}.gpg", Local::now().format("%Y%m%d%H%M%S"), original)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::ScanVerdict;
    use anyhow::bail;
    use std::fs;
    use tempfile::TempDir;

    struct CopyEncryptor;

    impl Encryptor for CopyEncryptor {
        fn encrypt(&self, input: &Path, output: &Path) -> anyhow::Result<()> {
            fs::copy(input, output)?;
            Ok(())
        }
    }

    struct FailingEncryptor;

    impl Encryptor for FailingEncryptor {
        fn encrypt(&self, _input: &Path, _output: &Path) -> anyhow::Result<()> {
            bail!("no key material")
        }
    }

    fn scan_outcome(verdict: ScanVerdict, removed_by_defender: bool) -> ScanOutcome {
        ScanOutcome {
            verdict,
            timeout_exhausted: false,
            removed_by_defender,
            per_scanner: vec![],
        }
    }

    struct Fixture {
        _tmp: TempDir,
        source: PathBuf,
        quarantine: PathBuf,
        dest_root: PathBuf,
        hazard_root: PathBuf,
    }

    fn fixture(content: &[u8]) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("source/report.txt");
        let quarantine = tmp.path().join("quarantine/report.txt");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::create_dir_all(quarantine.parent().unwrap()).unwrap();
        fs::write(&source, content).unwrap();
        fs::write(&quarantine, content).unwrap();
        let dest_root = tmp.path().join("dest");
        let hazard_root = tmp.path().join("hazard");
        Fixture {
            source,
            quarantine,
            dest_root,
            hazard_root,
            _tmp: tmp,
        }
    }

    #[test]
    fn test_clean_file_is_delivered_and_source_deleted() {
        let fx = fixture(b"clean content");
        let handler = DispositionHandler::new(fx.dest_root.clone(), None, true);

        let outcome = handler.dispose(
            &fx.quarantine,
            &fx.source,
            Path::new("report.txt"),
            &scan_outcome(ScanVerdict::Clean, false),
        );

        match outcome {
            DispositionOutcome::DeliveredClean { destination } => {
                assert_eq!(fs::read(destination).unwrap(), b"clean content");
            }
            other => panic!("expected DeliveredClean, got {other:?}"),
        }
        assert!(!fx.source.exists());
    }

    #[test]
    fn test_clean_file_source_kept_without_delete_flag() {
        let fx = fixture(b"clean content");
        let handler = DispositionHandler::new(fx.dest_root.clone(), None, false);

        handler.dispose(
            &fx.quarantine,
            &fx.source,
            Path::new("report.txt"),
            &scan_outcome(ScanVerdict::Clean, false),
        );
        assert!(fx.source.exists());
    }

    #[test]
    fn test_source_mutation_fails_verification_and_removes_destination() {
        let fx = fixture(b"original");
        // The source changed after the quarantine copy was taken
        fs::write(&fx.source, b"mutated after enqueue").unwrap();
        let handler = DispositionHandler::new(fx.dest_root.clone(), None, true);

        let outcome = handler.dispose(
            &fx.quarantine,
            &fx.source,
            Path::new("report.txt"),
            &scan_outcome(ScanVerdict::Clean, false),
        );

        assert!(matches!(outcome, DispositionOutcome::Failed { .. }));
        assert!(!fx.dest_root.join("report.txt").exists());
        assert!(fx.source.exists(), "source must survive a failed delivery");
    }

    #[test]
    fn test_suspect_is_archived_not_delivered() {
        let fx = fixture(b"eicar-ish content");
        let handler = DispositionHandler::new(
            fx.dest_root.clone(),
            Some(HazardArchive {
                path: fx.hazard_root.clone(),
                encryptor: Box::new(CopyEncryptor),
            }),
            true,
        );

        let outcome = handler.dispose(
            &fx.quarantine,
            &fx.source,
            Path::new("report.txt"),
            &scan_outcome(ScanVerdict::Suspect, false),
        );

        match outcome {
            DispositionOutcome::ArchivedSuspect {
                archive: Some(archive),
                archive_hash: Some(hash),
            } => {
                assert!(archive.exists());
                let name = archive.file_name().unwrap().to_string_lossy().into_owned();
                assert!(name.ends_with("_report.txt.gpg"), "got {name}");
                assert_eq!(hash, files::file_hash(&archive).unwrap());
            }
            other => panic!("expected ArchivedSuspect, got {other:?}"),
        }
        assert!(!fx.dest_root.join("report.txt").exists());
        assert!(!fx.quarantine.exists());
        assert!(!fx.source.exists());
    }

    #[test]
    fn test_encryption_failure_keeps_quarantine_and_source() {
        let fx = fixture(b"suspect");
        let handler = DispositionHandler::new(
            fx.dest_root.clone(),
            Some(HazardArchive {
                path: fx.hazard_root.clone(),
                encryptor: Box::new(FailingEncryptor),
            }),
            true,
        );

        let outcome = handler.dispose(
            &fx.quarantine,
            &fx.source,
            Path::new("report.txt"),
            &scan_outcome(ScanVerdict::Suspect, false),
        );

        assert!(matches!(outcome, DispositionOutcome::Failed { .. }));
        assert!(fx.quarantine.exists(), "quarantined copy retained for inspection");
        assert!(fx.source.exists());
        assert_eq!(outcome.tracker_outcome(), FileOutcome::Failed);
    }

    #[test]
    fn test_defender_handled_touches_nothing() {
        let fx = fixture(b"suspect");
        fs::remove_file(&fx.quarantine).unwrap();
        let handler = DispositionHandler::new(
            fx.dest_root.clone(),
            Some(HazardArchive {
                path: fx.hazard_root.clone(),
                encryptor: Box::new(CopyEncryptor),
            }),
            true,
        );

        let outcome = handler.dispose(
            &fx.quarantine,
            &fx.source,
            Path::new("report.txt"),
            &scan_outcome(ScanVerdict::Suspect, true),
        );

        assert!(matches!(outcome, DispositionOutcome::DefenderHandled));
        assert!(fx.source.exists(), "defender acted on source; we must not");
        assert!(!fx.hazard_root.exists());
        assert_eq!(outcome.tracker_outcome(), FileOutcome::Suspect);
    }

    #[test]
    fn test_failed_scan_is_failed_disposition() {
        let fx = fixture(b"content");
        let handler = DispositionHandler::new(fx.dest_root.clone(), None, true);
        let outcome = handler.dispose(
            &fx.quarantine,
            &fx.source,
            Path::new("report.txt"),
            &scan_outcome(ScanVerdict::Timeout, false),
        );
        assert!(matches!(outcome, DispositionOutcome::Failed { .. }));
        assert!(fx.source.exists());
        assert!(!fx.dest_root.exists());
    }
}
