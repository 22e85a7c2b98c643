//! Daily processing tracker
//!
//! A durable, append-mostly record of every file's progress for the current
//! local day. The tracker is the single home of `pending` counts: a file is
//! recorded when it enters quarantine and moved to exactly one terminal
//! bucket when its disposition completes, so an interrupted run can never
//! silently lose a file.
//!
//! Persistence is a YAML document written via temp-sibling + fsync + rename
//! after every mutation. Totals are recomputed from the per-file records on
//! load, so a stale `totals` section from an older process cannot drift the
//! accounting.

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Schema version written to every tracker document. Unknown versions are
/// rejected loudly rather than guessed at.
pub const TRACKER_SCHEMA_VERSION: u32 = 1;

/// Default tracker file name under the tracking data directory.
pub const TRACKER_FILE_NAME: &str = "daily_processing_tracker.yaml";

/// Lifecycle state of one tracked file. `Pending` is the only non-terminal
/// state; terminal records are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOutcome {
    Pending,
    Completed,
    Failed,
    Suspect,
}

impl FileOutcome {
    pub fn is_terminal(self) -> bool {
        self != FileOutcome::Pending
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: u64,
    pub source_path: String,
    pub size_bytes: u64,
    pub enqueued_at: DateTime<Local>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Local>>,
    pub outcome: FileOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// File and byte counts for one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketTotals {
    pub files: u64,
    pub bytes: u64,
}

impl BucketTotals {
    fn add(&mut self, bytes: u64) {
        self.files += 1;
        self.bytes += bytes;
    }

    fn remove(&mut self, bytes: u64) {
        self.files = self.files.saturating_sub(1);
        self.bytes = self.bytes.saturating_sub(bytes);
    }
}

/// Totals for the day, one bucket per lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub pending: BucketTotals,
    pub completed: BucketTotals,
    pub failed: BucketTotals,
    pub suspect: BucketTotals,
}

impl Totals {
    fn bucket_mut(&mut self, outcome: FileOutcome) -> &mut BucketTotals {
        match outcome {
            FileOutcome::Pending => &mut self.pending,
            FileOutcome::Completed => &mut self.completed,
            FileOutcome::Failed => &mut self.failed,
            FileOutcome::Suspect => &mut self.suspect,
        }
    }

    pub fn enqueued_files(&self) -> u64 {
        self.pending.files + self.completed.files + self.failed.files + self.suspect.files
    }
}

/// Snapshot of the day's accounting consumed by the throttle controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DailySnapshot {
    pub terminal_files: u64,
    pub terminal_bytes: u64,
    pub pending_files: u64,
    pub pending_bytes: u64,
}

/// Per-run projection over the daily tracker. The daily tracker is the
/// single source of truth; this view exists so per-run caps can be enforced
/// without a second set of counters drifting out of sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunView {
    pub completed_files: u64,
    pub completed_bytes: u64,
    pub pending_files: u64,
    pub pending_bytes: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct TrackerDocument {
    #[serde(default = "default_schema_version")]
    schema_version: u32,
    date: NaiveDate,
    totals: Totals,
    files: Vec<FileRecord>,
}

fn default_schema_version() -> u32 {
    TRACKER_SCHEMA_VERSION
}

struct Inner {
    doc: TrackerDocument,
    next_id: u64,
    run: RunView,
}

pub struct DailyTracker {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl DailyTracker {
    /// Load the tracker file for today, rolling over a previous day's file
    /// if one is found, or start a fresh document.
    pub fn load_or_create(path: &Path, today: NaiveDate) -> Result<Self> {
        let doc = if path.exists() {
            let loaded = read_document(path)?;
            if loaded.date == today {
                loaded
            } else {
                archive_previous_day(path, &loaded)?;
                carry_forward(loaded, today)
            }
        } else {
            fresh_document(today)
        };

        let next_id = doc.files.iter().map(|r| r.id + 1).max().unwrap_or(1);
        let tracker = Self {
            path: path.to_path_buf(),
            inner: Mutex::new(Inner {
                doc,
                next_id,
                run: RunView::default(),
            }),
        };
        tracker.persist_locked(&tracker.inner.lock().unwrap().doc)?;
        Ok(tracker)
    }

    /// Record a file entering quarantine. Returns the record id used later
    /// by [`complete`](Self::complete).
    pub fn begin(&self, source_path: &Path, size_bytes: u64) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;

        inner.doc.files.push(FileRecord {
            id,
            source_path: source_path.to_string_lossy().into_owned(),
            size_bytes,
            enqueued_at: Local::now(),
            completed_at: None,
            outcome: FileOutcome::Pending,
            details: None,
        });
        inner.doc.totals.pending.add(size_bytes);
        inner.run.pending_files += 1;
        inner.run.pending_bytes += size_bytes;

        self.persist_locked(&inner.doc)?;
        debug!(id, file = %source_path.display(), "Tracker: file pending");
        Ok(id)
    }

    /// Move a pending record to its terminal bucket. The in-memory record is
    /// always updated, even when persistence fails, so the final summary and
    /// logs still account for the file.
    pub fn complete(&self, id: u64, outcome: FileOutcome, details: Option<String>) -> Result<()> {
        if !outcome.is_terminal() {
            bail!("complete() requires a terminal outcome, got {:?}", outcome);
        }
        let mut inner = self.inner.lock().unwrap();

        let record = inner
            .doc
            .files
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| anyhow!("Tracker record {} not found", id))?;
        if record.outcome.is_terminal() {
            bail!(
                "Tracker record {} already terminal ({:?})",
                id,
                record.outcome
            );
        }

        let size = record.size_bytes;
        record.outcome = outcome;
        record.completed_at = Some(Local::now());
        record.details = details;

        inner.doc.totals.pending.remove(size);
        inner.doc.totals.bucket_mut(outcome).add(size);
        inner.run.pending_files = inner.run.pending_files.saturating_sub(1);
        inner.run.pending_bytes = inner.run.pending_bytes.saturating_sub(size);
        inner.run.completed_files += 1;
        inner.run.completed_bytes += size;

        if let Err(e) = self.persist_locked(&inner.doc) {
            error!(id, error = %e, "Tracker persistence failed; disposition recorded in memory only");
            return Err(e);
        }
        debug!(id, ?outcome, "Tracker: file terminal");
        Ok(())
    }

    /// Consistent snapshot of the day's totals.
    pub fn totals(&self) -> Totals {
        self.inner.lock().unwrap().doc.totals
    }

    /// Snapshot shaped for throttle decisions.
    pub fn daily_snapshot(&self) -> DailySnapshot {
        let inner = self.inner.lock().unwrap();
        let t = &inner.doc.totals;
        DailySnapshot {
            terminal_files: t.completed.files + t.failed.files + t.suspect.files,
            terminal_bytes: t.completed.bytes + t.failed.bytes + t.suspect.bytes,
            pending_files: t.pending.files,
            pending_bytes: t.pending.bytes,
        }
    }

    /// This run's projection (processed + in-flight).
    pub fn run_view(&self) -> RunView {
        self.inner.lock().unwrap().run
    }

    /// On a date change, archive the current document and start a fresh one.
    /// Still-pending records are carried forward: they are real unfinished
    /// work, not noise. Returns whether a rollover happened.
    pub fn rollover_if_new_day(&self, today: NaiveDate) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.doc.date == today {
            return Ok(false);
        }
        info!(
            previous = %inner.doc.date,
            new = %today,
            "Date changed; rolling tracker over"
        );
        archive_previous_day(&self.path, &inner.doc)?;
        let old = std::mem::replace(&mut inner.doc, fresh_document(today));
        inner.doc = carry_forward(old, today);
        self.persist_locked(&inner.doc)?;
        Ok(true)
    }

    /// Flush the current state. Called once at shutdown.
    pub fn finalize(&self) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        self.persist_locked(&inner.doc)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist_locked(&self, doc: &TrackerDocument) -> Result<()> {
        write_document(&self.path, doc)
    }
}

fn fresh_document(date: NaiveDate) -> TrackerDocument {
    TrackerDocument {
        schema_version: TRACKER_SCHEMA_VERSION,
        date,
        totals: Totals::default(),
        files: Vec::new(),
    }
}

/// Build the new day's document from the old one, keeping only records that
/// never reached a terminal state.
fn carry_forward(old: TrackerDocument, today: NaiveDate) -> TrackerDocument {
    let carried: Vec<FileRecord> = old
        .files
        .into_iter()
        .filter(|r| !r.outcome.is_terminal())
        .collect();
    if !carried.is_empty() {
        warn!(
            count = carried.len(),
            "Carrying forward unfinished records from the previous day"
        );
    }
    let mut doc = fresh_document(today);
    for record in carried {
        doc.totals.pending.add(record.size_bytes);
        doc.files.push(record);
    }
    doc
}

fn archive_name(path: &Path, date: NaiveDate) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "daily_processing_tracker".to_string());
    path.with_file_name(format!("{stem}.{date}.yaml"))
}

fn archive_previous_day(path: &Path, doc: &TrackerDocument) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let archived = archive_name(path, doc.date);
    fs::rename(path, &archived)
        .with_context(|| format!("Failed to archive tracker to {}", archived.display()))?;
    info!(archive = %archived.display(), "Archived previous day's tracker");
    Ok(())
}

fn read_document(path: &Path) -> Result<TrackerDocument> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read tracker file {}", path.display()))?;
    let mut doc: TrackerDocument = serde_yml::from_str(&content)
        .with_context(|| format!("Failed to parse tracker file {}", path.display()))?;
    if doc.schema_version != TRACKER_SCHEMA_VERSION {
        bail!(
            "Tracker file {} has unknown schema version {} (expected {})",
            path.display(),
            doc.schema_version,
            TRACKER_SCHEMA_VERSION
        );
    }
    doc.totals = recompute_totals(&doc.files);
    Ok(doc)
}

/// The records are authoritative; the totals section is a convenience for
/// humans reading the file.
fn recompute_totals(files: &[FileRecord]) -> Totals {
    let mut totals = Totals::default();
    for record in files {
        totals.bucket_mut(record.outcome).add(record.size_bytes);
    }
    totals
}

/// Crash-safe write: temp sibling, fsync, rename.
fn write_document(path: &Path, doc: &TrackerDocument) -> Result<()> {
    let content = serde_yml::to_string(doc).context("Failed to serialize tracker")?;
    let temp = path.with_extension("yaml.tmp");
    {
        let mut file = File::create(&temp)
            .with_context(|| format!("Failed to create tracker temp {}", temp.display()))?;
        use std::io::Write;
        file.write_all(content.as_bytes())
            .with_context(|| format!("Failed to write tracker temp {}", temp.display()))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync tracker temp {}", temp.display()))?;
    }
    fs::rename(&temp, path)
        .with_context(|| format!("Failed to rename tracker into place at {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn today() -> NaiveDate {
        Local::now().date_naive()
    }

    fn tracker_in(dir: &TempDir) -> DailyTracker {
        DailyTracker::load_or_create(&dir.path().join(TRACKER_FILE_NAME), today()).unwrap()
    }

    #[test]
    fn test_begin_then_complete_moves_buckets() {
        let tmp = TempDir::new().unwrap();
        let tracker = tracker_in(&tmp);

        let id = tracker.begin(Path::new("/src/a.txt"), 100).unwrap();
        let totals = tracker.totals();
        assert_eq!(totals.pending.files, 1);
        assert_eq!(totals.pending.bytes, 100);

        tracker
            .complete(id, FileOutcome::Completed, None)
            .unwrap();
        let totals = tracker.totals();
        assert_eq!(totals.pending.files, 0);
        assert_eq!(totals.completed.files, 1);
        assert_eq!(totals.completed.bytes, 100);
    }

    #[test]
    fn test_terminal_records_are_immutable() {
        let tmp = TempDir::new().unwrap();
        let tracker = tracker_in(&tmp);
        let id = tracker.begin(Path::new("/src/a.txt"), 1).unwrap();
        tracker.complete(id, FileOutcome::Failed, None).unwrap();
        assert!(tracker.complete(id, FileOutcome::Completed, None).is_err());
    }

    #[test]
    fn test_pending_is_not_a_valid_completion() {
        let tmp = TempDir::new().unwrap();
        let tracker = tracker_in(&tmp);
        let id = tracker.begin(Path::new("/src/a.txt"), 1).unwrap();
        assert!(tracker.complete(id, FileOutcome::Pending, None).is_err());
    }

    #[test]
    fn test_state_survives_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(TRACKER_FILE_NAME);

        {
            let tracker = DailyTracker::load_or_create(&path, today()).unwrap();
            let id = tracker.begin(Path::new("/src/a.txt"), 10).unwrap();
            tracker.complete(id, FileOutcome::Suspect, None).unwrap();
            tracker.begin(Path::new("/src/b.txt"), 20).unwrap();
        }

        let tracker = DailyTracker::load_or_create(&path, today()).unwrap();
        let totals = tracker.totals();
        assert_eq!(totals.suspect.files, 1);
        assert_eq!(totals.pending.files, 1);
        assert_eq!(totals.pending.bytes, 20);
        // A reload starts a new run: the run view must be empty
        assert_eq!(tracker.run_view(), RunView::default());
    }

    #[test]
    fn test_totals_recomputed_from_records_on_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(TRACKER_FILE_NAME);
        let date = today();
        // A document whose totals section drifted from its records
        let doc = format!(
            "schema_version: 1\ndate: {date}\ntotals:\n  pending: {{files: 99, bytes: 9999}}\n  completed: {{files: 0, bytes: 0}}\n  failed: {{files: 0, bytes: 0}}\n  suspect: {{files: 0, bytes: 0}}\nfiles:\n- id: 1\n  source_path: /src/a.txt\n  size_bytes: 7\n  enqueued_at: {}\n  outcome: pending\n",
            Local::now().to_rfc3339()
        );
        fs::write(&path, doc).unwrap();

        let tracker = DailyTracker::load_or_create(&path, date).unwrap();
        let totals = tracker.totals();
        assert_eq!(totals.pending.files, 1);
        assert_eq!(totals.pending.bytes, 7);
    }

    #[test]
    fn test_unknown_schema_version_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(TRACKER_FILE_NAME);
        fs::write(
            &path,
            format!(
                "schema_version: 99\ndate: {}\ntotals:\n  pending: {{files: 0, bytes: 0}}\n  completed: {{files: 0, bytes: 0}}\n  failed: {{files: 0, bytes: 0}}\n  suspect: {{files: 0, bytes: 0}}\nfiles: []\n",
                today()
            ),
        )
        .unwrap();
        assert!(DailyTracker::load_or_create(&path, today()).is_err());
    }

    #[test]
    fn test_rollover_archives_and_carries_pending_forward() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(TRACKER_FILE_NAME);
        let yesterday = today().pred_opt().unwrap();

        let tracker = DailyTracker::load_or_create(&path, yesterday).unwrap();
        let id = tracker.begin(Path::new("/src/done.txt"), 5).unwrap();
        tracker.complete(id, FileOutcome::Completed, None).unwrap();
        tracker.begin(Path::new("/src/unfinished.txt"), 11).unwrap();

        assert!(tracker.rollover_if_new_day(today()).unwrap());
        assert!(!tracker.rollover_if_new_day(today()).unwrap());

        let totals = tracker.totals();
        assert_eq!(totals.completed.files, 0);
        assert_eq!(totals.pending.files, 1);
        assert_eq!(totals.pending.bytes, 11);
        assert!(archive_name(&path, yesterday).exists());
    }

    #[test]
    fn test_conservation_under_concurrent_mutation() {
        let tmp = TempDir::new().unwrap();
        let tracker = Arc::new(tracker_in(&tmp));
        let threads = 4;
        let per_thread = 25;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for i in 0..per_thread {
                        let path = format!("/src/t{t}/f{i}");
                        let id = tracker.begin(Path::new(&path), 3).unwrap();
                        let outcome = match i % 3 {
                            0 => FileOutcome::Completed,
                            1 => FileOutcome::Failed,
                            _ => FileOutcome::Suspect,
                        };
                        tracker.complete(id, outcome, None).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let totals = tracker.totals();
        assert_eq!(totals.enqueued_files(), (threads * per_thread) as u64);
        assert_eq!(totals.pending.files, 0);
        assert_eq!(
            totals.completed.files + totals.failed.files + totals.suspect.files,
            (threads * per_thread) as u64
        );
        let run = tracker.run_view();
        assert_eq!(run.completed_files, (threads * per_thread) as u64);
        assert_eq!(run.pending_files, 0);
    }
}
