//! End-of-run summary
//!
//! Accumulates per-file outcomes during the run and renders a structured
//! report at the end: counts, bytes, throttle rejections, scanner versions,
//! and the most notable failures. Also fans out to the notification
//! channels.

use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::fmt::Write as _;

use crate::cli::Output;
use crate::disposition::DispositionOutcome;
use crate::notify::{Channel, Notifier};
use crate::throttle::ThrottleReason;

/// How many failures are spelled out in the report; the rest are counted.
const MAX_REPORTED_FAILURES: usize = 10;

#[derive(Debug)]
pub struct RunSummary {
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,

    pub attempted_files: u64,
    pub delivered_files: u64,
    pub delivered_bytes: u64,
    pub suspect_files: u64,
    pub failed_files: u64,

    pub skipped_unstable: u64,
    pub skipped_open: u64,
    pub skipped_unsafe_name: u64,
    pub skipped_error: u64,

    pub throttle_rejections: HashMap<ThrottleReason, u64>,
    /// Enumeration stopped early on a throttle rejection.
    pub throttle_stopped: bool,
    /// A scanner exhausted its timeout retries and forced a shutdown.
    pub timeout_shutdown: bool,

    pub scanner_versions: Vec<(String, String)>,
    pub failures: Vec<(String, String)>,
}

impl RunSummary {
    pub fn new() -> Self {
        let now = Local::now();
        Self {
            started_at: now,
            finished_at: now,
            attempted_files: 0,
            delivered_files: 0,
            delivered_bytes: 0,
            suspect_files: 0,
            failed_files: 0,
            skipped_unstable: 0,
            skipped_open: 0,
            skipped_unsafe_name: 0,
            skipped_error: 0,
            throttle_rejections: HashMap::new(),
            throttle_stopped: false,
            timeout_shutdown: false,
            scanner_versions: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn record_throttle_rejection(&mut self, reason: ThrottleReason) {
        *self.throttle_rejections.entry(reason).or_insert(0) += 1;
        self.throttle_stopped = true;
    }

    pub fn record_outcome(&mut self, rel_path: &str, size_bytes: u64, outcome: &DispositionOutcome) {
        self.attempted_files += 1;
        match outcome {
            DispositionOutcome::DeliveredClean { .. } => {
                self.delivered_files += 1;
                self.delivered_bytes += size_bytes;
            }
            DispositionOutcome::ArchivedSuspect { .. } | DispositionOutcome::DefenderHandled => {
                self.suspect_files += 1;
            }
            DispositionOutcome::Failed { reason } => {
                self.failed_files += 1;
                if self.failures.len() < MAX_REPORTED_FAILURES {
                    self.failures.push((rel_path.to_string(), reason.clone()));
                }
            }
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Local::now();
    }

    /// A run is partial when work was refused or any file failed.
    pub fn is_partial(&self) -> bool {
        self.failed_files > 0 || self.throttle_stopped || self.timeout_shutdown
    }

    pub fn total_skipped(&self) -> u64 {
        self.skipped_unstable + self.skipped_open + self.skipped_unsafe_name + self.skipped_error
    }

    fn duration_secs(&self) -> i64 {
        (self.finished_at - self.started_at).num_seconds()
    }

    pub fn render(&self, output: &Output) {
        output.header("Run summary");
        output.table_row("Started", &self.started_at.format("%Y-%m-%d %H:%M:%S").to_string());
        output.table_row("Duration", &format!("{} s", self.duration_secs()));
        output.table_row("Attempted", &self.attempted_files.to_string());
        output.table_row(
            "Delivered",
            &format!(
                "{} ({:.2} MB)",
                self.delivered_files,
                self.delivered_bytes as f64 / (1024.0 * 1024.0)
            ),
        );
        output.table_row("Suspect", &self.suspect_files.to_string());
        output.table_row("Failed", &self.failed_files.to_string());
        output.table_row("Skipped", &self.total_skipped().to_string());

        for (name, version) in &self.scanner_versions {
            output.table_row(&format!("{name} version"), version);
        }

        if !self.throttle_rejections.is_empty() {
            output.separator();
            for (reason, count) in &self.throttle_rejections {
                output.list_item(&format!("throttled: {reason} ({count})"));
            }
        }

        if !self.failures.is_empty() {
            output.separator();
            output.warning("Failures:");
            for (path, reason) in &self.failures {
                output.list_item(&format!("{path}: {reason}"));
            }
            let unreported = self.failed_files as usize - self.failures.len();
            if unreported > 0 {
                output.list_item(&format!("... and {unreported} more (see log)"));
            }
        }

        output.blank_line();
        if self.is_partial() {
            output.warning("Run finished with unprocessed or failed files");
        } else {
            output.success("Run finished");
        }
    }

    /// Text form used by the notification channels.
    pub fn to_text(&self) -> String {
        let mut text = String::new();
        let _ = writeln!(text, "Shuttle run summary");
        let _ = writeln!(text, "started:   {}", self.started_at.format("%Y-%m-%d %H:%M:%S"));
        let _ = writeln!(text, "duration:  {} s", self.duration_secs());
        let _ = writeln!(text, "attempted: {}", self.attempted_files);
        let _ = writeln!(
            text,
            "delivered: {} ({} bytes)",
            self.delivered_files, self.delivered_bytes
        );
        let _ = writeln!(text, "suspect:   {}", self.suspect_files);
        let _ = writeln!(text, "failed:    {}", self.failed_files);
        let _ = writeln!(text, "skipped:   {}", self.total_skipped());
        for (reason, count) in &self.throttle_rejections {
            let _ = writeln!(text, "throttled: {reason} ({count})");
        }
        for (path, reason) in &self.failures {
            let _ = writeln!(text, "failure:   {path}: {reason}");
        }
        text
    }

    pub fn send_notifications(&self, notifier: &Notifier) {
        if self.suspect_files > 0 {
            notifier.notify(
                Channel::Hazard,
                &format!("Shuttle: {} suspect file(s) detected", self.suspect_files),
                &self.to_text(),
            );
        }
        if self.failed_files > 0 || self.timeout_shutdown {
            notifier.notify(
                Channel::Error,
                &format!("Shuttle: {} file(s) failed", self.failed_files),
                &self.to_text(),
            );
        }
        notifier.notify(Channel::Summary, "Shuttle run summary", &self.to_text());
    }
}

impl Default for RunSummary {
    fn default() -> Self {
        Self::new()
    }
}
