//! Configuration management for Shuttle
//!
//! Every option lives exactly once in [`ShuttleConfig`], with its default in
//! the section's `Default` impl. Values are merged from embedded defaults,
//! the TOML settings file, `SHUTTLE_`-prefixed environment variables, and
//! finally CLI flag overrides; [`ShuttleConfig::from_sources`] is the single
//! constructor.

mod sources;

pub use sources::CliOverrides;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::scanner::ScanPolicy;
use crate::throttle::ThrottleBudget;

pub const DEFAULT_LOCK_FILE: &str = "/tmp/shuttle.lock";

/// Main configuration structure for Shuttle
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct ShuttleConfig {
    /// Source, destination, quarantine and bookkeeping locations
    pub paths: PathsConfig,

    /// Transfer behavior and throttling caps
    pub settings: SettingsConfig,

    /// Scanner selection, timeouts and retries
    pub scanning: ScanningConfig,

    /// Log destination and verbosity
    pub logging: LoggingConfig,

    /// Email notification settings
    pub notifications: NotificationsConfig,
}

/// Filesystem locations used by the pipeline
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct PathsConfig {
    /// Untrusted input tree
    pub source_path: Option<PathBuf>,

    /// Trusted output tree
    pub destination_path: Option<PathBuf>,

    /// Staging area owned exclusively by the running instance
    pub quarantine_path: Option<PathBuf>,

    /// Encrypted store for suspect files; requires the encryption key
    pub hazard_archive_path: Option<PathBuf>,

    /// Public key file used to encrypt hazard archives
    pub hazard_encryption_key_path: Option<PathBuf>,

    /// Directory for per-run log files
    pub log_path: Option<PathBuf>,

    /// Directory holding the daily processing tracker
    pub tracking_data_path: Option<PathBuf>,

    /// Defender version ledger; when set, untested scanner versions refuse to run
    pub ledger_file_path: Option<PathBuf>,

    /// Single-instance lock file
    pub lock_file: Option<PathBuf>,
}

/// Transfer behavior and throttling caps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SettingsConfig {
    /// Delete source files once their delivery has been hash-verified
    pub delete_source_files_after_copying: bool,

    /// Size of the scan worker pool
    pub max_scan_threads: usize,

    /// Master switch for admission control
    pub throttle: bool,

    /// Minimum free space (MB) required in destination, quarantine and
    /// hazard directories; 0 disables the check
    pub throttle_free_space_mb: u64,

    /// Per-run file count cap; 0 disables
    pub throttle_max_file_count_per_run: u64,

    /// Per-run volume cap in MB; 0 disables
    pub throttle_max_file_volume_per_run_mb: u64,

    /// Daily file count cap; 0 disables
    pub throttle_max_file_count_per_day: u64,

    /// Daily volume cap in MB; 0 disables
    pub throttle_max_file_volume_per_day_mb: u64,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            delete_source_files_after_copying: false,
            max_scan_threads: 1,
            throttle: false,
            throttle_free_space_mb: 100,
            throttle_max_file_count_per_run: 1000,
            throttle_max_file_volume_per_run_mb: 1024,
            throttle_max_file_count_per_day: 0,
            throttle_max_file_volume_per_day_mb: 0,
        }
    }
}

/// Scanner selection, timeouts and retries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ScanningConfig {
    /// Scan with Microsoft Defender (mdatp)
    pub on_demand_defender: bool,

    /// Scan with ClamAV (clamdscan)
    pub on_demand_clam_av: bool,

    /// The defender quarantines suspect files itself; a file vanishing
    /// during scan is a detection, not an error
    pub defender_handles_suspect_files: bool,

    /// Base scan timeout in seconds; 0 disables
    pub malware_scan_timeout_seconds: u64,

    /// Additional timeout per byte of file size, in milliseconds; 0 disables
    pub malware_scan_timeout_ms_per_byte: f64,

    /// Wait between timed-out scan attempts, in seconds
    pub malware_scan_retry_wait_seconds: u64,

    /// How many times a timed-out scan is retried before giving up
    pub malware_scan_retry_count: u32,

    /// Minimum age (seconds) of a file's mtime before it is admitted
    pub stability_window_seconds: u64,

    /// Testing only: admit files regardless of mtime age
    pub skip_stability_check: bool,
}

impl Default for ScanningConfig {
    fn default() -> Self {
        Self {
            on_demand_defender: true,
            on_demand_clam_av: false,
            defender_handles_suspect_files: true,
            malware_scan_timeout_seconds: 300,
            malware_scan_timeout_ms_per_byte: 0.0,
            malware_scan_retry_wait_seconds: 30,
            malware_scan_retry_count: 3,
            stability_window_seconds: crate::gate::DEFAULT_STABILITY_WINDOW_SECS,
            skip_stability_check: false,
        }
    }
}

/// Log destination and verbosity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    /// One of DEBUG, INFO, WARNING, ERROR, CRITICAL
    pub log_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
        }
    }
}

/// Email notification settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct NotificationsConfig {
    /// Master switch; error and hazard notifications require it
    pub notify: bool,

    /// Also send the end-of-run summary
    pub notify_summary: bool,

    /// Default recipient for all channels
    pub recipient_email: Option<String>,

    /// Channel-specific recipients, each falling back to the default
    pub recipient_email_error: Option<String>,
    pub recipient_email_summary: Option<String>,
    pub recipient_email_hazard: Option<String>,

    pub sender_email: Option<String>,
    pub smtp_server: Option<String>,
    pub smtp_port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
}

impl ShuttleConfig {
    /// Required path accessors; `validate` guarantees these are present.
    pub fn source_path(&self) -> &Path {
        self.paths.source_path.as_deref().expect("validated")
    }

    pub fn destination_path(&self) -> &Path {
        self.paths.destination_path.as_deref().expect("validated")
    }

    pub fn quarantine_path(&self) -> &Path {
        self.paths.quarantine_path.as_deref().expect("validated")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.paths
            .lock_file
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_LOCK_FILE))
    }

    /// Hazard archiving is configured when both the archive path and the
    /// encryption key are present.
    pub fn hazard_archiving_enabled(&self) -> bool {
        self.paths.hazard_archive_path.is_some() && self.paths.hazard_encryption_key_path.is_some()
    }

    /// Where the daily tracker lives: the tracking directory when set,
    /// otherwise next to the logs, otherwise the current directory.
    pub fn tracker_file_path(&self) -> PathBuf {
        let dir = self
            .paths
            .tracking_data_path
            .clone()
            .or_else(|| self.paths.log_path.clone())
            .unwrap_or_else(|| PathBuf::from("."));
        dir.join(crate::tracker::TRACKER_FILE_NAME)
    }

    pub fn throttle_budget(&self) -> ThrottleBudget {
        ThrottleBudget {
            enabled: self.settings.throttle,
            min_free_space_mb: self.settings.throttle_free_space_mb,
            max_files_per_run: self.settings.throttle_max_file_count_per_run,
            max_volume_per_run_mb: self.settings.throttle_max_file_volume_per_run_mb,
            max_files_per_day: self.settings.throttle_max_file_count_per_day,
            max_volume_per_day_mb: self.settings.throttle_max_file_volume_per_day_mb,
        }
    }

    pub fn scan_policy(&self) -> ScanPolicy {
        ScanPolicy {
            base_timeout_secs: self.scanning.malware_scan_timeout_seconds,
            timeout_ms_per_byte: self.scanning.malware_scan_timeout_ms_per_byte,
            retry_count: self.scanning.malware_scan_retry_count,
            retry_wait_secs: self.scanning.malware_scan_retry_wait_seconds,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.paths.source_path.is_none() {
            bail!("source_path must be provided (flag or settings file)");
        }
        if self.paths.destination_path.is_none() {
            bail!("destination_path must be provided (flag or settings file)");
        }
        if self.paths.quarantine_path.is_none() {
            bail!("quarantine_path must be provided (flag or settings file)");
        }

        if self.paths.hazard_archive_path.is_some() != self.paths.hazard_encryption_key_path.is_some()
        {
            bail!(
                "hazard_archive_path and hazard_encryption_key_path must be provided together"
            );
        }

        if self.settings.max_scan_threads == 0 {
            bail!("max_scan_threads must be at least 1");
        }

        let level = self.logging.log_level.to_uppercase();
        if !["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"].contains(&level.as_str()) {
            bail!("log_level must be one of DEBUG, INFO, WARNING, ERROR, CRITICAL");
        }

        if self.notifications.notify || self.notifications.notify_summary {
            if self.notifications.smtp_server.is_none() {
                bail!("notifications require smtp_server");
            }
            if self.notifications.sender_email.is_none() {
                bail!("notifications require sender_email");
            }
            if self.notifications.recipient_email.is_none()
                && self.notifications.recipient_email_error.is_none()
                && self.notifications.recipient_email_summary.is_none()
                && self.notifications.recipient_email_hazard.is_none()
            {
                bail!("notifications require at least one recipient address");
            }
        }

        Ok(())
    }
}
