//! Command-line interface for Shuttle
//!
//! One-shot invocation: parse flags, merge configuration, run the transfer
//! pipeline once, report, exit. Flags override settings-file values, which
//! override defaults.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info};

mod logging;
mod output;

pub use output::Output;

use crate::config::{CliOverrides, ShuttleConfig};
use crate::error::ShuttleError;
use crate::notify::{Channel, Notifier};
use crate::pipeline::Pipeline;

/// Shuttle - scanned batch file transfer from untrusted sources
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the source directory (untrusted input tree)
    #[arg(long, value_name = "DIR")]
    pub source_path: Option<PathBuf>,

    /// Path to the destination directory (trusted output tree)
    #[arg(long, value_name = "DIR")]
    pub destination_path: Option<PathBuf>,

    /// Path to the quarantine staging directory
    #[arg(long, value_name = "DIR")]
    pub quarantine_path: Option<PathBuf>,

    /// Directory for encrypted suspect-file archives
    #[arg(long, value_name = "DIR", requires = "hazard_encryption_key_path")]
    pub hazard_archive_path: Option<PathBuf>,

    /// Public key file used to encrypt hazard archives
    #[arg(long, value_name = "FILE", requires = "hazard_archive_path")]
    pub hazard_encryption_key_path: Option<PathBuf>,

    /// Directory for per-run log files
    #[arg(long, value_name = "DIR")]
    pub log_path: Option<PathBuf>,

    /// Logging level
    #[arg(long, value_name = "LEVEL", value_parser = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"])]
    pub log_level: Option<String>,

    /// Alternate settings file
    #[arg(long, value_name = "FILE")]
    pub settings_path: Option<PathBuf>,

    /// Single-instance lock file
    #[arg(long, value_name = "FILE")]
    pub lock_file: Option<PathBuf>,

    /// Directory holding the daily processing tracker
    #[arg(long, value_name = "DIR")]
    pub tracking_data_path: Option<PathBuf>,

    /// Defender version ledger file
    #[arg(long, value_name = "FILE")]
    pub ledger_file_path: Option<PathBuf>,

    /// Delete source files once delivery is hash-verified
    #[arg(long)]
    pub delete_source_files_after_copying: bool,

    /// Size of the scan worker pool
    #[arg(long, value_name = "N")]
    pub max_scan_threads: Option<usize>,

    /// Enable on-demand Microsoft Defender scanning
    #[arg(long, overrides_with = "no_on_demand_defender")]
    pub on_demand_defender: bool,

    /// Disable on-demand Microsoft Defender scanning
    #[arg(long, overrides_with = "on_demand_defender")]
    pub no_on_demand_defender: bool,

    /// Enable on-demand ClamAV scanning
    #[arg(long, overrides_with = "no_on_demand_clam_av")]
    pub on_demand_clam_av: bool,

    /// Disable on-demand ClamAV scanning
    #[arg(long, overrides_with = "on_demand_clam_av")]
    pub no_on_demand_clam_av: bool,

    /// Let Microsoft Defender quarantine suspect files itself
    #[arg(long, overrides_with = "no_defender_handles_suspect_files")]
    pub defender_handles_suspect_files: bool,

    /// Do not let Microsoft Defender quarantine suspect files itself
    #[arg(long, overrides_with = "defender_handles_suspect_files")]
    pub no_defender_handles_suspect_files: bool,

    /// Enable throttling of file processing
    #[arg(long, overrides_with = "no_throttle")]
    pub throttle: bool,

    /// Disable throttling of file processing
    #[arg(long, overrides_with = "throttle")]
    pub no_throttle: bool,

    /// Minimum free space (MB) required in each working directory
    #[arg(long, value_name = "MB")]
    pub throttle_free_space_mb: Option<u64>,

    /// Maximum files processed per run (0 = unlimited)
    #[arg(long, value_name = "N")]
    pub throttle_max_file_count_per_run: Option<u64>,

    /// Maximum volume (MB) processed per run (0 = unlimited)
    #[arg(long, value_name = "MB")]
    pub throttle_max_file_volume_per_run_mb: Option<u64>,

    /// Maximum files processed per day (0 = unlimited)
    #[arg(long, value_name = "N")]
    pub throttle_max_file_count_per_day: Option<u64>,

    /// Maximum volume (MB) processed per day (0 = unlimited)
    #[arg(long, value_name = "MB")]
    pub throttle_max_file_volume_per_day_mb: Option<u64>,

    /// Base malware scan timeout in seconds (0 = unlimited)
    #[arg(long, value_name = "SECS")]
    pub malware_scan_timeout_seconds: Option<u64>,

    /// Additional scan timeout per byte, in milliseconds (0 = disabled)
    #[arg(long, value_name = "MS")]
    pub malware_scan_timeout_ms_per_byte: Option<f64>,

    /// Wait between timed-out scan attempts, in seconds
    #[arg(long, value_name = "SECS")]
    pub malware_scan_retry_wait_seconds: Option<u64>,

    /// How many times a timed-out scan is retried
    #[arg(long, value_name = "N")]
    pub malware_scan_retry_count: Option<u32>,

    /// Testing only: admit files regardless of mtime age
    #[arg(long)]
    pub skip_stability_check: bool,

    /// Enable email notifications for errors and hazards
    #[arg(long)]
    pub notify: bool,

    /// Also email the end-of-run summary
    #[arg(long)]
    pub notify_summary: bool,

    /// Default notification recipient
    #[arg(long, value_name = "EMAIL")]
    pub notify_recipient_email: Option<String>,

    /// Recipient for error notifications
    #[arg(long, value_name = "EMAIL")]
    pub notify_recipient_email_error: Option<String>,

    /// Recipient for summary notifications
    #[arg(long, value_name = "EMAIL")]
    pub notify_recipient_email_summary: Option<String>,

    /// Recipient for hazard notifications
    #[arg(long, value_name = "EMAIL")]
    pub notify_recipient_email_hazard: Option<String>,

    /// Sender address for notifications
    #[arg(long, value_name = "EMAIL")]
    pub notify_sender_email: Option<String>,

    /// SMTP server address
    #[arg(long, value_name = "HOST")]
    pub notify_smtp_server: Option<String>,

    /// SMTP server port
    #[arg(long, value_name = "PORT")]
    pub notify_smtp_port: Option<u16>,

    /// SMTP username
    #[arg(long, value_name = "USER")]
    pub notify_username: Option<String>,

    /// SMTP password
    #[arg(long, value_name = "PASS")]
    pub notify_password: Option<String>,

    /// Use TLS for SMTP
    #[arg(long)]
    pub notify_use_tls: bool,
}

impl Cli {
    /// Execute the one-shot transfer run.
    pub fn run(self) -> Result<()> {
        let output = Output::new();

        let overrides = self.overrides();
        let config = ShuttleConfig::from_sources(&overrides, self.settings_path.as_deref())
            .map_err(|e| ShuttleError::Config(format!("{e:#}")))?;

        let _log_guard = logging::init(&config)?;
        info!(version = crate::VERSION, pid = std::process::id(), "Starting Shuttle");

        let shutdown = Arc::new(AtomicBool::new(false));
        {
            let shutdown = Arc::clone(&shutdown);
            ctrlc::set_handler(move || {
                shutdown.store(true, Ordering::SeqCst);
            })
            .map_err(|e| ShuttleError::Config(format!("failed to install signal handler: {e}")))?;
        }

        let notifier = Notifier::from_config(&config.notifications);

        let pipeline = Pipeline::new(config, Arc::clone(&shutdown));
        match pipeline.run() {
            Ok(summary) => {
                summary.render(&output);
                summary.send_notifications(&notifier);
                if shutdown.load(Ordering::SeqCst) {
                    return Err(ShuttleError::Interrupted.into());
                }
                if summary.is_partial() {
                    return Err(ShuttleError::Partial {
                        failed: summary.failed_files,
                    }
                    .into());
                }
                Ok(())
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "Run failed");
                notifier.notify(
                    Channel::Error,
                    "Shuttle run failed",
                    &format!("Shuttle run failed: {e:#}"),
                );
                Err(e)
            }
        }
    }

    /// Flag values as configuration overrides. Boolean flags only override
    /// when given; paired `--no-*` flags allow disabling file-enabled
    /// features from the command line.
    fn overrides(&self) -> CliOverrides {
        fn tri(yes: bool, no: bool) -> Option<bool> {
            match (yes, no) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            }
        }

        CliOverrides {
            source_path: self.source_path.clone(),
            destination_path: self.destination_path.clone(),
            quarantine_path: self.quarantine_path.clone(),
            hazard_archive_path: self.hazard_archive_path.clone(),
            hazard_encryption_key_path: self.hazard_encryption_key_path.clone(),
            log_path: self.log_path.clone(),
            tracking_data_path: self.tracking_data_path.clone(),
            ledger_file_path: self.ledger_file_path.clone(),
            lock_file: self.lock_file.clone(),
            log_level: self.log_level.clone(),
            delete_source_files_after_copying: self
                .delete_source_files_after_copying
                .then_some(true),
            max_scan_threads: self.max_scan_threads,
            on_demand_defender: tri(self.on_demand_defender, self.no_on_demand_defender),
            on_demand_clam_av: tri(self.on_demand_clam_av, self.no_on_demand_clam_av),
            defender_handles_suspect_files: tri(
                self.defender_handles_suspect_files,
                self.no_defender_handles_suspect_files,
            ),
            throttle: tri(self.throttle, self.no_throttle),
            throttle_free_space_mb: self.throttle_free_space_mb,
            throttle_max_file_count_per_run: self.throttle_max_file_count_per_run,
            throttle_max_file_volume_per_run_mb: self.throttle_max_file_volume_per_run_mb,
            throttle_max_file_count_per_day: self.throttle_max_file_count_per_day,
            throttle_max_file_volume_per_day_mb: self.throttle_max_file_volume_per_day_mb,
            malware_scan_timeout_seconds: self.malware_scan_timeout_seconds,
            malware_scan_timeout_ms_per_byte: self.malware_scan_timeout_ms_per_byte,
            malware_scan_retry_wait_seconds: self.malware_scan_retry_wait_seconds,
            malware_scan_retry_count: self.malware_scan_retry_count,
            skip_stability_check: self.skip_stability_check.then_some(true),
            notify: self.notify.then_some(true),
            notify_summary: self.notify_summary.then_some(true),
            notify_recipient_email: self.notify_recipient_email.clone(),
            notify_recipient_email_error: self.notify_recipient_email_error.clone(),
            notify_recipient_email_summary: self.notify_recipient_email_summary.clone(),
            notify_recipient_email_hazard: self.notify_recipient_email_hazard.clone(),
            notify_sender_email: self.notify_sender_email.clone(),
            notify_smtp_server: self.notify_smtp_server.clone(),
            notify_smtp_port: self.notify_smtp_port,
            notify_username: self.notify_username.clone(),
            notify_password: self.notify_password.clone(),
            notify_use_tls: self.notify_use_tls.then_some(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_minimal_invocation() {
        let cli = Cli::parse_from([
            "shuttle",
            "--source-path",
            "/src",
            "--destination-path",
            "/dest",
            "--quarantine-path",
            "/q",
        ]);
        let overrides = cli.overrides();
        assert_eq!(overrides.source_path, Some(PathBuf::from("/src")));
        assert_eq!(overrides.on_demand_defender, None);
        assert_eq!(overrides.throttle, None);
    }

    #[test]
    fn test_hazard_flags_require_each_other() {
        let result = Cli::try_parse_from([
            "shuttle",
            "--hazard-archive-path",
            "/hazard",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_negated_flags_resolve_to_false() {
        let cli = Cli::parse_from(["shuttle", "--no-on-demand-defender", "--throttle"]);
        let overrides = cli.overrides();
        assert_eq!(overrides.on_demand_defender, Some(false));
        assert_eq!(overrides.throttle, Some(true));
    }
}
