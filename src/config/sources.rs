//! Configuration source merging
//!
//! Priority, lowest to highest: embedded defaults, TOML settings file,
//! `SHUTTLE_`-prefixed environment variables, CLI flags.

use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use std::path::{Path, PathBuf};

use super::ShuttleConfig;

/// The pre-standardization daily volume key carried no unit. Configs still
/// using it are rejected rather than guessed at.
const LEGACY_DAILY_VOLUME_KEY: &str = "throttle_max_file_volume_per_day";

/// Values taken from CLI flags. `None` means the flag was not given and the
/// settings file (or default) wins.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub source_path: Option<PathBuf>,
    pub destination_path: Option<PathBuf>,
    pub quarantine_path: Option<PathBuf>,
    pub hazard_archive_path: Option<PathBuf>,
    pub hazard_encryption_key_path: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub tracking_data_path: Option<PathBuf>,
    pub ledger_file_path: Option<PathBuf>,
    pub lock_file: Option<PathBuf>,
    pub log_level: Option<String>,
    pub delete_source_files_after_copying: Option<bool>,
    pub max_scan_threads: Option<usize>,
    pub on_demand_defender: Option<bool>,
    pub on_demand_clam_av: Option<bool>,
    pub defender_handles_suspect_files: Option<bool>,
    pub throttle: Option<bool>,
    pub throttle_free_space_mb: Option<u64>,
    pub throttle_max_file_count_per_run: Option<u64>,
    pub throttle_max_file_volume_per_run_mb: Option<u64>,
    pub throttle_max_file_count_per_day: Option<u64>,
    pub throttle_max_file_volume_per_day_mb: Option<u64>,
    pub malware_scan_timeout_seconds: Option<u64>,
    pub malware_scan_timeout_ms_per_byte: Option<f64>,
    pub malware_scan_retry_wait_seconds: Option<u64>,
    pub malware_scan_retry_count: Option<u32>,
    pub skip_stability_check: Option<bool>,
    pub notify: Option<bool>,
    pub notify_summary: Option<bool>,
    pub notify_recipient_email: Option<String>,
    pub notify_recipient_email_error: Option<String>,
    pub notify_recipient_email_summary: Option<String>,
    pub notify_recipient_email_hazard: Option<String>,
    pub notify_sender_email: Option<String>,
    pub notify_smtp_server: Option<String>,
    pub notify_smtp_port: Option<u16>,
    pub notify_username: Option<String>,
    pub notify_password: Option<String>,
    pub notify_use_tls: Option<bool>,
}

impl ShuttleConfig {
    /// Build the effective configuration from every source. `settings_path`
    /// is the CLI-provided file, falling back to the user's config location.
    pub fn from_sources(
        overrides: &CliOverrides,
        settings_path: Option<&Path>,
    ) -> Result<ShuttleConfig> {
        let mut figment = Figment::from(Serialized::defaults(ShuttleConfig::default()));

        let file = settings_path
            .map(Path::to_path_buf)
            .or_else(default_settings_path);
        if let Some(file) = &file {
            if file.exists() {
                reject_legacy_keys(file)?;
                figment = figment.merge(Toml::file(file));
            } else if settings_path.is_some() {
                // A file named on the command line must exist
                bail!("Settings file not found: {}", file.display());
            }
        }

        figment = figment.merge(Env::prefixed("SHUTTLE_").split("__"));

        let mut config: ShuttleConfig = figment
            .extract()
            .context("Failed to load settings (unknown or mistyped key?)")?;
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(&mut self, cli: &CliOverrides) {
        macro_rules! set {
            ($target:expr, $value:expr) => {
                if let Some(v) = $value.clone() {
                    $target = Some(v);
                }
            };
        }
        macro_rules! set_plain {
            ($target:expr, $value:expr) => {
                if let Some(v) = $value {
                    $target = v;
                }
            };
        }

        set!(self.paths.source_path, cli.source_path);
        set!(self.paths.destination_path, cli.destination_path);
        set!(self.paths.quarantine_path, cli.quarantine_path);
        set!(self.paths.hazard_archive_path, cli.hazard_archive_path);
        set!(
            self.paths.hazard_encryption_key_path,
            cli.hazard_encryption_key_path
        );
        set!(self.paths.log_path, cli.log_path);
        set!(self.paths.tracking_data_path, cli.tracking_data_path);
        set!(self.paths.ledger_file_path, cli.ledger_file_path);
        set!(self.paths.lock_file, cli.lock_file);

        if let Some(level) = &cli.log_level {
            self.logging.log_level = level.clone();
        }

        set_plain!(
            self.settings.delete_source_files_after_copying,
            cli.delete_source_files_after_copying
        );
        set_plain!(self.settings.max_scan_threads, cli.max_scan_threads);
        set_plain!(self.settings.throttle, cli.throttle);
        set_plain!(
            self.settings.throttle_free_space_mb,
            cli.throttle_free_space_mb
        );
        set_plain!(
            self.settings.throttle_max_file_count_per_run,
            cli.throttle_max_file_count_per_run
        );
        set_plain!(
            self.settings.throttle_max_file_volume_per_run_mb,
            cli.throttle_max_file_volume_per_run_mb
        );
        set_plain!(
            self.settings.throttle_max_file_count_per_day,
            cli.throttle_max_file_count_per_day
        );
        set_plain!(
            self.settings.throttle_max_file_volume_per_day_mb,
            cli.throttle_max_file_volume_per_day_mb
        );

        set_plain!(self.scanning.on_demand_defender, cli.on_demand_defender);
        set_plain!(self.scanning.on_demand_clam_av, cli.on_demand_clam_av);
        set_plain!(
            self.scanning.defender_handles_suspect_files,
            cli.defender_handles_suspect_files
        );
        set_plain!(
            self.scanning.malware_scan_timeout_seconds,
            cli.malware_scan_timeout_seconds
        );
        set_plain!(
            self.scanning.malware_scan_timeout_ms_per_byte,
            cli.malware_scan_timeout_ms_per_byte
        );
        set_plain!(
            self.scanning.malware_scan_retry_wait_seconds,
            cli.malware_scan_retry_wait_seconds
        );
        set_plain!(
            self.scanning.malware_scan_retry_count,
            cli.malware_scan_retry_count
        );
        set_plain!(self.scanning.skip_stability_check, cli.skip_stability_check);

        set_plain!(self.notifications.notify, cli.notify);
        set_plain!(self.notifications.notify_summary, cli.notify_summary);
        set!(self.notifications.recipient_email, cli.notify_recipient_email);
        set!(
            self.notifications.recipient_email_error,
            cli.notify_recipient_email_error
        );
        set!(
            self.notifications.recipient_email_summary,
            cli.notify_recipient_email_summary
        );
        set!(
            self.notifications.recipient_email_hazard,
            cli.notify_recipient_email_hazard
        );
        set!(self.notifications.sender_email, cli.notify_sender_email);
        set!(self.notifications.smtp_server, cli.notify_smtp_server);
        set!(self.notifications.smtp_port, cli.notify_smtp_port);
        set!(self.notifications.username, cli.notify_username);
        set!(self.notifications.password, cli.notify_password);
        set_plain!(self.notifications.use_tls, cli.notify_use_tls);
    }
}

fn default_settings_path() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".config/shuttle/config.toml"))
}

/// Fail loudly on the legacy unitless daily-volume key instead of silently
/// ignoring it or misreading its unit.
fn reject_legacy_keys(file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read settings file {}", file.display()))?;
    let value: toml::Value = content
        .parse()
        .with_context(|| format!("Failed to parse settings file {}", file.display()))?;

    let has_legacy = value
        .get("settings")
        .and_then(|s| s.as_table())
        .is_some_and(|t| t.contains_key(LEGACY_DAILY_VOLUME_KEY));
    if has_legacy {
        bail!(
            "Settings file {} uses the removed key '{}'; use '{}_mb' (megabytes) instead",
            file.display(),
            LEGACY_DAILY_VOLUME_KEY,
            LEGACY_DAILY_VOLUME_KEY
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_settings(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("settings.toml");
        fs::write(&path, content).unwrap();
        path
    }

    fn minimal_overrides() -> CliOverrides {
        CliOverrides {
            source_path: Some(PathBuf::from("/src")),
            destination_path: Some(PathBuf::from("/dest")),
            quarantine_path: Some(PathBuf::from("/quarantine")),
            ..Default::default()
        }
    }

    #[test]
    fn test_file_values_override_defaults() {
        let tmp = TempDir::new().unwrap();
        let path = write_settings(
            &tmp,
            r#"
[settings]
max_scan_threads = 4
throttle = true
throttle_free_space_mb = 512

[scanning]
on_demand_clam_av = true
"#,
        );

        let config = ShuttleConfig::from_sources(&minimal_overrides(), Some(&path)).unwrap();
        assert_eq!(config.settings.max_scan_threads, 4);
        assert!(config.settings.throttle);
        assert_eq!(config.settings.throttle_free_space_mb, 512);
        assert!(config.scanning.on_demand_clam_av);
        // untouched values keep their defaults
        assert!(config.scanning.on_demand_defender);
    }

    #[test]
    fn test_cli_overrides_file() {
        let tmp = TempDir::new().unwrap();
        let path = write_settings(
            &tmp,
            r#"
[settings]
max_scan_threads = 4

[paths]
source_path = "/file/src"
"#,
        );

        let mut overrides = minimal_overrides();
        overrides.max_scan_threads = Some(8);
        let config = ShuttleConfig::from_sources(&overrides, Some(&path)).unwrap();
        assert_eq!(config.settings.max_scan_threads, 8);
        // CLI path beats the file's path
        assert_eq!(config.source_path(), Path::new("/src"));
    }

    #[test]
    fn test_legacy_unitless_key_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = write_settings(
            &tmp,
            r#"
[settings]
throttle_max_file_volume_per_day = 5000
"#,
        );

        let err = ShuttleConfig::from_sources(&minimal_overrides(), Some(&path)).unwrap_err();
        assert!(err.to_string().contains("throttle_max_file_volume_per_day"));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = write_settings(
            &tmp,
            r#"
[settings]
max_scan_treads = 4
"#,
        );
        assert!(ShuttleConfig::from_sources(&minimal_overrides(), Some(&path)).is_err());
    }

    #[test]
    fn test_named_settings_file_must_exist() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope.toml");
        assert!(ShuttleConfig::from_sources(&minimal_overrides(), Some(&missing)).is_err());
    }

    #[test]
    fn test_missing_required_paths_fail_validation() {
        let err = ShuttleConfig::from_sources(&CliOverrides::default(), None);
        // With no HOME config and no flags, required paths are absent
        if std::env::var_os("HOME").is_none()
            || !default_settings_path().map(|p| p.exists()).unwrap_or(false)
        {
            assert!(err.is_err());
        }
    }
}
