//! Microsoft Defender (mdatp) scanner
//!
//! The verdict is derived from the process output text, not the exit code:
//! mdatp exits 0 even when threats are found. Matching rules are ordered and
//! the first match wins; anything unrecognized is a scan failure, never a
//! pass.

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

use super::exec::run_with_timeout;
use super::{ScanVerdict, Scanner};

pub const DEFENDER_COMMAND: &str = "mdatp";

pub struct DefenderScanner;

impl Scanner for DefenderScanner {
    fn name(&self) -> &'static str {
        "defender"
    }

    fn scan(&self, path: &Path, timeout: Option<Duration>) -> ScanVerdict {
        let mut cmd = Command::new(DEFENDER_COMMAND);
        cmd.args(["scan", "custom", "--path"]).arg(path);

        let output = match run_with_timeout(cmd, timeout) {
            Ok(output) => output,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Failed to run defender scan");
                return ScanVerdict::ScanFailed;
            }
        };
        if output.timed_out {
            warn!(file = %path.display(), "Defender scan timed out");
            return ScanVerdict::Timeout;
        }

        let verdict = parse_defender_output(&output.combined());
        debug!(file = %path.display(), ?verdict, exit_code = ?output.exit_code, "Defender scan finished");
        verdict
    }
}

/// Ordered matching over the scan output. First match wins.
pub fn parse_defender_output(output: &str) -> ScanVerdict {
    if output.contains("Threat(s) found") || output.contains("Threat found:") {
        return ScanVerdict::Suspect;
    }

    let trimmed = output.trim_end();
    if trimmed.ends_with("0 threat(s) detected") {
        return ScanVerdict::Clean;
    }

    if output.contains("does not exist") || output.contains("No such file or directory") {
        return ScanVerdict::NotFound;
    }

    ScanVerdict::ScanFailed
}

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"Product version: ([\d\.]+)").expect("valid regex"))
}

/// Query the installed defender version from `mdatp version`.
pub fn defender_version() -> Result<String> {
    let output = Command::new(DEFENDER_COMMAND)
        .arg("version")
        .output()
        .context("Failed to run mdatp version; Microsoft Defender may not be installed")?;

    if !output.status.success() {
        return Err(anyhow!(
            "mdatp version command failed with code {:?}: {}",
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    version_pattern()
        .captures(&stdout)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| anyhow!("Failed to parse mdatp version from output: {}", stdout.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threats_found_is_suspect() {
        let output = "Scanning /tmp/eicar.txt\nThreat(s) found\n1 threat(s) detected";
        assert_eq!(parse_defender_output(output), ScanVerdict::Suspect);
        assert_eq!(
            parse_defender_output("Threat found: Virus:DOS/EICAR_Test_File"),
            ScanVerdict::Suspect
        );
    }

    #[test]
    fn test_zero_threats_is_clean() {
        let output = "Scanning /tmp/report.pdf\n\t0 threat(s) detected\n";
        assert_eq!(parse_defender_output(output), ScanVerdict::Clean);
    }

    #[test]
    fn test_suspect_wins_over_trailing_zero_count() {
        // Rule order matters: a threat line anywhere overrides a count line
        let output = "Threat(s) found\n0 threat(s) detected";
        assert_eq!(parse_defender_output(output), ScanVerdict::Suspect);
    }

    #[test]
    fn test_nonzero_count_without_threat_line_fails() {
        let output = "Scanning /tmp/file\n3 threat(s) detected";
        assert_eq!(parse_defender_output(output), ScanVerdict::ScanFailed);
    }

    #[test]
    fn test_missing_path_is_not_found() {
        assert_eq!(
            parse_defender_output("Error: path /tmp/gone.txt does not exist"),
            ScanVerdict::NotFound
        );
        assert_eq!(
            parse_defender_output("mdatp: No such file or directory"),
            ScanVerdict::NotFound
        );
    }

    #[test]
    fn test_unrecognized_output_fails() {
        assert_eq!(parse_defender_output(""), ScanVerdict::ScanFailed);
        assert_eq!(
            parse_defender_output("Engine initialization error"),
            ScanVerdict::ScanFailed
        );
    }

    #[test]
    fn test_version_pattern_extracts_dotted_version() {
        let caps = version_pattern()
            .captures("Product version: 101.24082.0004\nEngine: 1.1")
            .unwrap();
        assert_eq!(&caps[1], "101.24082.0004");
    }
}
