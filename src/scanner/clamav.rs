//! ClamAV scanner
//!
//! Uses `clamdscan` against the resident daemon. Unlike mdatp, clamdscan has
//! a stable exit-code contract: 0 clean, 1 virus found, 2 error.

use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};

use super::exec::run_with_timeout;
use super::{ScanVerdict, Scanner};

pub const CLAMAV_COMMAND: &str = "clamdscan";

pub struct ClamAvScanner;

impl Scanner for ClamAvScanner {
    fn name(&self) -> &'static str {
        "clamav"
    }

    fn scan(&self, path: &Path, timeout: Option<Duration>) -> ScanVerdict {
        if !path.exists() {
            return ScanVerdict::NotFound;
        }

        let mut cmd = Command::new(CLAMAV_COMMAND);
        cmd.args(["--fdpass", "--no-summary"]).arg(path);

        let output = match run_with_timeout(cmd, timeout) {
            Ok(output) => output,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Failed to run clamav scan");
                return ScanVerdict::ScanFailed;
            }
        };
        if output.timed_out {
            warn!(file = %path.display(), "ClamAV scan timed out");
            return ScanVerdict::Timeout;
        }

        let verdict = match output.exit_code {
            Some(0) => ScanVerdict::Clean,
            Some(1) => ScanVerdict::Suspect,
            code => {
                warn!(
                    file = %path.display(),
                    exit_code = ?code,
                    stderr = %output.stderr.trim(),
                    "ClamAV scan failed"
                );
                ScanVerdict::ScanFailed
            }
        };
        debug!(file = %path.display(), ?verdict, "ClamAV scan finished");
        verdict
    }
}

/// First line of `clamdscan --version`, e.g. `ClamAV 1.3.1/...`.
pub fn clamav_version() -> anyhow::Result<String> {
    let output = Command::new(CLAMAV_COMMAND)
        .arg("--version")
        .output()
        .map_err(|e| anyhow::anyhow!("Failed to run clamdscan --version: {e}"))?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .next()
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .ok_or_else(|| anyhow::anyhow!("clamdscan --version produced no output"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_short_circuits_to_not_found() {
        let scanner = ClamAvScanner;
        assert_eq!(
            scanner.scan(Path::new("/nonexistent/definitely-not-here"), None),
            ScanVerdict::NotFound
        );
    }
}
