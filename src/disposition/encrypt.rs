//! Hazard-archive encryption
//!
//! Suspect files are encrypted with the operator's public key before they are
//! stored. The cryptography itself stays external: the production
//! implementation drives the `gpg` binary with an explicit argument vector.
//! The trait seam exists so tests can archive without a keyring.

use anyhow::{Context, Result, bail};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

pub trait Encryptor: Send + Sync {
    /// Encrypt `input` to `output`. On error no partial `output` remains.
    fn encrypt(&self, input: &Path, output: &Path) -> Result<()>;
}

/// Encrypts with `gpg` against a public key file. `--recipient-file` keeps
/// the operator's keyring out of the picture entirely.
pub struct GpgEncryptor {
    key_path: PathBuf,
}

impl GpgEncryptor {
    pub fn new(key_path: PathBuf) -> Self {
        Self { key_path }
    }
}

impl Encryptor for GpgEncryptor {
    fn encrypt(&self, input: &Path, output: &Path) -> Result<()> {
        let result = Command::new("gpg")
            .args(["--batch", "--yes", "--trust-model", "always"])
            .arg("--recipient-file")
            .arg(&self.key_path)
            .arg("--output")
            .arg(output)
            .arg("--encrypt")
            .arg(input)
            .output()
            .context("Failed to run gpg")?;

        if !result.status.success() {
            if output.exists() {
                let _ = fs::remove_file(output);
            }
            bail!(
                "gpg encryption failed with code {:?}: {}",
                result.status.code(),
                String::from_utf8_lossy(&result.stderr).trim()
            );
        }
        debug!(input = %input.display(), output = %output.display(), "File encrypted");
        Ok(())
    }
}
