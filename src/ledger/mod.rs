//! Defender version ledger
//!
//! The ledger records which versions of the platform malware scanner have
//! passed the detection test suite. The transfer pipeline reads it at
//! preflight and refuses to run against an untested scanner version; only the
//! `shuttle-defender-test` tool writes to it.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

pub const LEDGER_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestResult {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestedVersion {
    pub version: String,
    pub test_time: DateTime<Local>,
    pub test_result: TestResult,
    #[serde(default)]
    pub test_details: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DefenderSection {
    #[serde(default)]
    tested_versions: Vec<TestedVersion>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerDocument {
    #[serde(default = "default_schema_version")]
    schema_version: u32,
    defender: DefenderSection,
}

fn default_schema_version() -> u32 {
    LEDGER_SCHEMA_VERSION
}

impl Default for LedgerDocument {
    fn default() -> Self {
        Self {
            schema_version: LEDGER_SCHEMA_VERSION,
            defender: DefenderSection::default(),
        }
    }
}

fn read_document(path: &Path) -> Result<LedgerDocument> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Ledger file not found at: {}", path.display()))?;
    let doc: LedgerDocument = serde_yml::from_str(&content)
        .with_context(|| format!("Error parsing ledger file {}", path.display()))?;
    if doc.schema_version != LEDGER_SCHEMA_VERSION {
        bail!(
            "Ledger file {} has unknown schema version {} (expected {})",
            path.display(),
            doc.schema_version,
            LEDGER_SCHEMA_VERSION
        );
    }
    Ok(doc)
}

/// Read-only view of the ledger, used at transfer preflight.
pub struct Ledger {
    doc: LedgerDocument,
}

impl Ledger {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self {
            doc: read_document(path)?,
        })
    }

    /// Whether `version` has a passing test entry.
    pub fn is_version_tested(&self, version: &str) -> bool {
        let tested = self
            .doc
            .defender
            .tested_versions
            .iter()
            .any(|t| t.version == version && t.test_result == TestResult::Pass);
        if tested {
            info!(version, "Found matching tested scanner version");
        } else {
            warn!(
                version,
                "Scanner version not found in tested versions or did not pass testing"
            );
        }
        tested
    }
}

/// Read-write variant used only by the defender test tool.
pub struct ReadWriteLedger {
    doc: LedgerDocument,
}

impl ReadWriteLedger {
    /// Load an existing ledger or start an empty one.
    pub fn load_or_new(path: &Path) -> Result<Self> {
        let doc = if path.exists() {
            read_document(path)?
        } else {
            LedgerDocument::default()
        };
        Ok(Self { doc })
    }

    /// Record a test outcome for a scanner version, replacing any previous
    /// entry for the same version.
    pub fn add_tested_version(&mut self, version: &str, result: TestResult, details: &str) {
        let entry = TestedVersion {
            version: version.to_string(),
            test_time: Local::now(),
            test_result: result,
            test_details: details.to_string(),
        };
        let versions = &mut self.doc.defender.tested_versions;
        match versions.iter_mut().find(|t| t.version == version) {
            Some(existing) => *existing = entry,
            None => versions.push(entry),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create ledger directory {}", parent.display()))?;
        }
        let content = serde_yml::to_string(&self.doc).context("Failed to serialize ledger")?;
        fs::write(path, content)
            .with_context(|| format!("Error saving ledger file {}", path.display()))?;
        Ok(())
    }
}
