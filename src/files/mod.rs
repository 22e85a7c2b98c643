//! Filesystem primitives shared across the pipeline
//!
//! Everything here operates on single files or directories and is careful
//! about partial state: copies go through a `.copying` temp sibling and are
//! renamed into place, so a crash never leaves a half-written file under the
//! final name.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};
use walkdir::WalkDir;

/// Suffix for in-transit copies. A file with this suffix under destination or
/// hazard archive is always a leftover from an interrupted run.
pub const COPYING_SUFFIX: &str = ".copying";

const HASH_CHUNK_SIZE: usize = 8192;

/// Characters that are never allowed in a name from the untrusted source
/// area, beyond the control-byte range.
const DANGEROUS_SEQUENCES: &[&str] = &["..", ">", "<", "|", "*", "$", "&", ";", "`"];

fn is_name_safe(name: &OsStr, is_path: bool) -> bool {
    // Names must be valid UTF-8 before any other rule applies
    let Some(name) = name.to_str() else {
        return false;
    };

    if name.is_empty() {
        return false;
    }

    // Control characters 0x00-0x1F and DEL
    if name.chars().any(|c| (c as u32) < 0x20 || c as u32 == 0x7F) {
        return false;
    }

    if DANGEROUS_SEQUENCES.iter().any(|s| name.contains(s)) {
        return false;
    }

    // Backslash is rejected in both modes; forward slash only as a filename
    if name.contains('\\') || (!is_path && name.contains('/')) {
        return false;
    }

    if name.starts_with('-') || name.starts_with('.') {
        return false;
    }

    true
}

/// Check a single filename component from the source area.
pub fn is_filename_safe(name: &OsStr) -> bool {
    is_name_safe(name, false)
}

/// Check a relative path from the source area. Permits `/` separators but
/// applies every other filename rule to the whole string.
pub fn is_pathname_safe(path: &OsStr) -> bool {
    is_name_safe(path, true)
}

/// Compute the SHA-256 hash of a file, reading in chunks so large files do
/// not balloon memory.
pub fn file_hash(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .with_context(|| format!("Failed to open file for hashing: {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; HASH_CHUNK_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Failed to read file for hashing: {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Result of an integrity comparison between two files.
#[derive(Debug)]
pub struct IntegrityCheck {
    pub matches: bool,
    pub source_hash: Option<String>,
    pub comparison_hash: Option<String>,
}

/// Verify that two files have identical SHA-256 hashes and that neither is
/// empty. An empty file never verifies: zero-length "deliveries" have been a
/// real corruption mode for staged transfers.
pub fn verify_file_integrity(source: &Path, comparison: &Path) -> Result<IntegrityCheck> {
    let source_len = fs::metadata(source)
        .with_context(|| format!("Failed to stat {}", source.display()))?
        .len();
    let comparison_len = fs::metadata(comparison)
        .with_context(|| format!("Failed to stat {}", comparison.display()))?
        .len();

    if source_len == 0 || comparison_len == 0 {
        error!(
            source = %source.display(),
            comparison = %comparison.display(),
            "Integrity check refused: one of the files is empty"
        );
        return Ok(IntegrityCheck {
            matches: false,
            source_hash: None,
            comparison_hash: None,
        });
    }

    let source_hash = file_hash(source)?;
    let comparison_hash = file_hash(comparison)?;
    let matches = source_hash == comparison_hash;

    if matches {
        debug!(file = %comparison.display(), "File integrity verified");
    } else {
        error!(
            source = %source.display(),
            comparison = %comparison.display(),
            "File integrity check failed: hashes differ"
        );
    }

    Ok(IntegrityCheck {
        matches,
        source_hash: Some(source_hash),
        comparison_hash: Some(comparison_hash),
    })
}

/// Copy `from` to `to` via a `.copying` temp sibling and an atomic rename.
/// The temp file lives next to the final path so the rename never crosses a
/// filesystem boundary.
pub fn copy_temp_then_rename(from: &Path, to: &Path) -> Result<()> {
    let to_dir = to
        .parent()
        .with_context(|| format!("Destination has no parent directory: {}", to.display()))?;
    let temp_path = copying_temp_path(to);

    fs::create_dir_all(to_dir)
        .with_context(|| format!("Failed to create directory {}", to_dir.display()))?;

    if temp_path.exists() {
        fs::remove_file(&temp_path)
            .with_context(|| format!("Failed to remove stale temp {}", temp_path.display()))?;
    }

    let result = fs::copy(from, &temp_path)
        .with_context(|| {
            format!(
                "Failed to copy {} to {}",
                from.display(),
                temp_path.display()
            )
        })
        .and_then(|_| {
            fs::rename(&temp_path, to).with_context(|| {
                format!(
                    "Failed to rename {} to {}",
                    temp_path.display(),
                    to.display()
                )
            })
        });

    if result.is_err() && temp_path.exists() {
        let _ = fs::remove_file(&temp_path);
    }

    if result.is_ok() {
        debug!(from = %from.display(), to = %to.display(), "Copied file");
    }
    result
}

/// The `.copying` sibling for a final path.
pub fn copying_temp_path(to: &Path) -> PathBuf {
    let mut name = to.as_os_str().to_os_string();
    name.push(COPYING_SUFFIX);
    PathBuf::from(name)
}

/// Remove a file, logging the outcome. Returns whether the file is gone.
pub fn remove_file_with_logging(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(file = %path.display(), "Deleted file");
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(file = %path.display(), "File not found while attempting deletion");
            true
        }
        Err(e) => {
            error!(file = %path.display(), error = %e, "Failed to delete file");
            false
        }
    }
}

/// Remove all contents of a directory, keeping the directory itself.
pub fn remove_directory_contents(root: &Path) -> Result<()> {
    for entry in fs::read_dir(root)
        .with_context(|| format!("Failed to list directory {}", root.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        let result = if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if let Err(e) = result {
            error!(path = %path.display(), error = %e, "Failed to delete");
        }
    }
    Ok(())
}

/// Remove empty directories under `root`, deepest first. The root itself is
/// kept when `keep_root` is set. Non-empty directories are left alone.
pub fn remove_empty_directories(root: &Path, keep_root: bool) {
    let mut dirs: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .collect();
    dirs.sort_by_key(|p| std::cmp::Reverse(p.components().count()));

    for dir in dirs {
        if keep_root && dir == root {
            continue;
        }
        // remove_dir refuses non-empty directories
        if fs::remove_dir(&dir).is_ok() {
            debug!(dir = %dir.display(), "Removed empty directory");
        }
    }
}

/// Probe write access to a directory by creating and deleting a marker file.
pub fn test_write_access(path: &Path) -> Result<()> {
    let test_file = path.join("write_test.tmp");
    let mut file = File::create(&test_file)
        .with_context(|| format!("No write access to {}", path.display()))?;
    file.write_all(b"test")
        .with_context(|| format!("No write access to {}", path.display()))?;
    drop(file);
    fs::remove_file(&test_file)
        .with_context(|| format!("Failed to remove write probe {}", test_file.display()))?;
    debug!(path = %path.display(), "Write access confirmed");
    Ok(())
}

/// Remove `.copying` leftovers under `root` from a crashed prior run.
/// Returns how many were removed.
pub fn cleanup_stale_partials(root: &Path) -> usize {
    let mut removed = 0;
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let is_partial = entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.ends_with(COPYING_SUFFIX));
        if is_partial {
            warn!(file = %entry.path().display(), "Removing stale partial from a previous run");
            if fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use tempfile::TempDir;

    #[test]
    fn test_filename_safety_rejects_dangerous_names() {
        for bad in [
            "evil|name",
            "a;b",
            "back`tick",
            "star*",
            "dollar$",
            "amp&",
            "redir>out",
            "redir<in",
            "dot..dot",
            "-leading-dash",
            ".hidden",
            "slash/inside",
            "back\\slash",
            "ctrl\u{0007}bell",
            "",
        ] {
            assert!(
                !is_filename_safe(OsStr::new(bad)),
                "expected {bad:?} to be rejected"
            );
        }
    }

    #[test]
    fn test_filename_safety_accepts_ordinary_names() {
        for good in ["report.pdf", "data 2024.csv", "motörhead.flac", "a"] {
            assert!(
                is_filename_safe(OsStr::new(good)),
                "expected {good:?} to be accepted"
            );
        }
    }

    #[test]
    fn test_pathname_mode_permits_separators() {
        assert!(is_pathname_safe(OsStr::new("sub/dir/file.txt")));
        assert!(!is_pathname_safe(OsStr::new("sub/../escape.txt")));
        assert!(!is_pathname_safe(OsStr::new("sub\\dir\\file.txt")));
    }

    #[test]
    fn test_non_utf8_names_are_rejected() {
        use std::os::unix::ffi::OsStringExt;
        let name = OsString::from_vec(vec![0x66, 0x6f, 0xff, 0x6f]);
        assert!(!is_filename_safe(&name));
    }

    #[test]
    fn test_copy_temp_then_rename_creates_parents_and_cleans_temp() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src.txt");
        fs::write(&src, b"payload").unwrap();

        let dest = tmp.path().join("nested/dir/dest.txt");
        copy_temp_then_rename(&src, &dest).unwrap();

        assert_eq!(fs::read(&dest).unwrap(), b"payload");
        assert!(!copying_temp_path(&dest).exists());
    }

    #[test]
    fn test_verify_integrity_matches_and_rejects_empty() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        fs::write(&a, b"same bytes").unwrap();
        fs::write(&b, b"same bytes").unwrap();

        let check = verify_file_integrity(&a, &b).unwrap();
        assert!(check.matches);
        assert_eq!(check.source_hash, check.comparison_hash);

        fs::write(&b, b"different").unwrap();
        assert!(!verify_file_integrity(&a, &b).unwrap().matches);

        fs::write(&b, b"").unwrap();
        let empty = verify_file_integrity(&a, &b).unwrap();
        assert!(!empty.matches);
        assert!(empty.source_hash.is_none());
    }

    #[test]
    fn test_cleanup_stale_partials() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("sub/file.txt.copying"), b"partial").unwrap();
        fs::write(tmp.path().join("keep.txt"), b"keep").unwrap();

        assert_eq!(cleanup_stale_partials(tmp.path()), 1);
        assert!(tmp.path().join("keep.txt").exists());
        assert!(!tmp.path().join("sub/file.txt.copying").exists());
    }

    #[test]
    fn test_remove_empty_directories() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("a/b/c")).unwrap();
        fs::create_dir_all(tmp.path().join("full")).unwrap();
        fs::write(tmp.path().join("full/file"), b"x").unwrap();

        remove_empty_directories(tmp.path(), true);
        assert!(tmp.path().exists());
        assert!(!tmp.path().join("a").exists());
        assert!(tmp.path().join("full/file").exists());
    }
}
