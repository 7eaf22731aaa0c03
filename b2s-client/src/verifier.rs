//! Post-restore verification (§4.10): compares the restored tree against a
//! reference snapshot by size and SHA-256, either exhaustively or over a
//! bounded, deterministically-ordered sample.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Error};
use b2s_api_types::VerifyMode;
use b2s_tools::command::run_command;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

pub const DEFAULT_SAMPLE_MAX_FILES: usize = 200;

/// Verifies `restored` against `reference` per `mode`. Files are compared in
/// sorted relative-path order so a `Sample` run is deterministic across
/// invocations (§4.10: "a fixed, sorted-by-path sample").
pub fn verify(restored: &Path, reference: &Path, mode: VerifyMode, sample_max_files: usize) -> Result<(), Error> {
    match mode {
        VerifyMode::None => Ok(()),
        VerifyMode::Full => verify_files(restored, reference, usize::MAX),
        VerifyMode::Sample => verify_files(restored, reference, sample_max_files),
    }
}

fn verify_files(restored: &Path, reference: &Path, max_files: usize) -> Result<(), Error> {
    let mut relative_paths = relative_file_paths(reference)
        .with_context(|| format!("failed to walk reference snapshot {reference:?}"))?;
    relative_paths.sort();
    relative_paths.truncate(max_files);
    let reference_set: HashSet<&PathBuf> = relative_paths.iter().collect();

    let mut restored_paths = relative_file_paths(restored)
        .with_context(|| format!("failed to walk restored tree {restored:?}"))?;
    restored_paths.sort();
    restored_paths.truncate(max_files);

    if let Some(extra) = restored_paths.iter().find(|rel| !reference_set.contains(rel)) {
        bail!("verification failed: {extra:?} is present in the restored tree but not the reference snapshot");
    }

    for rel in &relative_paths {
        let reference_path = reference.join(rel);
        let restored_path = restored.join(rel);

        let reference_meta = std::fs::metadata(&reference_path)
            .with_context(|| format!("failed to stat reference file {reference_path:?}"))?;
        let restored_meta = std::fs::metadata(&restored_path)
            .with_context(|| format!("verification failed: {rel:?} is missing from the restored tree"))?;

        if reference_meta.len() != restored_meta.len() {
            bail!(
                "verification failed: {rel:?} size mismatch (reference {} bytes, restored {} bytes)",
                reference_meta.len(),
                restored_meta.len()
            );
        }

        let reference_hash = hash_file(&reference_path)?;
        let restored_hash = hash_file(&restored_path)?;
        if reference_hash != restored_hash {
            bail!("verification failed: {rel:?} content hash mismatch");
        }
    }

    Ok(())
}

fn hash_file(path: &Path) -> Result<String, Error> {
    let data = std::fs::read(path).with_context(|| format!("failed to read {path:?}"))?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(hex::encode(hasher.finalize()))
}

fn relative_file_paths(root: &Path) -> Result<Vec<PathBuf>, Error> {
    let mut paths = Vec::new();
    for entry in WalkDir::new(root).into_iter() {
        let entry = entry?;
        if entry.file_type().is_file() {
            let rel = entry
                .path()
                .strip_prefix(root)
                .expect("walked entry is under root")
                .to_path_buf();
            paths.push(rel);
        }
    }
    Ok(paths)
}

/// Falls back to a Btrfs-metadata-only check (target exists, is a
/// subvolume, carries the read-only flag, and reports a valid UUID) when no
/// reference snapshot is available to diff against (§4.10).
pub fn verify_metadata_only(restored: &Path) -> Result<(), Error> {
    if !restored.is_dir() {
        bail!("verification failed: restored path {restored:?} is not a directory");
    }

    let mut cmd = Command::new("btrfs");
    cmd.args(["subvolume", "show"]).arg(restored);
    let output = run_command(cmd, None)
        .with_context(|| format!("verification failed: {restored:?} is not a Btrfs subvolume"))?;

    let mut uuid: Option<&str> = None;
    let mut read_only = false;
    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("UUID:") {
            uuid = Some(rest.trim());
        } else if let Some(rest) = line.strip_prefix("Flags:") {
            read_only = rest.trim().contains("readonly");
        }
    }

    match uuid {
        Some(uuid) if !uuid.is_empty() => {}
        _ => bail!("verification failed: {restored:?} reported no UUID from btrfs subvolume show"),
    }
    if !read_only {
        bail!("verification failed: {restored:?} is not marked read-only");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn verify_none_always_passes() {
        let dir = tempfile::tempdir().unwrap();
        assert!(verify(dir.path(), dir.path(), VerifyMode::None, 10).is_ok());
    }

    #[test]
    fn verify_full_detects_content_mismatch() {
        let reference = tempfile::tempdir().unwrap();
        let restored = tempfile::tempdir().unwrap();
        fs::write(reference.path().join("a.txt"), b"hello").unwrap();
        fs::write(restored.path().join("a.txt"), b"world").unwrap();

        let err = verify(restored.path(), reference.path(), VerifyMode::Full, 10).unwrap_err();
        assert!(format!("{err:#}").contains("a.txt"));
    }

    #[test]
    fn verify_full_detects_missing_file() {
        let reference = tempfile::tempdir().unwrap();
        let restored = tempfile::tempdir().unwrap();
        fs::write(reference.path().join("a.txt"), b"hello").unwrap();

        let err = verify(restored.path(), reference.path(), VerifyMode::Full, 10).unwrap_err();
        assert!(format!("{err:#}").contains("missing"));
    }

    #[test]
    fn verify_passes_on_identical_trees() {
        let reference = tempfile::tempdir().unwrap();
        let restored = tempfile::tempdir().unwrap();
        fs::write(reference.path().join("a.txt"), b"hello").unwrap();
        fs::write(restored.path().join("a.txt"), b"hello").unwrap();

        assert!(verify(restored.path(), reference.path(), VerifyMode::Full, 10).is_ok());
    }

    #[test]
    fn sample_mode_truncates_to_max_files() {
        let reference = tempfile::tempdir().unwrap();
        let restored = tempfile::tempdir().unwrap();
        for name in ["a.txt", "b.txt", "c.txt"] {
            fs::write(reference.path().join(name), b"x").unwrap();
            fs::write(restored.path().join(name), b"x").unwrap();
        }
        assert!(verify(restored.path(), reference.path(), VerifyMode::Sample, 2).is_ok());
    }
}
