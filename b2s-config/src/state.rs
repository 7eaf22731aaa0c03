//! Persisted local state (§3, §4.2): a single JSON document, read-modify-write,
//! written atomically via write-temp-then-rename in the same directory.
//!
//! The store is single-writer by virtue of the process lock (§4.1); no
//! internal locking is required here, mirroring `pbs-config`'s own
//! `replace_backup_config` / `replace_secret_config` atomic-write helpers.

use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use b2s_api_types::LocalState;

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StateStore { path: path.into() }
    }

    /// Loads the state document, returning the default (empty) state if it
    /// does not exist yet.
    pub fn load(&self) -> Result<LocalState, Error> {
        match std::fs::read(&self.path) {
            Ok(data) => serde_json::from_slice(&data)
                .with_context(|| format!("failed to parse state document {:?}", self.path)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(LocalState::default()),
            Err(err) => Err(err).with_context(|| format!("failed to read {:?}", self.path)),
        }
    }

    /// Serializes and atomically replaces the state document.
    pub fn save(&self, state: &LocalState) -> Result<(), Error> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create state directory {parent:?}"))?;
        }
        let data = serde_json::to_vec_pretty(state).context("failed to serialize state")?;
        atomic_write(&self.path, &data)
    }
}

/// Write-temp-then-rename within the same directory, so a crash between the
/// write and the rename never leaves a half-written state document visible
/// at `path`.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), Error> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp_path = dir.join(format!(
        ".{}.tmp.{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("state"),
        std::process::id()
    ));
    std::fs::write(&tmp_path, data)
        .with_context(|| format!("failed to write temp file {tmp_path:?}"))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename {tmp_path:?} to {path:?}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use b2s_api_types::SubvolumeState;

    #[test]
    fn load_missing_returns_default() {
        let dir = std::env::temp_dir().join(format!("b2s-state-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = StateStore::new(dir.join("missing.json"));
        let state = store.load().unwrap();
        assert!(state.subvolumes.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("b2s-state-test2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = StateStore::new(dir.join("state.json"));

        let mut state = LocalState {
            last_run_at: Some(1_700_000_000),
            ..Default::default()
        };
        state.subvolumes.insert(
            "data".into(),
            SubvolumeState {
                last_snapshot_name: Some("data__20260101T000000Z__full".into()),
                last_snapshot_path: Some("/snap/data__20260101T000000Z__full".into()),
                last_manifest_key: Some("subvol/data/full/20260101T000000Z/manifest.json".into()),
                last_full_at: Some(1_700_000_000),
            },
        );

        store.save(&state).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, state);
    }
}
