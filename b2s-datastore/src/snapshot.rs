//! Snapshot manager (§4.3): creates, lists, and prunes read-only Btrfs
//! snapshots by shelling out to the `btrfs` binary, in the
//! run-command-and-check-the-exit-status style of [`b2s_tools::command`],
//! generalized from this codebase's single-purpose subprocess helpers to the
//! small `btrfs subvolume {snapshot,delete}` / `btrfs send` vocabulary this
//! design needs.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Error};
use b2s_api_types::{SnapshotKind, SnapshotRecord, TIMESTAMP_FORMAT};
use b2s_tools::command::run_command;
use chrono::Utc;

use crate::prune::{compute_prune_marks, PruneMark};

/// Where read-only snapshots for `subvol_path` are created, absent an
/// explicit `snapshots.snapshot_root` override: a `.snapshots` directory
/// alongside the subvolume itself.
pub fn default_snapshot_root(subvol_path: &Path) -> PathBuf {
    let parent = subvol_path.parent().unwrap_or_else(|| Path::new("/"));
    parent.join(".snapshots")
}

pub struct SnapshotManager {
    /// Directory under which `<subvol>__<timestamp>__<kind>` snapshots live.
    root: PathBuf,
}

impl SnapshotManager {
    pub fn new(root: PathBuf) -> Self {
        SnapshotManager { root }
    }

    /// Creates a read-only snapshot of `subvol_path` under the managed root
    /// (§4.3). The timestamp is second-resolution UTC; a name collision
    /// within the same second is a fatal environment error, not retried.
    pub fn create(&self, subvol_name: &str, subvol_path: &Path, kind: SnapshotKind) -> Result<SnapshotRecord, Error> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create snapshot root {:?}", self.root))?;

        let timestamp = now_timestamp();
        let name = format!("{subvol_name}__{timestamp}__{kind}");
        let dest = self.root.join(&name);

        if dest.exists() {
            bail!(
                "snapshot destination {:?} already exists; two snapshots of {subvol_name:?} were requested within the same second",
                dest
            );
        }

        let mut cmd = Command::new("btrfs");
        cmd.args(["subvolume", "snapshot", "-r"])
            .arg(subvol_path)
            .arg(&dest);
        run_command(cmd, None)
            .with_context(|| format!("failed to create snapshot {:?} of {:?}", dest, subvol_path))?;

        let uuid = read_btrfs_uuid(&dest).ok();

        Ok(SnapshotRecord {
            subvol: subvol_name.to_string(),
            timestamp,
            kind,
            path: dest.to_string_lossy().into_owned(),
            uuid,
            parent_uuid: None,
        })
    }

    /// Enumerates existing snapshots for `subvol_name` under the managed root.
    pub fn list(&self, subvol_name: &str) -> Result<Vec<SnapshotRecord>, Error> {
        let mut snapshots = Vec::new();
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(snapshots),
            Err(e) => return Err(e).context(format!("failed to list snapshot root {:?}", self.root)),
        };

        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let Some((subvol, timestamp, kind)) = parse_snapshot_name(name) else {
                continue;
            };
            if subvol != subvol_name {
                continue;
            }
            snapshots.push(SnapshotRecord {
                subvol: subvol.to_string(),
                timestamp: timestamp.to_string(),
                kind,
                path: entry.path().to_string_lossy().into_owned(),
                uuid: read_btrfs_uuid(&entry.path()).ok(),
                parent_uuid: None,
            });
        }

        snapshots.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(snapshots)
    }

    /// Deletes snapshots in excess of `keep_count`, newest first kept,
    /// unconditionally preserving `required_parent` (§4.3).
    pub fn prune(
        &self,
        subvol_name: &str,
        keep_count: usize,
        required_parent: Option<&str>,
    ) -> Result<Vec<SnapshotRecord>, Error> {
        let snapshots = self.list(subvol_name)?;
        let marks = compute_prune_marks(&snapshots, keep_count, required_parent);

        let mut removed = Vec::new();
        for (snap, mark) in marks {
            if mark == PruneMark::Remove {
                let mut cmd = Command::new("btrfs");
                cmd.args(["subvolume", "delete"]).arg(&snap.path);
                run_command(cmd, None)
                    .with_context(|| format!("failed to delete snapshot {:?}", snap.path))?;
                removed.push(snap);
            }
        }
        Ok(removed)
    }
}

fn now_timestamp() -> String {
    Utc::now().format(TIMESTAMP_FORMAT).to_string()
}

fn parse_snapshot_name(name: &str) -> Option<(&str, &str, SnapshotKind)> {
    let caps = b2s_api_types::SNAPSHOT_NAME_REGEX.captures(name)?;
    let subvol = caps.name("subvol")?.range();
    let timestamp = caps.name("timestamp")?.range();
    let kind = caps.name("kind")?.as_str().parse().ok()?;
    Some((&name[subvol], &name[timestamp], kind))
}

fn read_btrfs_uuid(path: &Path) -> Result<String, Error> {
    let mut cmd = Command::new("btrfs");
    cmd.args(["subvolume", "show"]).arg(path);
    let output = run_command(cmd, None)?;
    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("UUID:") {
            return Ok(rest.trim().to_string());
        }
    }
    bail!("btrfs subvolume show for {:?} did not report a UUID", path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use b2s_api_types::SnapshotKind;

    #[test]
    fn parse_snapshot_name_extracts_fields() {
        let (subvol, ts, kind) = parse_snapshot_name("data__20260101T000000Z__full").unwrap();
        assert_eq!(subvol, "data");
        assert_eq!(ts, "20260101T000000Z");
        assert_eq!(kind, SnapshotKind::Full);
    }

    #[test]
    fn parse_snapshot_name_rejects_garbage() {
        assert!(parse_snapshot_name("not-a-snapshot").is_none());
    }

    #[test]
    fn default_snapshot_root_is_sibling_dot_snapshots() {
        let root = default_snapshot_root(Path::new("/mnt/data/subvol"));
        assert_eq!(root, PathBuf::from("/mnt/data/.snapshots"));
    }
}
