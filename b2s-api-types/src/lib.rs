//! Data model types shared by every component of `btrfs_to_s3`.
//!
//! These are plain serde-friendly structs and enums with no behavior tied to
//! any particular I/O backend; the snapshot manager, planner, manifest
//! publisher and restore engine all exchange values of these types instead of
//! passing around loosely-typed maps.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Error};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    /// `<subvol>__<timestamp>__<kind>`, timestamp is `YYYYMMDDTHHMMSSZ`.
    pub static ref SNAPSHOT_NAME_REGEX: Regex = Regex::new(
        r"^(?P<subvol>[A-Za-z0-9_.\-]+)__(?P<timestamp>\d{8}T\d{6}Z)__(?P<kind>full|inc)$"
    ).unwrap();

    /// Subvolume short names: safe to embed in file paths and S3 keys.
    pub static ref SUBVOL_NAME_REGEX: Regex = Regex::new(r"^[A-Za-z0-9_.\-]+$").unwrap();
}

pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Manifest schema version written by this implementation.
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// `full` | `inc` — the kind of a snapshot or a manifest chain link.
///
/// The snapshot record and the manifest use the same two-value kind, but the
/// manifest's on-wire spelling is the long form (`incremental`); [`Kind::Manifest`]
/// is recorded separately in [`serde`]'s `rename` attributes below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Full,
    Inc,
}

impl fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SnapshotKind::Full => "full",
            SnapshotKind::Inc => "inc",
        })
    }
}

impl FromStr for SnapshotKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "full" => Ok(SnapshotKind::Full),
            "inc" => Ok(SnapshotKind::Inc),
            other => bail!("invalid snapshot kind: {other:?}"),
        }
    }
}

/// `full` | `incremental` — the kind recorded inside a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ManifestKind {
    Full,
    Incremental,
}

impl From<SnapshotKind> for ManifestKind {
    fn from(kind: SnapshotKind) -> Self {
        match kind {
            SnapshotKind::Full => ManifestKind::Full,
            SnapshotKind::Inc => ManifestKind::Incremental,
        }
    }
}

impl fmt::Display for ManifestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ManifestKind::Full => "full",
            ManifestKind::Incremental => "incremental",
        })
    }
}

/// A configured subvolume (§3, `global.subvolumes`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubvolumeConfig {
    /// Absolute host path of the Btrfs subvolume.
    pub path: String,
    /// Stable short name derived from the final path component, unless overridden.
    pub name: String,
    /// Overrides `schedule.full_every_days` for this subvolume, if set.
    pub full_every_days: Option<u32>,
    /// Overrides `schedule.incremental_every_days` for this subvolume, if set.
    pub incremental_every_days: Option<u32>,
}

impl SubvolumeConfig {
    /// Derives the default short name from the final path component.
    pub fn derive_name(path: &str) -> Result<String, Error> {
        let trimmed = path.trim_end_matches('/');
        let name = trimmed
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("cannot derive a subvolume name from {path:?}"))?;
        if !SUBVOL_NAME_REGEX.is_match(name) {
            bail!("derived subvolume name {name:?} is not a safe identifier");
        }
        Ok(name.to_string())
    }
}

/// A read-only Btrfs snapshot (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub subvol: String,
    /// `YYYYMMDDTHHMMSSZ`, second resolution, UTC.
    pub timestamp: String,
    pub kind: SnapshotKind,
    /// Absolute path of the snapshot on the snapshot filesystem.
    pub path: String,
    pub uuid: Option<String>,
    pub parent_uuid: Option<String>,
}

impl SnapshotRecord {
    pub fn name(&self) -> String {
        format!("{}__{}__{}", self.subvol, self.timestamp, self.kind)
    }
}

/// One object in the object store holding a contiguous range of the send stream (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkRecord {
    pub ordinal: u64,
    pub key: String,
    pub size: u64,
    /// Hex-encoded SHA-256 of the plaintext chunk content.
    pub sha256: String,
    pub etag: String,
}

/// Descriptor of the snapshot a manifest was produced from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotDescriptor {
    pub name: String,
    pub path: String,
    pub uuid: Option<String>,
    pub parent_uuid: Option<String>,
}

impl From<&SnapshotRecord> for SnapshotDescriptor {
    fn from(s: &SnapshotRecord) -> Self {
        SnapshotDescriptor {
            name: s.name(),
            path: s.path.clone(),
            uuid: s.uuid.clone(),
            parent_uuid: s.parent_uuid.clone(),
        }
    }
}

/// S3 placement of the chunks and metadata a manifest points at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct S3Descriptor {
    pub bucket: String,
    pub region: String,
    pub storage_class_chunks: String,
}

/// The JSON object describing one backup generation, full or incremental (§3, §4.8).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Manifest {
    pub schema_version: u32,
    pub subvol: String,
    pub kind: ManifestKind,
    /// `YYYYMMDDTHHMMSSZ`.
    pub created_at: String,
    pub snapshot: SnapshotDescriptor,
    pub chunks: Vec<ChunkRecord>,
    /// `None` for a `full` manifest.
    pub parent_manifest: Option<String>,
    pub total_bytes: u64,
    pub chunk_size: u64,
    pub s3: S3Descriptor,
}

impl Manifest {
    /// Validates invariant 4 (§3): ordinals contiguous from zero, sizes sum to `total_bytes`.
    pub fn validate(&self) -> Result<(), Error> {
        let mut sum = 0u64;
        for (i, c) in self.chunks.iter().enumerate() {
            if c.ordinal != i as u64 {
                bail!(
                    "chunk ordinals are not contiguous: expected {i}, found {}",
                    c.ordinal
                );
            }
            sum += c.size;
        }
        if sum != self.total_bytes {
            bail!(
                "chunk sizes sum to {sum} but total_bytes is {}",
                self.total_bytes
            );
        }
        if matches!(self.kind, ManifestKind::Full) && self.parent_manifest.is_some() {
            bail!("a full manifest must not carry a parent_manifest");
        }
        if matches!(self.kind, ManifestKind::Incremental) && self.parent_manifest.is_none() {
            bail!("an incremental manifest must carry a parent_manifest");
        }
        Ok(())
    }
}

/// The per-subvolume pointer object (`current.json`, §3, §4.8).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Pointer {
    pub manifest_key: String,
    pub kind: ManifestKind,
    pub created_at: String,
}

/// Per-subvolume entry inside the local state document (§3, §4.2).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SubvolumeState {
    pub last_snapshot_name: Option<String>,
    pub last_snapshot_path: Option<String>,
    pub last_manifest_key: Option<String>,
    /// Unix timestamp (seconds) of the last `full` backup, if any.
    pub last_full_at: Option<i64>,
}

/// The full persisted local state document (§3, §4.2).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LocalState {
    pub last_run_at: Option<i64>,
    #[serde(default)]
    pub subvolumes: std::collections::BTreeMap<String, SubvolumeState>,
}

impl LocalState {
    pub fn subvolume(&self, name: &str) -> SubvolumeState {
        self.subvolumes.get(name).cloned().unwrap_or_default()
    }
}

/// The planner's decision for one subvolume (§4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanDecision {
    Skip,
    Full,
    Incremental {
        parent_snapshot_path: String,
        parent_manifest: String,
    },
}

impl fmt::Display for PlanDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanDecision::Skip => write!(f, "skip"),
            PlanDecision::Full => write!(f, "full"),
            PlanDecision::Incremental { parent_manifest, .. } => {
                write!(f, "incremental(parent_manifest={parent_manifest})")
            }
        }
    }
}

/// Verify mode for the restore engine and the verifier (§4.10, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    #[default]
    None,
    Sample,
    Full,
}

impl FromStr for VerifyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "none" => Ok(VerifyMode::None),
            "sample" => Ok(VerifyMode::Sample),
            "full" => Ok(VerifyMode::Full),
            other => bail!("invalid verify mode: {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_name_strips_trailing_slash() {
        assert_eq!(
            SubvolumeConfig::derive_name("/mnt/data/").unwrap(),
            "data"
        );
        assert_eq!(SubvolumeConfig::derive_name("/mnt/data").unwrap(), "data");
    }

    #[test]
    fn derive_name_rejects_root() {
        assert!(SubvolumeConfig::derive_name("/").is_err());
    }

    #[test]
    fn snapshot_name_matches_pattern() {
        let rec = SnapshotRecord {
            subvol: "data".into(),
            timestamp: "20260101T000000Z".into(),
            kind: SnapshotKind::Full,
            path: "/snap/data__20260101T000000Z__full".into(),
            uuid: None,
            parent_uuid: None,
        };
        let name = rec.name();
        assert_eq!(name, "data__20260101T000000Z__full");
        assert!(SNAPSHOT_NAME_REGEX.is_match(&name));
    }

    #[test]
    fn manifest_validate_checks_contiguous_ordinals() {
        let mut m = sample_manifest();
        m.chunks[1].ordinal = 5;
        assert!(m.validate().is_err());
    }

    #[test]
    fn manifest_validate_checks_total_bytes() {
        let mut m = sample_manifest();
        m.total_bytes += 1;
        assert!(m.validate().is_err());
    }

    #[test]
    fn manifest_validate_accepts_well_formed() {
        assert!(sample_manifest().validate().is_ok());
    }

    fn sample_manifest() -> Manifest {
        Manifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            subvol: "data".into(),
            kind: ManifestKind::Full,
            created_at: "20260101T000000Z".into(),
            snapshot: SnapshotDescriptor {
                name: "data__20260101T000000Z__full".into(),
                path: "/snap/data__20260101T000000Z__full".into(),
                uuid: None,
                parent_uuid: None,
            },
            chunks: vec![
                ChunkRecord {
                    ordinal: 0,
                    key: "part-00000.bin".into(),
                    size: 10,
                    sha256: "a".repeat(64),
                    etag: "etag0".into(),
                },
                ChunkRecord {
                    ordinal: 1,
                    key: "part-00001.bin".into(),
                    size: 5,
                    sha256: "b".repeat(64),
                    etag: "etag1".into(),
                },
            ],
            parent_manifest: None,
            total_bytes: 15,
            chunk_size: 10,
            s3: S3Descriptor {
                bucket: "bucket".into(),
                region: "us-east-1".into(),
                storage_class_chunks: "STANDARD".into(),
            },
        }
    }
}
