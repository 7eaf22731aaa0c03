//! Manifest (de)serialization and the bit-exact object layout (§3, §4.8).
//!
//! Mirrors `BackupManifest::to_string` / `BackupManifest::from_data` from this
//! codebase's own manifest handling (round-trip through canonical JSON), minus
//! the HMAC signature machinery: this design has no encryption concept, so
//! integrity is carried entirely by the per-chunk SHA-256 in [`b2s_api_types::ChunkRecord`].

use anyhow::{bail, Context, Error};
use b2s_api_types::{Manifest, ManifestKind, Pointer};

/// Serializes a manifest to its canonical on-wire JSON form.
pub fn to_json(manifest: &Manifest) -> Result<Vec<u8>, Error> {
    manifest.validate().context("refusing to serialize an invalid manifest")?;
    serde_json::to_vec_pretty(manifest).context("failed to serialize manifest")
}

/// Parses and validates a manifest fetched from the object store.
pub fn from_json(data: &[u8]) -> Result<Manifest, Error> {
    let manifest: Manifest =
        serde_json::from_slice(data).context("failed to parse manifest JSON")?;
    manifest.validate().context("manifest failed validation")?;
    Ok(manifest)
}

pub fn pointer_to_json(pointer: &Pointer) -> Result<Vec<u8>, Error> {
    serde_json::to_vec_pretty(pointer).context("failed to serialize pointer")
}

pub fn pointer_from_json(data: &[u8]) -> Result<Pointer, Error> {
    serde_json::from_slice(data).context("failed to parse pointer JSON")
}

/// Object key of the per-subvolume pointer (§4.8).
pub fn pointer_key(prefix: &str, subvol: &str) -> String {
    format!("{prefix}/subvol/{subvol}/current.json")
}

/// Object key of a manifest under the run's timestamped prefix (§4.8).
pub fn manifest_key(prefix: &str, subvol: &str, kind: ManifestKind, created_at: &str) -> String {
    format!(
        "{prefix}/subvol/{subvol}/{}/{created_at}/manifest.json",
        kind_dir(kind)
    )
}

/// Object key of one chunk's part object, zero-padded to 5 digits (§4.8).
pub fn chunk_key(
    prefix: &str,
    subvol: &str,
    kind: ManifestKind,
    created_at: &str,
    ordinal: u64,
) -> String {
    format!(
        "{prefix}/subvol/{subvol}/{}/{created_at}/chunks/part-{ordinal:05}.bin",
        kind_dir(kind)
    )
}

fn kind_dir(kind: ManifestKind) -> &'static str {
    match kind {
        ManifestKind::Full => "full",
        ManifestKind::Incremental => "inc",
    }
}

/// Walks `parent_manifest` starting from `head`, oldest-first, using `fetch`
/// to resolve each ancestor key to its manifest (§4.9 step 1, invariant 3).
///
/// The chain is returned ordered `[full, incremental, ..., head]`. A broken
/// chain (missing or unreadable ancestor) is reported with the offending key
/// named in the error, per §4.9.
pub fn resolve_chain<F>(head: Manifest, mut fetch: F) -> Result<Vec<Manifest>, Error>
where
    F: FnMut(&str) -> Result<Manifest, Error>,
{
    let mut chain = vec![head];
    loop {
        let current = chain.last().unwrap();
        match (&current.kind, &current.parent_manifest) {
            (ManifestKind::Full, _) => break,
            (ManifestKind::Incremental, Some(parent_key)) => {
                let parent = fetch(parent_key)
                    .with_context(|| format!("broken manifest chain: missing ancestor {parent_key:?}"))?;
                chain.push(parent);
            }
            (ManifestKind::Incremental, None) => {
                bail!("incremental manifest has no parent_manifest key");
            }
        }
    }
    chain.reverse();
    Ok(chain)
}

/// Validates that every entry in a resolved chain is internally consistent
/// (invariant 3: chain terminates at a full manifest; every intermediate
/// manifest is an incremental whose parent immediately precedes it).
pub fn validate_chain(chain: &[Manifest]) -> Result<(), Error> {
    if chain.is_empty() {
        bail!("manifest chain is empty");
    }
    if !matches!(chain[0].kind, ManifestKind::Full) {
        bail!("manifest chain does not start with a full manifest");
    }
    for m in &chain[1..] {
        if !matches!(m.kind, ManifestKind::Incremental) {
            bail!("manifest chain contains more than one full manifest");
        }
        m.validate()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use b2s_api_types::{ChunkRecord, S3Descriptor, SnapshotDescriptor};
    use std::collections::HashMap;

    fn make_manifest(
        subvol: &str,
        kind: ManifestKind,
        created_at: &str,
        parent: Option<&str>,
    ) -> Manifest {
        Manifest {
            schema_version: b2s_api_types::MANIFEST_SCHEMA_VERSION,
            subvol: subvol.to_string(),
            kind,
            created_at: created_at.to_string(),
            snapshot: SnapshotDescriptor {
                name: format!("{subvol}__{created_at}__x"),
                path: format!("/snap/{subvol}__{created_at}__x"),
                uuid: None,
                parent_uuid: None,
            },
            chunks: vec![ChunkRecord {
                ordinal: 0,
                key: "part-00000.bin".into(),
                size: 1,
                sha256: "a".repeat(64),
                etag: "etag".into(),
            }],
            parent_manifest: parent.map(String::from),
            total_bytes: 1,
            chunk_size: 1,
            s3: S3Descriptor {
                bucket: "b".into(),
                region: "r".into(),
                storage_class_chunks: "STANDARD".into(),
            },
        }
    }

    #[test]
    fn json_round_trip_preserves_content() {
        let m = make_manifest("data", ManifestKind::Full, "20260101T000000Z", None);
        let bytes = to_json(&m).unwrap();
        let parsed = from_json(&bytes).unwrap();
        assert_eq!(parsed, m);
    }

    #[test]
    fn object_keys_match_layout() {
        assert_eq!(
            pointer_key("prefix", "data"),
            "prefix/subvol/data/current.json"
        );
        assert_eq!(
            manifest_key("prefix", "data", ManifestKind::Full, "T"),
            "prefix/subvol/data/full/T/manifest.json"
        );
        assert_eq!(
            chunk_key("prefix", "data", ManifestKind::Incremental, "T", 7),
            "prefix/subvol/data/inc/T/chunks/part-00007.bin"
        );
    }

    #[test]
    fn resolve_chain_walks_to_full() {
        let full = make_manifest("data", ManifestKind::Full, "T0", None);
        let inc1 = make_manifest("data", ManifestKind::Incremental, "T1", Some("k0"));
        let inc2 = make_manifest("data", ManifestKind::Incremental, "T2", Some("k1"));

        let mut store = HashMap::new();
        store.insert("k0".to_string(), full);
        store.insert("k1".to_string(), inc1);

        let chain = resolve_chain(inc2, |key| {
            store
                .get(key)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("missing {key}"))
        })
        .unwrap();

        assert_eq!(chain.len(), 3);
        assert!(matches!(chain[0].kind, ManifestKind::Full));
        assert_eq!(chain[0].created_at, "T0");
        assert_eq!(chain[2].created_at, "T2");
        validate_chain(&chain).unwrap();
    }

    #[test]
    fn resolve_chain_reports_missing_ancestor() {
        let inc = make_manifest("data", ManifestKind::Incremental, "T1", Some("missing-key"));
        let err = resolve_chain(inc, |_| Err(anyhow::anyhow!("not found"))).unwrap_err();
        assert!(format!("{err:#}").contains("missing-key"));
    }
}
