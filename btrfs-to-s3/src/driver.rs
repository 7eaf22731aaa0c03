//! Top-level control flow (§2): `backup` drives the per-subvolume pipeline
//! sequentially under the process lock; `restore` resolves a manifest chain
//! and replays it into a fresh subvolume.

use std::time::Instant;

use anyhow::{Context, Error};
use aws_sdk_s3::config::Region;
use b2s_api_types::{
    ChunkRecord, ManifestKind, Manifest, PlanDecision, Pointer, S3Descriptor, SnapshotDescriptor,
    SnapshotKind, SubvolumeConfig, SubvolumeState, VerifyMode,
};
use b2s_client::restore::{restore, RestoreOptions};
use b2s_client::s3::S3Client;
use b2s_client::streamer::SendStream;
use b2s_client::uploader::{self, SpoolConfig, UploaderConfig};
use b2s_config::{lock, Config, StateStore};
use b2s_datastore::manifest::{chunk_key, from_json, manifest_key, pointer_from_json, pointer_key, to_json};
use b2s_datastore::snapshot::{default_snapshot_root, SnapshotManager};
use b2s_datastore::Chunker;
use bytes::Bytes;

use crate::error::CliError;
use crate::metrics::{backup_metrics, restore_metrics, RunMetrics};
use crate::planner::{plan, PlanInput};

pub struct BackupOptions {
    pub dry_run: bool,
    pub subvolume_filter: Vec<String>,
    pub once: bool,
    pub no_s3: bool,
}

pub struct RestoreCliOptions<'a> {
    pub subvol: &'a str,
    pub target: std::path::PathBuf,
    pub manifest_key: Option<String>,
    pub verify_override: Option<VerifyMode>,
}

/// Builds an S3 client honoring the configured region and (optionally)
/// an S3-compatible endpoint override, resolving credentials from the
/// environment per §6 ("no credentials are read from the config file").
pub async fn build_s3_client(config: &Config) -> Result<S3Client, Error> {
    let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new(config.region.clone()));
    if let Some(endpoint) = &config.endpoint_url {
        loader = loader.endpoint_url(endpoint.clone());
    }
    let shared_config = loader.load().await;
    let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&shared_config);
    if config.endpoint_url.is_some() {
        s3_config_builder = s3_config_builder.force_path_style(true);
    }
    let client = aws_sdk_s3::Client::from_conf(s3_config_builder.build());
    Ok(S3Client::new(client, config.bucket.clone()))
}

fn uploader_config(config: &Config) -> UploaderConfig {
    let spool = config.spool_dir.as_ref().map(|dir| SpoolConfig {
        dir: dir.clone(),
        max_bytes: config.spool_size_bytes.unwrap_or(0),
    });
    UploaderConfig {
        concurrency: config.concurrency as usize,
        part_size_bytes: config.part_size_bytes,
        storage_class: config.storage_class_chunks.clone(),
        spool,
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Runs the backup pipeline for every configured subvolume (optionally
/// filtered), sequentially, continuing past a single subvolume's failure so
/// the rest of the fleet still gets backed up (§7: "the driver continues
/// with the next subvolume").
pub async fn backup(config: &Config, opts: &BackupOptions) -> Result<(), Error> {
    let _lock = lock::acquire(&config.lock_path).context("failed to acquire process lock")?;

    let state_store = StateStore::new(config.state_path.clone());
    let mut state = state_store.load().context("failed to load local state")?;

    let s3 = if opts.no_s3 {
        None
    } else {
        Some(build_s3_client(config).await?)
    };

    let subvolumes: Vec<&SubvolumeConfig> = config
        .subvolumes
        .iter()
        .filter(|sv| opts.subvolume_filter.is_empty() || opts.subvolume_filter.contains(&sv.name))
        .collect();

    let mut first_error: Option<Error> = None;
    let now = now_unix();

    for sv in subvolumes {
        let sv_state = state.subvolume(&sv.name);
        let full_every_days = sv.full_every_days.unwrap_or(config.full_every_days);
        let incremental_every_days = sv.incremental_every_days.unwrap_or(config.incremental_every_days);

        let decision = plan(&PlanInput {
            state: &sv_state,
            now,
            once: opts.once,
            full_every_days,
            incremental_every_days,
        });

        log::info!("subvolume {}: plan decision = {decision}", sv.name);

        if matches!(decision, PlanDecision::Skip) {
            continue;
        }

        if opts.dry_run {
            log::info!("subvolume {}: dry-run, stopping after plan", sv.name);
            continue;
        }

        match backup_one(config, sv, &sv_state, &decision, s3.as_ref(), opts.no_s3).await {
            Ok(Some(updated)) => {
                state.subvolumes.insert(sv.name.clone(), updated);
                state.last_run_at = Some(now);
                if let Err(err) = state_store.save(&state) {
                    log::error!("subvolume {}: failed to persist state: {err:#}", sv.name);
                    first_error.get_or_insert(err);
                }
            }
            Ok(None) => {
                log::info!("subvolume {}: --no-s3 run completed without updating state", sv.name);
            }
            Err(err) => {
                log::error!("subvolume {}: backup failed: {err:#}", sv.name);
                first_error.get_or_insert(err);
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn backup_one(
    config: &Config,
    sv: &SubvolumeConfig,
    sv_state: &SubvolumeState,
    decision: &PlanDecision,
    s3: Option<&S3Client>,
    no_s3: bool,
) -> Result<Option<SubvolumeState>, Error> {
    let started = Instant::now();
    let subvol_path = std::path::Path::new(&sv.path);

    let snapshot_kind = match decision {
        PlanDecision::Full => SnapshotKind::Full,
        PlanDecision::Incremental { .. } => SnapshotKind::Inc,
        PlanDecision::Skip => unreachable!("Skip is filtered out before backup_one is called"),
    };
    let manifest_kind = ManifestKind::from(snapshot_kind);

    let snapshot_root = config
        .snapshot_root
        .clone()
        .unwrap_or_else(|| default_snapshot_root(subvol_path));
    let snapshot_mgr = SnapshotManager::new(snapshot_root);

    // `total_bytes` lives outside the fallible block below so a failure
    // partway through the pipeline still has a meaningful figure to report
    // (§4.11: a metrics record is emitted "on pipeline completion, success
    // or failure").
    let mut total_bytes: u64 = 0;

    let result: Result<Option<SubvolumeState>, Error> = async {
        let snapshot = snapshot_mgr
            .create(&sv.name, subvol_path, snapshot_kind)
            .map_err(|err| Error::new(CliError::Snapshot(format!("{err:#}"))))?;

        let parent_snapshot_path = match decision {
            PlanDecision::Incremental { parent_snapshot_path, .. } => Some(parent_snapshot_path.clone()),
            _ => None,
        };
        let parent_manifest_key = match decision {
            PlanDecision::Incremental { parent_manifest, .. } => Some(parent_manifest.clone()),
            _ => None,
        };

        let mut send = SendStream::open(
            std::path::Path::new(&snapshot.path),
            parent_snapshot_path.as_deref().map(std::path::Path::new),
        )
        .map_err(|err| Error::new(CliError::Send(format!("{err:#}"))))?;

        let mut chunker = Chunker::new(send.stdout(), config.chunk_size_bytes);
        let mut chunks = Vec::new();
        let mut ordinal: u64 = 0;

        let chunk_result: Result<(), Error> = async {
            while let Some(mut cursor) = chunker.next_chunk() {
                let key = chunk_key(&config.prefix, &sv.name, manifest_kind, &snapshot.timestamp, ordinal);

                if no_s3 {
                    while cursor.next_buf().await?.is_some() {}
                    let (size, _digest) = cursor.finish();
                    if size == 0 {
                        break;
                    }
                    total_bytes += size;
                    ordinal += 1;
                    continue;
                }

                let s3 = s3.expect("s3 client is present when no_s3 is false");
                let uploaded = uploader::put_large(s3, &key, cursor, config.chunk_size_bytes, &uploader_config(config))
                    .await
                    .map_err(|err| Error::new(CliError::Upload(format!("{err:#}"))))?;
                let Some((etag, size, sha256)) = uploaded else {
                    break;
                };

                chunks.push(ChunkRecord {
                    ordinal,
                    key,
                    size,
                    sha256,
                    etag,
                });
                total_bytes += size;
                ordinal += 1;
            }
            Ok(())
        }
        .await;

        if let Err(err) = chunk_result {
            let _ = send.close().await;
            return Err(err);
        }
        send.close()
            .await
            .map_err(|err| Error::new(CliError::Send(format!("{err:#}"))))?;

        if no_s3 {
            return Ok(None);
        }

        let s3 = s3.expect("s3 client is present when no_s3 is false");
        let manifest = Manifest {
            schema_version: b2s_api_types::MANIFEST_SCHEMA_VERSION,
            subvol: sv.name.clone(),
            kind: manifest_kind,
            created_at: snapshot.timestamp.clone(),
            snapshot: SnapshotDescriptor::from(&snapshot),
            chunks,
            parent_manifest: parent_manifest_key,
            total_bytes,
            chunk_size: config.chunk_size_bytes,
            s3: S3Descriptor {
                bucket: config.bucket.clone(),
                region: config.region.clone(),
                storage_class_chunks: config.storage_class_chunks.clone(),
            },
        };

        let manifest_bytes = to_json(&manifest).context("failed to serialize manifest")?;
        let manifest_object_key = manifest_key(&config.prefix, &sv.name, manifest_kind, &snapshot.timestamp);
        uploader::put_small(s3, &manifest_object_key, Bytes::from(manifest_bytes), &config.storage_class_manifest)
            .await
            .map_err(|err| Error::new(CliError::Upload(format!("{err:#}"))))?;

        let pointer = Pointer {
            manifest_key: manifest_object_key.clone(),
            kind: manifest_kind,
            created_at: snapshot.timestamp.clone(),
        };
        let pointer_bytes = b2s_datastore::manifest::pointer_to_json(&pointer).context("failed to serialize pointer")?;
        let pointer_object_key = pointer_key(&config.prefix, &sv.name);
        uploader::put_small(s3, &pointer_object_key, Bytes::from(pointer_bytes), &config.storage_class_manifest)
            .await
            .map_err(|err| Error::new(CliError::Upload(format!("{err:#}"))))?;

        if let Err(err) = snapshot_mgr.prune(&sv.name, config.keep_count as usize, Some(&snapshot.path)) {
            log::warn!("subvolume {}: prune failed: {err:#}", sv.name);
        }

        let last_full_at = match manifest_kind {
            ManifestKind::Full => Some(now_unix()),
            ManifestKind::Incremental => sv_state.last_full_at,
        };

        Ok(Some(SubvolumeState {
            last_snapshot_name: Some(snapshot.name()),
            last_snapshot_path: Some(snapshot.path),
            last_manifest_key: Some(manifest_object_key),
            last_full_at,
        }))
    }
    .await;

    backup_metrics(&RunMetrics {
        subvol: &sv.name,
        kind: manifest_kind,
        total_bytes,
        elapsed_seconds: started.elapsed().as_secs_f64(),
    });

    result
}

/// Restores one subvolume into a fresh target (§4.9).
pub async fn run_restore(config: &Config, opts: &RestoreCliOptions<'_>) -> Result<(), Error> {
    let _lock = lock::acquire(&config.lock_path).context("failed to acquire process lock")?;

    let started = Instant::now();
    let s3 = build_s3_client(config).await?;

    let manifest_object_key = match &opts.manifest_key {
        Some(key) => key.clone(),
        None => {
            let key = pointer_key(&config.prefix, opts.subvol);
            let bytes = s3.get_object_bytes(&key).await.with_context(|| {
                format!("failed to fetch pointer for subvolume {:?}", opts.subvol)
            })?;
            let pointer: Pointer = pointer_from_json(&bytes)?;
            pointer.manifest_key
        }
    };

    let manifest_bytes = s3
        .get_object_bytes(&manifest_object_key)
        .await
        .with_context(|| format!("failed to fetch manifest {manifest_object_key:?}"))?;
    let head_manifest = from_json(&manifest_bytes)?;

    let verify_mode = opts.verify_override.unwrap_or(config.verify);
    // The head manifest records the exact source-side snapshot path that was
    // streamed into it; that is the only meaningful diff target for the
    // verifier, not a path guessed from the subvolume name (§4.10).
    let reference_snapshot = std::path::PathBuf::from(&head_manifest.snapshot.path);

    let restore_opts = RestoreOptions {
        prefix: &config.prefix,
        subvol: opts.subvol,
        target: &opts.target,
        verify: verify_mode,
        reference_snapshot: if matches!(verify_mode, VerifyMode::None) {
            None
        } else {
            Some(reference_snapshot.as_path())
        },
        wait_for_restore: config.wait_for_restore,
        restore_timeout_seconds: config.restore_timeout_seconds,
        archive_tier: &config.archive_tier,
    };

    let total_bytes: u64 = head_manifest.total_bytes;
    let kind = head_manifest.kind;

    let restore_result = restore(&s3, head_manifest, &restore_opts).await;

    restore_metrics(&RunMetrics {
        subvol: opts.subvol,
        kind,
        total_bytes,
        elapsed_seconds: started.elapsed().as_secs_f64(),
    });

    restore_result?;
    Ok(())
}
