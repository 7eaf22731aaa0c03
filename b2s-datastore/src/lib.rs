//! Snapshot management, chunking, retention, and the manifest/object-layout
//! helpers that together form the data-storage layer of `btrfs_to_s3`.
//!
//! # Data model
//!
//! A backup generation is a *manifest*: a JSON document naming a snapshot,
//! the ordered list of fixed-size chunks the snapshot's `btrfs send` stream
//! was split into, and — for an incremental manifest — the object key of the
//! manifest it extends. Chunks are content-addressed only by their position
//! in the stream (`ordinal`) and their SHA-256; unlike a deduplicating
//! chunk store, nothing here reuses a chunk across manifests, since each
//! `btrfs send` stream is unique to its snapshot pair.
//!
//! # Locking
//!
//! Unlike a server that must arbitrate between concurrent garbage
//! collection, prune, and backup-creation operations, `btrfs_to_s3` is a
//! single-host, single-run-at-a-time tool: the process lock in
//! [`b2s_config::lock`] is the only synchronization primitive, and it is
//! held for the whole duration of a backup or restore run.

pub mod chunker;
pub mod manifest;
pub mod prune;
pub mod snapshot;

pub use chunker::{ChunkCursor, Chunker};
pub use prune::PruneMark;
pub use snapshot::SnapshotManager;
