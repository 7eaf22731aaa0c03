//! Client-side pipeline pieces shared by the `btrfs-to-s3` binary: the
//! `btrfs send`/`receive` subprocess wrappers, the S3 primitives, the
//! multipart uploader, and the restore/verify engines.

pub mod restore;
pub mod s3;
pub mod streamer;
pub mod uploader;
pub mod verifier;
