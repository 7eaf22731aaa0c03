//! Error taxonomy for the `btrfs-to-s3` binary (§7): a closed set of
//! operator-facing failure categories, each mapped to one of the exit codes
//! listed in §6.
//!
//! Library code below this binary (`b2s-client`, `b2s-datastore`,
//! `b2s-config`) returns plain `anyhow::Result`. At the edge, `main` downcasts
//! the terminal error looking for one of these variants to pick an exit code,
//! and falls back to the generic failure code when the error carries no such
//! marker (§10.2).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("another instance holds the lock at {path}")]
    LockHeld { path: String },

    #[error("lock file at {path} is stale but could not be cleared: {reason}")]
    LockStale { path: String, reason: String },

    #[error("snapshot operation failed: {0}")]
    Snapshot(String),

    #[error("btrfs send failed: {0}")]
    Send(String),

    #[error("btrfs receive failed: {0}")]
    Receive(String),

    #[error("upload to S3 failed: {0}")]
    Upload(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("timed out waiting for archive-tier restore readiness: {0}")]
    RestoreReadinessTimeout(String),

    #[error("precondition not met: {0}")]
    Precondition(String),
}

impl CliError {
    /// Maps a terminal error to one of the exit codes in §6.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) => 2,
            CliError::LockHeld { .. } | CliError::LockStale { .. } => 3,
            CliError::Snapshot(_) | CliError::Send(_) | CliError::Receive(_) => 4,
            CliError::Upload(_) => 5,
            CliError::Integrity(_) => 6,
            CliError::RestoreReadinessTimeout(_) => 7,
            CliError::Precondition(_) => 1,
        }
    }
}

/// Walks an `anyhow::Error`'s downcast chain looking for a [`CliError`] or
/// one of the marker error types raised at the point of failure inside
/// `b2s-client`/`b2s-config` (§10.2), returning the generic-failure exit
/// code (1) when none is found — an error that isn't one of the named
/// categories is still a failure, just an unclassified one.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(cli_err) = cause.downcast_ref::<CliError>() {
            return cli_err.exit_code();
        }
        if cause.downcast_ref::<b2s_client::restore::PreconditionFailed>().is_some() {
            return 1;
        }
        if cause.downcast_ref::<b2s_client::restore::IntegrityMismatch>().is_some() {
            return 6;
        }
        if cause.downcast_ref::<b2s_client::restore::RestoreReadinessTimeout>().is_some() {
            return 7;
        }
        if cause.downcast_ref::<b2s_config::lock::LockHeld>().is_some() {
            return 3;
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn exit_code_matches_table() {
        assert_eq!(CliError::Config("x".into()).exit_code(), 2);
        assert_eq!(CliError::LockHeld { path: "/x".into() }.exit_code(), 3);
        assert_eq!(CliError::Send("x".into()).exit_code(), 4);
        assert_eq!(CliError::Upload("x".into()).exit_code(), 5);
        assert_eq!(CliError::Integrity("x".into()).exit_code(), 6);
        assert_eq!(CliError::RestoreReadinessTimeout("x".into()).exit_code(), 7);
    }

    #[test]
    fn exit_code_for_walks_downcast_chain() {
        let err = anyhow!(CliError::Upload("boom".into())).context("uploading chunk 3");
        assert_eq!(exit_code_for(&err), 5);
    }

    #[test]
    fn exit_code_for_defaults_to_one_for_unclassified_errors() {
        let err = anyhow!("something unexpected");
        assert_eq!(exit_code_for(&err), 1);
    }
}
