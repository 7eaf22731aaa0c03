//! Exports configuration data from the build system

pub const BTRFS_TO_S3_PKG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION_MAJOR"),
    ".",
    env!("CARGO_PKG_VERSION_MINOR"),
);
pub const BTRFS_TO_S3_PKG_RELEASE: &str = env!("CARGO_PKG_VERSION_PATCH");
pub const BTRFS_TO_S3_PKG_REPOID: &str = env!("REPOID");

/// The default configuration file location, used when `--config` is not given.
pub const CONFIGDIR: &str = "/etc/btrfs-to-s3";

#[macro_export]
macro_rules! BTRFS_TO_S3_RUN_DIR_M {
    () => {
        "/run/btrfs-to-s3"
    };
}

#[macro_export]
macro_rules! BTRFS_TO_S3_STATE_DIR_M {
    () => {
        "/var/lib/btrfs-to-s3"
    };
}

#[macro_export]
macro_rules! BTRFS_TO_S3_LOG_DIR_M {
    () => {
        "/var/log/btrfs-to-s3"
    };
}

/// namespaced directory for in-memory (tmpfs) run state, e.g. the lock file
pub const BTRFS_TO_S3_RUN_DIR: &str = BTRFS_TO_S3_RUN_DIR_M!();

/// namespaced directory for persistent state, e.g. the state JSON document
pub const BTRFS_TO_S3_STATE_DIR: &str = BTRFS_TO_S3_STATE_DIR_M!();

/// namespaced directory for persistent logging
pub const BTRFS_TO_S3_LOG_DIR: &str = BTRFS_TO_S3_LOG_DIR_M!();

/// default path of the process lock file (§4.1)
pub const DEFAULT_LOCK_PATH: &str = concat!(BTRFS_TO_S3_RUN_DIR_M!(), "/btrfs-to-s3.lock");

/// default path of the persisted local state document (§4.2)
pub const DEFAULT_STATE_PATH: &str = concat!(BTRFS_TO_S3_STATE_DIR_M!(), "/state.json");

/// Prepend the configuration directory to a file name.
#[macro_export]
macro_rules! configdir {
    ($subdir:expr) => {
        concat!("/etc/btrfs-to-s3", $subdir)
    };
}

/// Prepend the run directory to a file name.
#[macro_export]
macro_rules! rundir {
    ($subdir:expr) => {
        concat!($crate::BTRFS_TO_S3_RUN_DIR_M!(), $subdir)
    };
}
