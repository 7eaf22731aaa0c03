//! CLI entry point (§6): two subcommands, `backup` and `restore`, sharing a
//! single process lock and configuration loader.

mod driver;
mod error;
mod metrics;
mod planner;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Error};
use b2s_api_types::VerifyMode;
use b2s_config::Config;
use clap::{Parser, Subcommand, ValueEnum};

use driver::{BackupOptions, RestoreCliOptions};
use error::exit_code_for;

#[derive(Parser)]
#[command(author, version, about = "Backs up and restores Btrfs subvolumes to S3")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Snapshot and upload due subvolumes, or all subvolumes with --once.
    Backup {
        /// Path to the TOML configuration file.
        #[arg(long)]
        config: PathBuf,
        /// Override the default log level for this invocation.
        #[arg(long, value_enum)]
        log_level: Option<LogLevel>,
        /// Evaluate the plan for every subvolume without snapshotting or uploading.
        #[arg(long)]
        dry_run: bool,
        /// Restrict the run to these subvolumes (repeatable). Default: all configured.
        #[arg(long = "subvolume")]
        subvolume: Vec<String>,
        /// Ignore the configured schedule and run every selected subvolume now.
        #[arg(long)]
        once: bool,
        /// Snapshot, stream and chunk locally but skip uploads and the pointer update.
        #[arg(long)]
        no_s3: bool,
    },
    /// Restore one subvolume into a fresh target directory.
    Restore {
        /// Path to the TOML configuration file.
        #[arg(long)]
        config: PathBuf,
        /// Override the default log level for this invocation.
        #[arg(long, value_enum)]
        log_level: Option<LogLevel>,
        /// Name of the subvolume to restore.
        #[arg(long)]
        subvolume: String,
        /// Destination path; must not already exist.
        #[arg(long)]
        target: PathBuf,
        /// Restore this exact manifest instead of following the subvolume's pointer.
        #[arg(long)]
        manifest_key: Option<String>,
        /// Override the configured verify mode for this run.
        #[arg(long, value_enum)]
        verify: Option<CliVerifyMode>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
            LogLevel::Critical => "error",
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum CliVerifyMode {
    None,
    Sample,
    Full,
}

impl From<CliVerifyMode> for VerifyMode {
    fn from(mode: CliVerifyMode) -> Self {
        match mode {
            CliVerifyMode::None => VerifyMode::None,
            CliVerifyMode::Sample => VerifyMode::Sample,
            CliVerifyMode::Full => VerifyMode::Full,
        }
    }
}

/// Initializes the `log` facade per §10.1: `BTRFS_TO_S3_LOG` seeds the
/// default filter, `--log-level` overrides it for this invocation.
fn init_logger(cli_override: Option<LogLevel>) {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("BTRFS_TO_S3_LOG", "info"),
    );
    if let Some(level) = cli_override {
        builder.filter_level(level.as_filter().parse().expect("valid log level filter"));
    }
    builder.init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = match &cli.command {
        Commands::Backup { log_level, .. } | Commands::Restore { log_level, .. } => *log_level,
    };
    init_logger(log_level);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to start async runtime: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:#}");
            eprintln!("Error: {err:#}");
            ExitCode::from(exit_code_for(&err) as u8)
        }
    }
}

async fn run(cli: Cli) -> Result<(), Error> {
    match cli.command {
        Commands::Backup {
            config,
            log_level: _,
            dry_run,
            subvolume,
            once,
            no_s3,
        } => {
            let config = load_config(&config)?;
            let opts = BackupOptions {
                dry_run,
                subvolume_filter: subvolume,
                once,
                no_s3,
            };
            driver::backup(&config, &opts).await
        }
        Commands::Restore {
            config,
            log_level: _,
            subvolume,
            target,
            manifest_key,
            verify,
        } => {
            let config = load_config(&config)?;
            let opts = RestoreCliOptions {
                subvol: &subvolume,
                target,
                manifest_key,
                verify_override: verify.map(VerifyMode::from),
            };
            driver::run_restore(&config, &opts).await
        }
    }
}

fn load_config(path: &std::path::Path) -> Result<Config, Error> {
    if !path.is_absolute() {
        return Err(error::CliError::Config(format!(
            "--config must be an absolute path, got {path:?}"
        )))
        .context("loading configuration");
    }
    Config::load(path).map_err(|err| {
        anyhow::Error::new(error::CliError::Config(format!("{err:#}")))
    })
}
