//! Command-line options

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::logs::LogLevel;
use crate::storage::settings::DEFAULT_SETTINGS_PATH;

/// Back up, update and roll back git-deployed systemd services
#[derive(Parser, Debug)]
#[command(name = "redeploy")]
#[command(version)]
pub struct Cli {
    /// Settings file
    #[arg(long, global = true, env = "REDEPLOY_CONFIG", default_value = DEFAULT_SETTINGS_PATH)]
    pub config: PathBuf,

    /// Deployment to act on; may be omitted when only one is configured
    #[arg(short, long, global = true)]
    pub deployment: Option<String>,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<LogLevel>,

    /// Emit JSON logs on stderr
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    #[command(flatten)]
    Deployment(DeploymentCommand),

    /// Print version, git hash and build time
    Version,
}

/// Commands that act on a configured deployment
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum DeploymentCommand {
    /// Back up, stop, fetch, apply, install, restart and verify
    Update,

    /// Show service liveness, revision, layout and the latest backup
    Status,

    /// List backups, newest first
    Backups,

    /// Put a backup back in place and restart the service
    Restore {
        /// Backup directory; defaults to the latest backup
        #[arg(short, long)]
        backup: Option<PathBuf>,
    },
}
