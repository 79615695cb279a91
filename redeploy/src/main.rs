//! redeploy - Entry Point
//!
//! Updates a git-deployed service in place, with a backup taken first and an
//! automatic rollback when the new revision cannot be applied or installed.

use std::process::ExitCode;

use clap::Parser;
use tracing::{debug, error};

use redeploy::app::options::{Cli, Commands};
use redeploy::app::run::{self, print_error, EXIT_CONFIG};
use redeploy::logs::{init_logging, LogOptions};
use redeploy::storage::settings::Settings;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let command = match &cli.command {
        Commands::Version => {
            run::print_version();
            return ExitCode::SUCCESS;
        }
        Commands::Deployment(command) => command,
    };

    let settings = match Settings::load(&cli.config).await {
        Ok(settings) => settings,
        Err(e) => {
            print_error(&e.to_string());
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let log_options = LogOptions {
        log_level: cli.log_level.clone().unwrap_or(settings.log_level.clone()),
        json_format: cli.json_logs || settings.log_format_json,
        log_dir: settings.log_dir.clone(),
    };
    let _guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };
    debug!("Loaded settings from {}", cli.config.display());

    let deployment = match settings.deployment(cli.deployment.as_deref()) {
        Ok(deployment) => deployment,
        Err(e) => {
            error!("{}", e);
            print_error(&e.to_string());
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    ExitCode::from(run::run(command, deployment).await)
}
