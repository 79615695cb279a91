//! Command dispatch and operator output

use std::path::Path;

use colored::Colorize;
use tracing::error;

use crate::app::options::DeploymentCommand;
use crate::deploy::report::{SequencerError, StatusReport, UpdateOutcome};
use crate::deploy::sequencer::Sequencer;
use crate::storage::settings::DeploymentConfig;
use crate::utils;

/// Process exit codes
pub const EXIT_OK: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG: u8 = 2;

/// Run one command against one deployment and return the exit code
pub async fn run(command: &DeploymentCommand, deployment: &DeploymentConfig) -> u8 {
    let sequencer = match Sequencer::from_config(deployment) {
        Ok(sequencer) => sequencer,
        Err(e) => {
            error!("Cannot set up {}: {}", deployment.name, e);
            print_error(&e.to_string());
            return EXIT_CONFIG;
        }
    };

    match command {
        DeploymentCommand::Update => update(&sequencer).await,
        DeploymentCommand::Status => status(&sequencer).await,
        DeploymentCommand::Backups => backups(&sequencer).await,
        DeploymentCommand::Restore { backup } => restore(&sequencer, backup.as_deref()).await,
    }
}

async fn update(sequencer: &Sequencer) -> u8 {
    let name = &sequencer.config().name;
    match sequencer.update().await {
        Ok(report) => {
            match &report.outcome {
                UpdateOutcome::UpToDate { revision } => print_ok(&format!(
                    "{}: no updates available ({})",
                    name,
                    utils::short_rev(revision)
                )),
                UpdateOutcome::Updated { from, to } => print_ok(&format!(
                    "{}: updated {} -> {}",
                    name,
                    utils::short_rev(from),
                    utils::short_rev(to)
                )),
            }
            for rel in &report.healed {
                print_warn(&format!("{} was missing and was restored from the backup", rel.display()));
            }
            println!("Backup: {}", report.backup.display());
            EXIT_OK
        }
        Err(e) => fail(sequencer, &e),
    }
}

async fn restore(sequencer: &Sequencer, backup: Option<&Path>) -> u8 {
    match sequencer.restore(backup).await {
        Ok(report) => {
            print_ok(&format!(
                "{}: restored {}",
                report.deployment,
                report.backup.display()
            ));
            if let Some(parked) = &report.rollback.parked {
                println!("Replaced tree kept at: {}", parked.display());
            }
            for problem in &report.rollback.problems {
                print_warn(problem);
            }
            for rel in &report.healed {
                print_warn(&format!("{} was missing and was restored from the backup", rel.display()));
            }
            EXIT_OK
        }
        Err(e) => fail(sequencer, &e),
    }
}

async fn status(sequencer: &Sequencer) -> u8 {
    let report = sequencer.status().await;
    print!("{}", format_status(&report));
    if report.installed && report.active == Some(true) {
        EXIT_OK
    } else {
        EXIT_FAILURE
    }
}

async fn backups(sequencer: &Sequencer) -> u8 {
    let backups = match sequencer.backups().list().await {
        Ok(backups) => backups,
        Err(e) => {
            print_error(&format!("Could not list backups: {}", e));
            return EXIT_FAILURE;
        }
    };

    if backups.is_empty() {
        println!(
            "No backups of {} in {}",
            sequencer.config().name,
            sequencer.backups().root().path().display()
        );
        return EXIT_OK;
    }

    for backup in backups {
        let manifest = backup.manifest();
        let secrets: Vec<String> = manifest
            .secret_files
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        println!(
            "{}  {:<10}  [{}]  {}",
            manifest.stamp,
            manifest.revision.as_deref().map(utils::short_rev).unwrap_or("-"),
            secrets.join(", "),
            backup.path().display()
        );
    }
    EXIT_OK
}

fn fail(sequencer: &Sequencer, err: &SequencerError) -> u8 {
    print_error(&err.to_string());
    for line in err.remediation(sequencer.layout(), &sequencer.config().service) {
        eprintln!("  {}", line);
    }
    EXIT_FAILURE
}

/// Human-readable status block
pub fn format_status(report: &StatusReport) -> String {
    let service = match report.active {
        Some(true) => "active".green().to_string(),
        Some(false) => "inactive".red().to_string(),
        None => "unknown".yellow().to_string(),
    };

    let mut out = String::new();
    out.push_str(&format!("Deployment:  {}\n", report.deployment));
    out.push_str(&format!("Service:     {} ({})\n", report.service, service));
    out.push_str(&format!(
        "Revision:    {}\n",
        report.revision.as_deref().unwrap_or("-")
    ));
    out.push_str(&format!("Root:        {}\n", report.root.display()));
    out.push_str(&format!("Code:        {}\n", report.code_dir.display()));
    out.push_str(&format!("Venv:        {}\n", report.venv_dir.display()));
    if !report.installed {
        out.push_str(&format!("             {}\n", "not installed".red()));
    }
    for (rel, present) in &report.secrets {
        let mark = if *present { "present".green() } else { "missing".yellow() };
        out.push_str(&format!("Secret:      {} ({})\n", rel.display(), mark));
    }
    out.push_str(&format!(
        "Last backup: {}\n",
        report
            .latest_backup
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "none".to_string())
    ));
    out
}

pub fn print_version() {
    let version = utils::version_info();
    println!("redeploy {}", version.version);
    println!("Git hash: {}", version.git_hash);
    println!("Build time: {}", version.build_time);
}

pub fn print_ok(message: &str) {
    println!("{} {}", "[OK]".green().bold(), message);
}

pub fn print_warn(message: &str) {
    eprintln!("{} {}", "[WARN]".yellow().bold(), message);
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "[ERROR]".red().bold(), message);
}
