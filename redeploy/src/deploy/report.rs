//! Sequencer results and failures

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::deploy::backup::{CODE_DIR, SECRETS_DIR};
use crate::deploy::fsm::SequencerState;
use crate::errors::DeployError;
use crate::storage::layout::DeploymentLayout;

/// What a successful update did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UpdateOutcome {
    /// Local and remote revisions matched; nothing applied
    UpToDate { revision: String },

    /// Moved from one revision to another
    Updated { from: String, to: String },
}

/// Summary of a successful update
#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub deployment: String,
    pub outcome: UpdateOutcome,
    pub backup: PathBuf,
    /// Secret files copied back from the backup after restart
    pub healed: Vec<PathBuf>,
    pub history: Vec<SequencerState>,
}

/// Summary of a successful manual restore
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub deployment: String,
    pub backup: PathBuf,
    pub rollback: RollbackReport,
    pub healed: Vec<PathBuf>,
    pub history: Vec<SequencerState>,
}

/// Read-only view of a deployment
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub deployment: String,
    pub service: String,
    /// `None` when the process manager could not be asked
    pub active: Option<bool>,
    pub revision: Option<String>,
    pub root: PathBuf,
    pub code_dir: PathBuf,
    pub venv_dir: PathBuf,
    pub installed: bool,
    /// Each secret file and whether it is present in the code directory
    pub secrets: Vec<(PathBuf, bool)>,
    pub latest_backup: Option<PathBuf>,
}

/// What happened while putting the backup copy back in place
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RollbackReport {
    /// The code directory now holds the backup's copy
    pub restored: bool,

    /// Where the replaced (broken) tree was moved for inspection
    pub parked: Option<PathBuf>,

    /// Restored tree digest equals the manifest digest
    pub digest_matches: Option<bool>,

    /// Non-fatal problems (ownership, dependency reinstall, digest)
    pub problems: Vec<String>,
}

impl RollbackReport {
    /// Restored with no problems at all
    pub fn is_clean(&self) -> bool {
        self.restored && self.problems.is_empty()
    }

    fn summary(&self) -> String {
        if !self.restored {
            "rollback FAILED".to_string()
        } else if self.problems.is_empty() {
            "rolled back to backup".to_string()
        } else {
            format!("rolled back with problems: {}", self.problems.join("; "))
        }
    }
}

/// Terminal failures of the sequencer
#[derive(Error, Debug)]
pub enum SequencerError {
    #[error("{name} is not installed: {reason}")]
    NotInstalled { name: String, reason: String },

    #[error("deployment {0} requires running as root")]
    NotRoot(String),

    #[error("{0}")]
    Locked(String),

    #[error("backup failed: {0}")]
    BackupFailed(String),

    #[error("could not stop {service}: {reason}")]
    StopFailed {
        service: String,
        reason: String,
        backup: PathBuf,
    },

    #[error("fetch failed, service restarted unchanged: {reason}")]
    FetchFailed { reason: String, backup: PathBuf },

    #[error("applying the new revision failed ({}): {reason}", .rollback.summary())]
    ApplyFailed {
        reason: String,
        backup: PathBuf,
        rollback: RollbackReport,
    },

    #[error("installing dependencies failed ({}): {reason}", .rollback.summary())]
    InstallFailed {
        reason: String,
        backup: PathBuf,
        rollback: RollbackReport,
    },

    #[error("restoring the backup failed: {}", .rollback.summary())]
    RestoreFailed {
        backup: PathBuf,
        rollback: RollbackReport,
    },

    #[error("{service} is not running after restart{}", .cause.as_ref().map(|c| format!(" (after: {})", c)).unwrap_or_default())]
    StartupFailed {
        service: String,
        backup: PathBuf,
        cause: Option<String>,
    },

    #[error("no backup to restore: {0}")]
    NoBackup(String),

    #[error(transparent)]
    Deploy(#[from] DeployError),
}

impl SequencerError {
    /// Backup kept for this attempt, when one was written
    pub fn backup_path(&self) -> Option<&Path> {
        match self {
            SequencerError::StopFailed { backup, .. }
            | SequencerError::FetchFailed { backup, .. }
            | SequencerError::ApplyFailed { backup, .. }
            | SequencerError::InstallFailed { backup, .. }
            | SequencerError::RestoreFailed { backup, .. }
            | SequencerError::StartupFailed { backup, .. } => Some(backup),
            _ => None,
        }
    }

    /// Whether the attempt stopped before touching anything
    pub fn is_untouched(&self) -> bool {
        matches!(
            self,
            SequencerError::NotInstalled { .. }
                | SequencerError::NotRoot(_)
                | SequencerError::Locked(_)
                | SequencerError::BackupFailed(_)
                | SequencerError::NoBackup(_)
        )
    }

    /// Operator instructions naming the backup and the exact files to copy back
    pub fn remediation(&self, layout: &DeploymentLayout, service: &str) -> Vec<String> {
        let mut lines = Vec::new();
        let Some(backup) = self.backup_path() else {
            if self.is_untouched() {
                lines.push("Nothing was changed.".to_string());
            }
            return lines;
        };

        let code_dir = layout.code_dir();
        lines.push(format!("Backup kept at: {}", backup.display()));
        lines.push(format!(
            "Code snapshot: {} -> {}",
            backup.join(CODE_DIR).display(),
            code_dir.path().display()
        ));
        // Only the secrets the backup actually captured
        for rel in layout.secret_files() {
            let saved = backup.join(SECRETS_DIR).join(rel);
            if !saved.is_file() {
                continue;
            }
            lines.push(format!(
                "Secret file:   {} -> {}",
                saved.display(),
                code_dir.path().join(rel).display()
            ));
        }
        lines.push(format!(
            "Restore everything with: redeploy --deployment {} restore --backup {}",
            layout.name,
            backup.display()
        ));
        if matches!(self, SequencerError::StartupFailed { .. }) {
            lines.push(format!(
                "Inspect the service with: systemctl status {} ; journalctl -u {} -n 100",
                service, service
            ));
        }
        lines
    }
}
