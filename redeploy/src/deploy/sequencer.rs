//! Deploy-update sequencer
//!
//! Drives one deployment through backup, stop, fetch, apply, install, restart
//! and verify, rolling the code directory back to the backup copy when apply
//! or install fails. The service is started again on every path that got past
//! the backup.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::deploy::backup::{self, Backup, BackupStore};
use crate::deploy::command::CommandRunner;
use crate::deploy::deps::{DependencyInstaller, PipInstaller};
use crate::deploy::fsm::{SequencerEvent, SequencerFsm, SequencerState};
use crate::deploy::git::{Git, VersionControl};
use crate::deploy::report::{
    RestoreReport, RollbackReport, SequencerError, StatusReport, UpdateOutcome, UpdateReport,
};
use crate::deploy::service::{ServiceManager, Systemd};
use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::filesys::lock::DeploymentLock;
use crate::identity::{self, Identity};
use crate::storage::layout::DeploymentLayout;
use crate::storage::settings::DeploymentConfig;
use crate::utils;

/// Failure of a single external step
#[derive(Error, Debug)]
pub enum StepError {
    #[error("{step} failed: {source}")]
    Failed {
        step: &'static str,
        #[source]
        source: DeployError,
    },

    #[error("{step} timed out after {}s", .after.as_secs())]
    TimedOut { step: &'static str, after: Duration },
}

/// Await `fut`, giving up after `limit`. The dropped future kills its child process.
pub async fn run_step<T, F>(step: &'static str, limit: Duration, fut: F) -> Result<T, StepError>
where
    F: Future<Output = Result<T, DeployError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(StepError::Failed { step, source }),
        Err(_) => Err(StepError::TimedOut { step, after: limit }),
    }
}

/// Updates and restores one deployment
pub struct Sequencer {
    config: DeploymentConfig,
    layout: DeploymentLayout,
    identity: Option<Identity>,
    service: Arc<dyn ServiceManager>,
    vcs: Arc<dyn VersionControl>,
    installer: Arc<dyn DependencyInstaller>,
    backups: BackupStore,
    fsm: RwLock<SequencerFsm>,
}

impl Sequencer {
    /// Create a sequencer with explicit collaborators
    pub fn new(
        config: DeploymentConfig,
        identity: Option<Identity>,
        service: Arc<dyn ServiceManager>,
        vcs: Arc<dyn VersionControl>,
        installer: Arc<dyn DependencyInstaller>,
    ) -> Self {
        let layout = DeploymentLayout::from_config(&config);
        let backups = BackupStore::new(&layout);
        Self {
            config,
            layout,
            identity,
            service,
            vcs,
            installer,
            backups,
            fsm: RwLock::new(SequencerFsm::new()),
        }
    }

    /// systemd, git and pip wired up from the deployment config.
    ///
    /// git and pip run as the deploying user; systemctl runs as the invoking user.
    pub fn from_config(config: &DeploymentConfig) -> Result<Self, DeployError> {
        let identity = Identity::from_config(config.user.as_deref(), config.group.as_deref())?;
        let layout = DeploymentLayout::from_config(config);
        let runner = CommandRunner::new(identity.clone());
        let code_dir = layout.code_dir().path().to_path_buf();

        let service = Arc::new(Systemd::new(CommandRunner::default()));
        let vcs = Arc::new(Git::new(
            runner.clone(),
            &code_dir,
            &config.remote,
            &config.branch,
        ));
        let installer = Arc::new(PipInstaller::new(
            runner,
            layout.pip(),
            layout.requirements_file(),
            &code_dir,
        ));

        Ok(Self::new(config.clone(), identity, service, vcs, installer))
    }

    pub fn config(&self) -> &DeploymentConfig {
        &self.config
    }

    pub fn layout(&self) -> &DeploymentLayout {
        &self.layout
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// Current state of the last (or running) attempt
    pub async fn state(&self) -> SequencerState {
        self.fsm.read().await.state()
    }

    /// States visited by the last attempt
    pub async fn history(&self) -> Vec<SequencerState> {
        self.fsm.read().await.history().to_vec()
    }

    /// Service liveness, revision, secrets and latest backup; changes nothing
    pub async fn status(&self) -> StatusReport {
        let timeouts = &self.config.timeouts;
        let active = run_step("is-active", timeouts.service(), self.service.is_active(&self.config.service))
            .await
            .map_err(|e| warn!("Could not query {}: {}", self.config.service, e))
            .ok();
        let installed = self.validate_layout().await.is_ok();
        let revision = if installed {
            run_step("rev-parse", timeouts.fetch(), self.vcs.current_revision())
                .await
                .map_err(|e| warn!("Could not read the current revision: {}", e))
                .ok()
        } else {
            None
        };

        let mut secrets = Vec::new();
        for rel in self.layout.secret_files() {
            secrets.push((rel.clone(), self.layout.secret_file(rel).exists().await));
        }

        let latest_backup = match self.backups.latest().await {
            Ok(latest) => latest.map(|b| b.path().to_path_buf()),
            Err(e) => {
                warn!("Could not list backups: {}", e);
                None
            }
        };

        StatusReport {
            deployment: self.config.name.clone(),
            service: self.config.service.clone(),
            active,
            revision,
            root: self.layout.root.clone(),
            code_dir: self.layout.code_dir().path().to_path_buf(),
            venv_dir: self.layout.venv_dir().path().to_path_buf(),
            installed,
            secrets,
            latest_backup,
        }
    }

    /// Update the deployment to the remote revision
    pub async fn update(&self) -> Result<UpdateReport, SequencerError> {
        let span = info_span!(
            "update",
            deployment = %self.config.name,
            attempt = %utils::generate_uuid()
        );
        async {
            let result = self.run_update().await;
            match &result {
                Ok(report) => info!("Update finished: {:?}", report.outcome),
                Err(e) => self.log_failure("Update", e),
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Put a backup back in place: the given one, or the latest
    pub async fn restore(&self, backup: Option<&Path>) -> Result<RestoreReport, SequencerError> {
        let span = info_span!(
            "restore",
            deployment = %self.config.name,
            attempt = %utils::generate_uuid()
        );
        async {
            let result = self.run_restore(backup).await;
            match &result {
                Ok(report) => info!("Restored {}", report.backup.display()),
                Err(e) => self.log_failure("Restore", e),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_update(&self) -> Result<UpdateReport, SequencerError> {
        *self.fsm.write().await = SequencerFsm::new();
        let timeouts = self.config.timeouts.clone();

        self.advance(SequencerEvent::Validate).await;
        let _lock = match self.validate().await {
            Ok(lock) => lock,
            Err(e) => {
                self.advance(SequencerEvent::Fail(e.to_string())).await;
                return Err(e);
            }
        };
        self.advance(SequencerEvent::Validated).await;

        let before = match run_step("rev-parse", timeouts.fetch(), self.vcs.current_revision()).await {
            Ok(rev) => Some(rev),
            Err(e) => {
                warn!("Could not read the current revision: {}", e);
                None
            }
        };
        let backup = match self.backups.create(before).await {
            Ok(backup) => backup,
            Err(e) => {
                self.advance(SequencerEvent::Fail(e.to_string())).await;
                return Err(SequencerError::BackupFailed(e.to_string()));
            }
        };
        let backup_path = backup.path().to_path_buf();

        if let Err(e) = run_step("stop", timeouts.service(), self.service.stop(&self.config.service)).await {
            error!("Could not stop {}, leaving the code untouched: {}", self.config.service, e);
            self.advance(SequencerEvent::Restart).await;
            let failure = SequencerError::StopFailed {
                service: self.config.service.clone(),
                reason: e.to_string(),
                backup: backup_path,
            };
            return Err(self.restart_after_failure(&backup, failure).await);
        }
        self.advance(SequencerEvent::ServiceStopped).await;

        self.advance(SequencerEvent::Fetch).await;
        let (local, remote) = match self.fetch_revisions().await {
            Ok(revisions) => revisions,
            Err(e) => {
                error!("Fetch failed, restarting unchanged: {}", e);
                self.advance(SequencerEvent::Restart).await;
                let failure = SequencerError::FetchFailed {
                    reason: e.to_string(),
                    backup: backup_path,
                };
                return Err(self.restart_after_failure(&backup, failure).await);
            }
        };

        if local == remote {
            info!("No updates available ({})", utils::short_rev(&local));
            self.advance(SequencerEvent::Restart).await;
            let healed = self.finish(&backup).await?;
            return Ok(UpdateReport {
                deployment: self.config.name.clone(),
                outcome: UpdateOutcome::UpToDate { revision: local },
                backup: backup_path,
                healed,
                history: self.history().await,
            });
        }

        info!(
            "Updating {} -> {}",
            utils::short_rev(&local),
            utils::short_rev(&remote)
        );
        self.advance(SequencerEvent::Apply).await;
        if let Err(e) = run_step("apply", timeouts.apply(), self.vcs.apply_fetched()).await {
            error!("Applying {} failed: {}", utils::short_rev(&remote), e);
            self.advance(SequencerEvent::RollBack).await;
            let rollback = self.roll_back(&backup, false).await;
            self.advance(SequencerEvent::Restart).await;
            let failure = SequencerError::ApplyFailed {
                reason: e.to_string(),
                backup: backup_path,
                rollback,
            };
            return Err(self.restart_after_failure(&backup, failure).await);
        }

        self.advance(SequencerEvent::Install).await;
        if let Err(e) = run_step("install", timeouts.install(), self.installer.install()).await {
            error!("Dependency install failed: {}", e);
            self.advance(SequencerEvent::RollBack).await;
            let rollback = self.roll_back(&backup, true).await;
            self.advance(SequencerEvent::Restart).await;
            let failure = SequencerError::InstallFailed {
                reason: e.to_string(),
                backup: backup_path,
                rollback,
            };
            return Err(self.restart_after_failure(&backup, failure).await);
        }

        self.advance(SequencerEvent::Restart).await;
        let healed = self.finish(&backup).await?;
        Ok(UpdateReport {
            deployment: self.config.name.clone(),
            outcome: UpdateOutcome::Updated {
                from: local,
                to: remote,
            },
            backup: backup_path,
            healed,
            history: self.history().await,
        })
    }

    async fn run_restore(&self, requested: Option<&Path>) -> Result<RestoreReport, SequencerError> {
        *self.fsm.write().await = SequencerFsm::for_restore();

        self.advance(SequencerEvent::Validate).await;
        let (_lock, backup) = match self.validate_restore(requested).await {
            Ok(ready) => ready,
            Err(e) => {
                self.advance(SequencerEvent::Fail(e.to_string())).await;
                return Err(e);
            }
        };
        let backup_path = backup.path().to_path_buf();
        info!("Restoring from {}", backup_path.display());

        let timeouts = self.config.timeouts.clone();
        if let Err(e) = run_step("stop", timeouts.service(), self.service.stop(&self.config.service)).await {
            error!("Could not stop {}, leaving the code untouched: {}", self.config.service, e);
            self.advance(SequencerEvent::Restart).await;
            let failure = SequencerError::StopFailed {
                service: self.config.service.clone(),
                reason: e.to_string(),
                backup: backup_path,
            };
            return Err(self.restart_after_failure(&backup, failure).await);
        }
        self.advance(SequencerEvent::ServiceStopped).await;

        self.advance(SequencerEvent::RollBack).await;
        let rollback = self.roll_back(&backup, true).await;
        self.advance(SequencerEvent::Restart).await;
        if !rollback.restored {
            let failure = SequencerError::RestoreFailed {
                backup: backup_path,
                rollback,
            };
            return Err(self.restart_after_failure(&backup, failure).await);
        }

        let healed = self.finish(&backup).await?;
        Ok(RestoreReport {
            deployment: self.config.name.clone(),
            backup: backup_path,
            rollback,
            healed,
            history: self.history().await,
        })
    }

    /// Preconditions for touching the deployment; returns the held lock
    async fn validate(&self) -> Result<DeploymentLock, SequencerError> {
        if self.config.require_root && !identity::is_root() {
            return Err(SequencerError::NotRoot(self.config.name.clone()));
        }
        self.validate_layout().await?;

        let lock = DeploymentLock::try_acquire(&self.layout.root).map_err(|e| match e {
            DeployError::LockError(message) => SequencerError::Locked(message),
            other => SequencerError::Deploy(other),
        })?;
        debug!("Validated {}", self.layout.root.display());
        Ok(lock)
    }

    /// Root, code directory, git checkout and venv are all present
    async fn validate_layout(&self) -> Result<(), SequencerError> {
        let code_dir = self.layout.code_dir();
        let venv_dir = self.layout.venv_dir();
        let checks = [
            (self.layout.root_dir().exists().await, "deployment root", self.layout.root.clone()),
            (code_dir.exists().await, "code directory", code_dir.path().to_path_buf()),
            (
                code_dir.file(".git").exists().await,
                "git checkout",
                code_dir.path().join(".git"),
            ),
            (venv_dir.exists().await, "dependency environment", venv_dir.path().to_path_buf()),
        ];
        for (present, what, path) in checks {
            if !present {
                return Err(SequencerError::NotInstalled {
                    name: self.config.name.clone(),
                    reason: format!("{} {} is missing", what, path.display()),
                });
            }
        }
        Ok(())
    }

    async fn validate_restore(
        &self,
        requested: Option<&Path>,
    ) -> Result<(DeploymentLock, Backup), SequencerError> {
        let lock = self.validate().await?;

        let backup = match requested {
            Some(path) => Backup::open(path)
                .await
                .map_err(|e| SequencerError::NoBackup(e.to_string()))?,
            None => self.backups.latest().await?.ok_or_else(|| {
                SequencerError::NoBackup(format!(
                    "no backups of {} in {}",
                    self.config.name,
                    self.backups.root().path().display()
                ))
            })?,
        };

        if backup.manifest().deployment != self.config.name {
            return Err(SequencerError::NoBackup(format!(
                "{} belongs to deployment {}",
                backup.path().display(),
                backup.manifest().deployment
            )));
        }

        Ok((lock, backup))
    }

    /// Fetch, then read the local and remote revisions
    async fn fetch_revisions(&self) -> Result<(String, String), StepError> {
        let limit = self.config.timeouts.fetch();
        run_step("fetch", limit, self.vcs.fetch()).await?;
        let local = run_step("rev-parse", limit, self.vcs.current_revision()).await?;
        let remote = run_step("rev-parse", limit, self.vcs.remote_revision()).await?;
        Ok((local, remote))
    }

    /// Replace the code directory wholesale with the backup's copy.
    ///
    /// The replaced tree is moved aside for inspection. Nothing here aborts the
    /// restart that follows; problems are collected in the report.
    async fn roll_back(&self, backup: &Backup, reinstall: bool) -> RollbackReport {
        let mut report = RollbackReport::default();
        let code_dir = self.layout.code_dir();
        let mut parked_dir = None;

        if code_dir.exists().await {
            let parked = self.layout.failed_code_dir(&utils::stamp(&Local::now()));
            match code_dir.rename_to(parked.path()).await {
                Ok(parked) => {
                    warn!("Moved the failed tree to {}", parked.path().display());
                    report.parked = Some(parked.path().to_path_buf());
                    parked_dir = Some(parked);
                }
                Err(e) => {
                    warn!("Could not move the failed tree aside ({}), removing it", e);
                    if let Err(e) = code_dir.delete().await {
                        error!("Could not remove {}: {}", code_dir.path().display(), e);
                        report.problems.push(format!("could not clear the code directory: {}", e));
                        return report;
                    }
                }
            }
        }

        match backup.code_dir().copy_to(code_dir.path()).await {
            Ok(bytes) => {
                info!(
                    "Restored {} from {} ({} bytes)",
                    code_dir.path().display(),
                    backup.path().display(),
                    bytes
                );
                report.restored = true;
            }
            Err(e) => {
                error!("Copying the backup into place failed: {}", e);
                report.problems.push(format!("copy from backup failed: {}", e));
                if let Some(parked) = parked_dir {
                    unpark(&code_dir, &parked, &mut report).await;
                }
                return report;
            }
        }

        if let Some(identity) = &self.identity {
            if let Err(e) = code_dir.chown_recursive(identity).await {
                error!("Could not hand {} to {}: {}", code_dir.path().display(), identity.user, e);
                report.problems.push(format!("ownership reset failed: {}", e));
            }
        }

        match code_dir.tree_digest().await {
            Ok(digest) if digest == backup.manifest().code_digest => {
                report.digest_matches = Some(true);
            }
            Ok(_) => {
                error!("Restored tree does not match the backup digest");
                report.digest_matches = Some(false);
                report.problems.push("restored tree digest differs from the backup".to_string());
            }
            Err(e) => {
                error!("Could not digest the restored tree: {}", e);
                report.problems.push(format!("digest check failed: {}", e));
            }
        }

        if reinstall {
            info!("Reinstalling dependencies for the restored code");
            if let Err(e) = run_step("reinstall", self.config.timeouts.install(), self.installer.install()).await {
                error!("Dependency reinstall after rollback failed: {}", e);
                report.problems.push(format!("dependency reinstall failed: {}", e));
            }
        }

        report
    }

    /// Start, heal, settle and verify; returns the healed files
    async fn finish(&self, backup: &Backup) -> Result<Vec<PathBuf>, SequencerError> {
        let (healed, down) = self.restart_and_check(backup).await;
        match down {
            None => {
                self.advance(SequencerEvent::Verify).await;
                Ok(healed)
            }
            Some(reason) => {
                self.advance(SequencerEvent::Fail(reason)).await;
                Err(SequencerError::StartupFailed {
                    service: self.config.service.clone(),
                    backup: backup.path().to_path_buf(),
                    cause: None,
                })
            }
        }
    }

    /// Same tail after an earlier failure; a dead service outranks `failure`
    async fn restart_after_failure(&self, backup: &Backup, failure: SequencerError) -> SequencerError {
        let (_, down) = self.restart_and_check(backup).await;
        match down {
            None => {
                self.advance(SequencerEvent::Verify).await;
                failure
            }
            Some(reason) => {
                self.advance(SequencerEvent::Fail(reason)).await;
                SequencerError::StartupFailed {
                    service: self.config.service.clone(),
                    backup: backup.path().to_path_buf(),
                    cause: Some(failure.to_string()),
                }
            }
        }
    }

    /// Returns the healed files and, if the service is not live, why
    async fn restart_and_check(&self, backup: &Backup) -> (Vec<PathBuf>, Option<String>) {
        let timeouts = &self.config.timeouts;
        let unit = &self.config.service;

        let start_error = run_step("start", timeouts.service(), self.service.start(unit))
            .await
            .err();
        if let Some(e) = &start_error {
            error!("Starting {} failed: {}", unit, e);
        }

        let healed = self.heal_secrets(backup).await;

        let settle = self.config.settle_delay();
        if !settle.is_zero() {
            debug!("Waiting {}s before checking {}", settle.as_secs(), unit);
            tokio::time::sleep(settle).await;
        }

        let down = match run_step("is-active", timeouts.service(), self.service.is_active(unit)).await {
            Ok(true) => {
                info!("{} is running", unit);
                None
            }
            Ok(false) => Some(match start_error {
                Some(e) => e.to_string(),
                None => format!("{} is not active", unit),
            }),
            Err(e) => Some(e.to_string()),
        };
        (healed, down)
    }

    /// Copy back any secret file that is missing from the live tree
    async fn heal_secrets(&self, backup: &Backup) -> Vec<PathBuf> {
        let mut healed = Vec::new();
        for rel in self.layout.secret_files() {
            let live = self.layout.secret_file(rel);
            if live.exists().await {
                continue;
            }
            let Some(copy) = backup.secret_file(rel) else {
                debug!("{} is absent and was not in the backup", rel.display());
                continue;
            };
            match self.put_back(copy.path(), live.path()).await {
                Ok(()) => {
                    warn!("{} was missing, restored from {}", live.path().display(), backup.path().display());
                    healed.push(rel.clone());
                }
                Err(e) => error!("Could not restore {}: {}", live.path().display(), e),
            }
        }
        healed
    }

    async fn put_back(&self, src: &Path, dest: &Path) -> Result<(), DeployError> {
        backup::copy_entry(src, dest).await?;
        if let Some(identity) = &self.identity {
            if tokio::fs::symlink_metadata(dest).await?.is_dir() {
                Dir::new(dest).chown_recursive(identity).await?;
            } else {
                File::new(dest).chown(identity).await?;
            }
        }
        Ok(())
    }

    async fn advance(&self, event: SequencerEvent) {
        let mut fsm = self.fsm.write().await;
        match fsm.process(event) {
            Ok(state) => debug!("Sequencer state: {:?}", state),
            Err(e) => error!("{}", e),
        }
    }

    fn log_failure(&self, action: &str, err: &SequencerError) {
        error!("{} failed: {}", action, err);
        match err.backup_path() {
            Some(path) => error!("Backup kept at {}", path.display()),
            None if err.is_untouched() => info!("Nothing was changed"),
            None => {}
        }
    }
}

/// Put the parked tree back after a failed copy so the restart has code to run
async fn unpark(code_dir: &Dir, parked: &Dir, report: &mut RollbackReport) {
    if let Err(e) = code_dir.delete().await {
        error!("Could not remove the partial copy {}: {}", code_dir.path().display(), e);
        report.problems.push(format!("could not remove the partial copy: {}", e));
        return;
    }
    match parked.rename_to(code_dir.path()).await {
        Ok(_) => {
            warn!(
                "Moved {} back into place; the service will run the failed tree",
                parked.path().display()
            );
            report.parked = None;
            report
                .problems
                .push("the failed tree was moved back into place".to_string());
        }
        Err(e) => {
            error!("Could not move {} back: {}", parked.path().display(), e);
            report.problems.push(format!("could not move the failed tree back: {}", e));
        }
    }
}
