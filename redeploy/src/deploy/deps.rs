//! Dependency environment refresh

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use crate::deploy::command::CommandRunner;
use crate::errors::DeployError;
use crate::filesys::file::File;

/// Brings the dependency environment in line with the code's manifest
#[async_trait]
pub trait DependencyInstaller: Send + Sync {
    async fn install(&self) -> Result<(), DeployError>;
}

/// `pip install -r <manifest>` with the deployment's venv
#[derive(Debug, Clone)]
pub struct PipInstaller {
    runner: CommandRunner,
    pip: PathBuf,
    requirements: File,
    work_dir: PathBuf,
}

impl PipInstaller {
    pub fn new(
        runner: CommandRunner,
        pip: impl Into<PathBuf>,
        requirements: File,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            pip: pip.into(),
            requirements,
            work_dir: work_dir.into(),
        }
    }
}

#[async_trait]
impl DependencyInstaller for PipInstaller {
    async fn install(&self) -> Result<(), DeployError> {
        if !self.requirements.exists().await {
            info!(
                "No dependency manifest at {}, skipping install",
                self.requirements.path().display()
            );
            return Ok(());
        }

        info!("Installing dependencies from {}", self.requirements.path().display());
        let mut cmd = self.runner.command(&self.pip);
        cmd.current_dir(&self.work_dir)
            .args(["install", "--quiet", "--disable-pip-version-check", "-r"])
            .arg(self.requirements.path());
        self.runner.output(cmd).await?;
        Ok(())
    }
}
