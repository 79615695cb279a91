//! Git revision handling

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::deploy::command::CommandRunner;
use crate::errors::DeployError;

/// Version control operations on the deployment's working tree
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Download the latest remote revision without touching the working tree
    async fn fetch(&self) -> Result<(), DeployError>;

    /// Revision checked out in the working tree
    async fn current_revision(&self) -> Result<String, DeployError>;

    /// Revision fetched from the tracked remote branch
    async fn remote_revision(&self) -> Result<String, DeployError>;

    /// Move the working tree to the fetched revision
    async fn apply_fetched(&self) -> Result<(), DeployError>;
}

/// `git` CLI working on one checkout and one tracked branch
#[derive(Debug, Clone)]
pub struct Git {
    runner: CommandRunner,
    work_dir: PathBuf,
    remote: String,
    branch: String,
}

impl Git {
    pub fn new(
        runner: CommandRunner,
        work_dir: impl Into<PathBuf>,
        remote: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            work_dir: work_dir.into(),
            remote: remote.into(),
            branch: branch.into(),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// `<remote>/<branch>`
    pub fn tracking_ref(&self) -> String {
        format!("{}/{}", self.remote, self.branch)
    }

    async fn git(&self, args: &[&str]) -> Result<String, DeployError> {
        let mut cmd = self.runner.command("git");
        cmd.current_dir(&self.work_dir).args(args);
        self.runner.output(cmd).await
    }
}

#[async_trait]
impl VersionControl for Git {
    async fn fetch(&self) -> Result<(), DeployError> {
        info!("Fetching {} {}", self.remote, self.branch);
        self.git(&["fetch", "--quiet", &self.remote, &self.branch]).await?;
        Ok(())
    }

    async fn current_revision(&self) -> Result<String, DeployError> {
        self.git(&["rev-parse", "HEAD"]).await
    }

    async fn remote_revision(&self) -> Result<String, DeployError> {
        let tracking = self.tracking_ref();
        self.git(&["rev-parse", &tracking]).await
    }

    async fn apply_fetched(&self) -> Result<(), DeployError> {
        let tracking = self.tracking_ref();
        debug!("Fast-forwarding {} to {}", self.work_dir.display(), tracking);
        self.git(&["merge", "--ff-only", "--quiet", &tracking]).await?;
        Ok(())
    }
}
