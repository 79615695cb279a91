//! Process manager access

use async_trait::async_trait;
use tracing::info;

use crate::deploy::command::CommandRunner;
use crate::errors::DeployError;

/// The supervisor that runs a deployment's service
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Stop the unit; stopping a stopped unit succeeds
    async fn stop(&self, unit: &str) -> Result<(), DeployError>;

    /// Start the unit; starting a running unit succeeds
    async fn start(&self, unit: &str) -> Result<(), DeployError>;

    /// Liveness check
    async fn is_active(&self, unit: &str) -> Result<bool, DeployError>;
}

/// systemd via `systemctl`
#[derive(Debug, Clone, Default)]
pub struct Systemd {
    runner: CommandRunner,
}

impl Systemd {
    pub fn new(runner: CommandRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ServiceManager for Systemd {
    async fn stop(&self, unit: &str) -> Result<(), DeployError> {
        info!("Stopping {}", unit);
        let mut cmd = self.runner.command("systemctl");
        cmd.args(["stop", unit]);
        self.runner
            .output(cmd)
            .await
            .map_err(|e| DeployError::ServiceError(e.to_string()))?;
        Ok(())
    }

    async fn start(&self, unit: &str) -> Result<(), DeployError> {
        info!("Starting {}", unit);
        let mut cmd = self.runner.command("systemctl");
        cmd.args(["start", unit]);
        self.runner
            .output(cmd)
            .await
            .map_err(|e| DeployError::ServiceError(e.to_string()))?;
        Ok(())
    }

    async fn is_active(&self, unit: &str) -> Result<bool, DeployError> {
        let mut cmd = self.runner.command("systemctl");
        cmd.args(["is-active", "--quiet", unit]);
        self.runner.succeeds(cmd).await
    }
}
