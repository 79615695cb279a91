//! External command execution
//!
//! Every command the deployer runs goes through [`CommandRunner`], which applies
//! the configured identity and kills the child if the caller stops waiting.

use std::ffi::OsStr;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::errors::DeployError;
use crate::identity::Identity;

/// Builds and runs commands as a fixed identity
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    identity: Option<Identity>,
}

impl CommandRunner {
    /// Run commands as `identity`, or as the invoking user when `None`
    pub fn new(identity: Option<Identity>) -> Self {
        Self { identity }
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// A command preconfigured with the runner's identity, no stdin and kill-on-drop
    pub fn command(&self, program: impl AsRef<OsStr>) -> Command {
        let mut cmd = Command::new(program);
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        if let Some(identity) = &self.identity {
            cmd.uid(identity.uid)
                .gid(identity.gid)
                .env("HOME", &identity.home)
                .env("USER", &identity.user)
                .env("LOGNAME", &identity.user);
        }
        cmd
    }

    /// Run to completion and return trimmed stdout; a non-zero exit is an error
    pub async fn output(&self, mut cmd: Command) -> Result<String, DeployError> {
        let label = describe(&cmd);
        debug!("Running {}", label);

        let output = cmd
            .output()
            .await
            .map_err(|e| DeployError::CommandError(format!("Failed to run {}: {}", label, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DeployError::CommandError(format!(
                "{} exited with {}: {}",
                label,
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Run to completion and report only whether it exited successfully
    pub async fn succeeds(&self, mut cmd: Command) -> Result<bool, DeployError> {
        let label = describe(&cmd);
        debug!("Running {}", label);

        cmd.stdout(Stdio::null()).stderr(Stdio::null());
        let status = cmd
            .status()
            .await
            .map_err(|e| DeployError::CommandError(format!("Failed to run {}: {}", label, e)))?;
        Ok(status.success())
    }
}

/// `program arg arg ...` for log lines
fn describe(cmd: &Command) -> String {
    let std_cmd = cmd.as_std();
    std::iter::once(std_cmd.get_program())
        .chain(std_cmd.get_args())
        .map(|part| part.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
