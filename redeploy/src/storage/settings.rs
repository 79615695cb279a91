//! Settings file management

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::logs::LogLevel;

/// Default settings file location
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/redeploy/settings.json";

/// Top-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON logs on stderr
    #[serde(default)]
    pub log_format_json: bool,

    /// Optional directory for a persistent log file
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Managed deployments
    #[serde(default)]
    pub deployments: Vec<DeploymentConfig>,
}

impl Settings {
    /// Load and validate settings from a JSON file
    pub async fn load(path: &Path) -> Result<Self, DeployError> {
        let file = File::new(path);
        if !file.exists().await {
            return Err(DeployError::ConfigError(format!(
                "Settings file not found: {}",
                path.display()
            )));
        }
        let settings: Settings = file.read_json().await.map_err(|e| {
            DeployError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check the settings for structural mistakes
    pub fn validate(&self) -> Result<(), DeployError> {
        if self.deployments.is_empty() {
            return Err(DeployError::ConfigError(
                "No deployments configured".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for deployment in &self.deployments {
            if !names.insert(deployment.name.as_str()) {
                return Err(DeployError::ConfigError(format!(
                    "Duplicate deployment name: {}",
                    deployment.name
                )));
            }
            deployment.validate()?;
        }

        Ok(())
    }

    /// Pick a deployment by name, or the only one when no name is given
    pub fn deployment(&self, name: Option<&str>) -> Result<&DeploymentConfig, DeployError> {
        match name {
            Some(name) => self
                .deployments
                .iter()
                .find(|d| d.name == name)
                .ok_or_else(|| DeployError::NotFound(format!("Deployment '{}'", name))),
            None if self.deployments.len() == 1 => Ok(&self.deployments[0]),
            None => {
                let names: Vec<&str> = self.deployments.iter().map(|d| d.name.as_str()).collect();
                Err(DeployError::ConfigError(format!(
                    "Several deployments configured ({}); pick one with --deployment",
                    names.join(", ")
                )))
            }
        }
    }
}

/// One managed deployment: a git checkout, its venv, and the unit that runs it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Deployment name, used in backup directory names and log spans
    pub name: String,

    /// Deployment root holding the code and venv directories
    pub root: PathBuf,

    /// Code (git checkout) directory under the root
    #[serde(default = "default_code_subdir")]
    pub code_subdir: String,

    /// Dependency environment directory under the root
    #[serde(default = "default_venv_subdir")]
    pub venv_subdir: String,

    /// systemd unit name
    pub service: String,

    /// Deploying user; git and pip run as this user and restored files are chowned to it
    #[serde(default)]
    pub user: Option<String>,

    /// Group for restored files; defaults to the user's primary group
    #[serde(default)]
    pub group: Option<String>,

    /// Secret/config files kept out of version control, relative to the code directory
    #[serde(default = "default_secret_files")]
    pub secret_files: Vec<PathBuf>,

    /// Git remote to fetch from
    #[serde(default = "default_remote")]
    pub remote: String,

    /// Branch to track
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Dependency manifest, relative to the code directory
    #[serde(default = "default_requirements")]
    pub requirements: PathBuf,

    /// Backup directory; backups go next to the root when unset
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,

    /// Pause between starting the service and the liveness check
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,

    /// Refuse to run unless invoked as root
    #[serde(default = "default_true")]
    pub require_root: bool,

    /// Per-step command timeouts
    #[serde(default)]
    pub timeouts: StepTimeouts,
}

fn default_true() -> bool {
    true
}

fn default_code_subdir() -> String {
    "bot".to_string()
}

fn default_venv_subdir() -> String {
    "venv".to_string()
}

fn default_secret_files() -> Vec<PathBuf> {
    vec![
        PathBuf::from(".env"),
        PathBuf::from("credentials.json"),
        PathBuf::from("bot.db"),
    ]
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_requirements() -> PathBuf {
    PathBuf::from("requirements.txt")
}

fn default_settle_delay() -> u64 {
    5
}

impl DeploymentConfig {
    /// Create a config with defaults for everything but the identifying fields
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>, service: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            code_subdir: default_code_subdir(),
            venv_subdir: default_venv_subdir(),
            service: service.into(),
            user: None,
            group: None,
            secret_files: default_secret_files(),
            remote: default_remote(),
            branch: default_branch(),
            requirements: default_requirements(),
            backup_dir: None,
            settle_delay_secs: default_settle_delay(),
            require_root: true,
            timeouts: StepTimeouts::default(),
        }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    /// Check a single deployment entry
    pub fn validate(&self) -> Result<(), DeployError> {
        if self.name.trim().is_empty() {
            return Err(DeployError::ConfigError("Deployment name is empty".to_string()));
        }
        if self.name.contains('/') {
            return Err(DeployError::ConfigError(format!(
                "Deployment name must not contain '/': {}",
                self.name
            )));
        }
        if self.service.trim().is_empty() {
            return Err(DeployError::ConfigError(format!(
                "Deployment '{}' has no service",
                self.name
            )));
        }
        if !self.root.is_absolute() {
            return Err(DeployError::ConfigError(format!(
                "Deployment '{}' root must be absolute: {}",
                self.name,
                self.root.display()
            )));
        }
        if let Some(backup_dir) = &self.backup_dir {
            if !backup_dir.is_absolute() {
                return Err(DeployError::ConfigError(format!(
                    "Deployment '{}' backup_dir must be absolute: {}",
                    self.name,
                    backup_dir.display()
                )));
            }
            if backup_dir.starts_with(self.root.join(&self.code_subdir)) {
                return Err(DeployError::ConfigError(format!(
                    "Deployment '{}' backup_dir must be outside the code directory: {}",
                    self.name,
                    backup_dir.display()
                )));
            }
        }
        for (step, secs) in self.timeouts.entries() {
            if secs == 0 {
                return Err(DeployError::ConfigError(format!(
                    "Deployment '{}' {} timeout must be at least 1s",
                    self.name, step
                )));
            }
        }
        for name in [&self.code_subdir, &self.venv_subdir] {
            if !is_single_component(Path::new(name)) {
                return Err(DeployError::ConfigError(format!(
                    "Deployment '{}' subdirectory must be a plain name: {}",
                    self.name, name
                )));
            }
        }
        for path in self.secret_files.iter().chain(std::iter::once(&self.requirements)) {
            if !is_contained(path) {
                return Err(DeployError::ConfigError(format!(
                    "Deployment '{}' path escapes the code directory: {}",
                    self.name,
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

/// A relative path made only of normal components
fn is_contained(path: &Path) -> bool {
    !path.as_os_str().is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)))
}

fn is_single_component(path: &Path) -> bool {
    is_contained(path) && path.components().count() == 1
}

/// Timeouts for each external command step, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTimeouts {
    /// systemctl stop/start/is-active
    #[serde(default = "default_service_timeout")]
    pub service_secs: u64,

    /// git fetch and revision lookups
    #[serde(default = "default_fetch_timeout")]
    pub fetch_secs: u64,

    /// git merge of the fetched revision
    #[serde(default = "default_apply_timeout")]
    pub apply_secs: u64,

    /// pip install
    #[serde(default = "default_install_timeout")]
    pub install_secs: u64,
}

fn default_service_timeout() -> u64 {
    90
}

fn default_fetch_timeout() -> u64 {
    120
}

fn default_apply_timeout() -> u64 {
    60
}

fn default_install_timeout() -> u64 {
    900
}

impl StepTimeouts {
    fn entries(&self) -> [(&'static str, u64); 4] {
        [
            ("service", self.service_secs),
            ("fetch", self.fetch_secs),
            ("apply", self.apply_secs),
            ("install", self.install_secs),
        ]
    }

    pub fn service(&self) -> Duration {
        Duration::from_secs(self.service_secs)
    }

    pub fn fetch(&self) -> Duration {
        Duration::from_secs(self.fetch_secs)
    }

    pub fn apply(&self) -> Duration {
        Duration::from_secs(self.apply_secs)
    }

    pub fn install(&self) -> Duration {
        Duration::from_secs(self.install_secs)
    }
}

impl Default for StepTimeouts {
    fn default() -> Self {
        Self {
            service_secs: default_service_timeout(),
            fetch_secs: default_fetch_timeout(),
            apply_secs: default_apply_timeout(),
            install_secs: default_install_timeout(),
        }
    }
}
