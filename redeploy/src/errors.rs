//! Error types for redeploy

use thiserror::Error;

/// Main error type for filesystem, configuration and command plumbing
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Directory walk error: {0}")]
    WalkError(#[from] walkdir::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Command error: {0}")]
    CommandError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Backup error: {0}")]
    BackupError(String),

    #[error("Service error: {0}")]
    ServiceError(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Identity error: {0}")]
    IdentityError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<anyhow::Error> for DeployError {
    fn from(err: anyhow::Error) -> Self {
        DeployError::Internal(err.to_string())
    }
}

impl From<nix::errno::Errno> for DeployError {
    fn from(err: nix::errno::Errno) -> Self {
        DeployError::IoError(std::io::Error::from(err))
    }
}
