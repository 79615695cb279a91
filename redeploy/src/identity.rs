//! Deploying-user identity
//!
//! Resolved once from the deployment config and passed to every command and
//! ownership change that must happen as the deploying user.

use std::path::PathBuf;

use nix::unistd::{Group, User};

use crate::errors::DeployError;

/// The user (and group) that owns a deployment's files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

impl Identity {
    /// Look up `user` (and optionally `group`) in the system databases
    pub fn resolve(user: &str, group: Option<&str>) -> Result<Self, DeployError> {
        let entry = User::from_name(user)?
            .ok_or_else(|| DeployError::IdentityError(format!("Unknown user: {}", user)))?;

        let gid = match group {
            Some(group) => {
                Group::from_name(group)?
                    .ok_or_else(|| DeployError::IdentityError(format!("Unknown group: {}", group)))?
                    .gid
                    .as_raw()
            }
            None => entry.gid.as_raw(),
        };

        Ok(Self {
            user: entry.name,
            uid: entry.uid.as_raw(),
            gid,
            home: entry.dir,
        })
    }

    /// Resolve an optional configured user; `None` means "run as the invoking user"
    pub fn from_config(user: Option<&str>, group: Option<&str>) -> Result<Option<Self>, DeployError> {
        match user {
            Some(user) => Self::resolve(user, group).map(Some),
            None if group.is_some() => Err(DeployError::IdentityError(
                "A group was configured without a user".to_string(),
            )),
            None => Ok(None),
        }
    }
}

/// Whether the current process runs with root privileges
pub fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}
