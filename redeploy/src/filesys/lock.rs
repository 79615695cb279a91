//! Exclusive per-deployment lock
//!
//! The lock is an `flock(2)` on the deployment root directory itself, so taking
//! it never creates files. It is released when the guard is dropped.

use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

use crate::errors::DeployError;

/// Guard holding the exclusive lock on a deployment root
#[derive(Debug)]
pub struct DeploymentLock {
    path: PathBuf,
    _flock: Flock<std::fs::File>,
}

impl DeploymentLock {
    /// Take the lock without waiting; fails if another process holds it
    pub fn try_acquire(dir: &Path) -> Result<Self, DeployError> {
        let handle = std::fs::File::open(dir)?;
        match Flock::lock(handle, FlockArg::LockExclusiveNonblock) {
            Ok(flock) => {
                debug!("Acquired deployment lock on {}", dir.display());
                Ok(Self {
                    path: dir.to_path_buf(),
                    _flock: flock,
                })
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Err(DeployError::LockError(format!(
                "{} is locked by another redeploy run",
                dir.display()
            ))),
            Err((_, errno)) => Err(errno.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
