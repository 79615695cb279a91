//! File operations

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::errors::DeployError;
use crate::identity::Identity;

/// A file wrapper with path
#[derive(Debug, Clone)]
pub struct File {
    path: PathBuf,
}

impl File {
    /// Create a new file reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the file exists
    pub async fn exists(&self) -> bool {
        fs::symlink_metadata(&self.path).await.is_ok()
    }

    /// Read file contents as string
    pub async fn read_string(&self) -> Result<String, DeployError> {
        let mut file = fs::File::open(&self.path).await?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).await?;
        Ok(contents)
    }

    /// Read file as JSON
    pub async fn read_json<T: DeserializeOwned>(&self) -> Result<T, DeployError> {
        let contents = self.read_string().await?;
        let value = serde_json::from_str(&contents)?;
        Ok(value)
    }

    /// Write JSON to file, replacing it atomically
    pub async fn write_json<T: Serialize>(&self, value: &T) -> Result<(), DeployError> {
        let contents = serde_json::to_string_pretty(value)?;
        self.write_atomic(contents.as_bytes()).await
    }

    /// Atomic write using a temporary file
    pub async fn write_atomic(&self, contents: &[u8]) -> Result<(), DeployError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    /// Copy this file to `dest`, creating parent directories.
    ///
    /// Permission bits travel with the copy.
    pub async fn copy_to(&self, dest: &Path) -> Result<u64, DeployError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        let bytes = fs::copy(&self.path, dest).await.map_err(|e| {
            DeployError::IoError(std::io::Error::new(
                e.kind(),
                format!("copy {} -> {}: {}", self.path.display(), dest.display(), e),
            ))
        })?;
        Ok(bytes)
    }

    /// Hand the file to `identity`
    pub async fn chown(&self, identity: &Identity) -> Result<(), DeployError> {
        let path = self.path.clone();
        let (uid, gid) = (identity.uid, identity.gid);
        tokio::task::spawn_blocking(move || std::os::unix::fs::lchown(&path, Some(uid), Some(gid)))
            .await
            .map_err(|e| DeployError::Internal(e.to_string()))??;
        Ok(())
    }
}
