//! Directory operations

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::identity::Identity;
use crate::utils::hex;

/// A directory wrapper with path
#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    /// Create a new directory reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the directory exists
    pub async fn exists(&self) -> bool {
        tokio::fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Create the directory (and parents)
    pub async fn create(&self) -> Result<(), DeployError> {
        tokio::fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// Delete the directory and all contents
    pub async fn delete(&self) -> Result<(), DeployError> {
        if self.exists().await {
            tokio::fs::remove_dir_all(&self.path).await?;
        }
        Ok(())
    }

    /// Move the directory to `dest` (same filesystem)
    pub async fn rename_to(&self, dest: &Path) -> Result<Dir, DeployError> {
        tokio::fs::rename(&self.path, dest).await?;
        Ok(Dir::new(dest))
    }

    /// List subdirectories
    pub async fn list_dirs(&self) -> Result<Vec<PathBuf>, DeployError> {
        let mut dirs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.path).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }

        Ok(dirs)
    }

    /// Get a file within this directory
    pub fn file(&self, name: impl AsRef<Path>) -> File {
        File::new(self.path.join(name))
    }

    /// Get a subdirectory
    pub fn subdir(&self, name: impl AsRef<Path>) -> Dir {
        Dir::new(self.path.join(name))
    }

    /// Recursively copy this directory to `dest`, which must not exist yet.
    ///
    /// Symlinks are recreated, not followed. Returns the number of bytes copied.
    pub async fn copy_to(&self, dest: &Path) -> Result<u64, DeployError> {
        let src = self.path.clone();
        let dest = dest.to_path_buf();
        blocking(move || copy_tree(&src, &dest)).await
    }

    /// Recursively hand the tree to `identity` (symlinks themselves, not targets)
    pub async fn chown_recursive(&self, identity: &Identity) -> Result<(), DeployError> {
        let root = self.path.clone();
        let (uid, gid) = (identity.uid, identity.gid);
        blocking(move || {
            for entry in WalkDir::new(&root).follow_links(false) {
                let entry = entry?;
                std::os::unix::fs::lchown(entry.path(), Some(uid), Some(gid))?;
            }
            Ok(())
        })
        .await
    }

    /// Total size in bytes of regular files in the tree
    pub async fn size_bytes(&self) -> Result<u64, DeployError> {
        let root = self.path.clone();
        blocking(move || {
            let mut total = 0u64;
            for entry in WalkDir::new(&root).follow_links(false) {
                let entry = entry?;
                if entry.file_type().is_file() {
                    total += entry.metadata()?.len();
                }
            }
            Ok(total)
        })
        .await
    }

    /// SHA-256 over relative paths, entry kinds, file contents and link targets.
    ///
    /// Two trees with the same digest hold the same bytes at the same paths.
    pub async fn tree_digest(&self) -> Result<String, DeployError> {
        let root = self.path.clone();
        blocking(move || digest_tree(&root)).await
    }
}

async fn blocking<T, F>(f: F) -> Result<T, DeployError>
where
    F: FnOnce() -> Result<T, DeployError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DeployError::Internal(format!("blocking task failed: {}", e)))?
}

fn copy_tree(src: &Path, dest: &Path) -> Result<u64, DeployError> {
    if fs::symlink_metadata(dest).is_ok() {
        return Err(DeployError::IoError(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("refusing to copy into existing path {}", dest.display()),
        )));
    }

    let mut copied = 0u64;
    let mut dir_modes = Vec::new();
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| DeployError::Internal(format!("strip_prefix failed: {}", e)))?;
        let out = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&out).map_err(|e| annotate(e, "create", &out))?;
            dir_modes.push((out, entry.metadata()?.permissions()));
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(&target, &out).map_err(|e| annotate(e, "symlink", &out))?;
        } else {
            copied += fs::copy(entry.path(), &out).map_err(|e| annotate(e, "copy", &out))?;
        }
    }

    // Directory modes go on last so read-only directories can still be filled
    for (dir, permissions) in dir_modes.into_iter().rev() {
        fs::set_permissions(&dir, permissions).map_err(|e| annotate(e, "chmod", &dir))?;
    }

    Ok(copied)
}

fn annotate(err: io::Error, op: &str, path: &Path) -> DeployError {
    DeployError::IoError(io::Error::new(
        err.kind(),
        format!("{} {}: {}", op, path.display(), err),
    ))
}

fn digest_tree(root: &Path) -> Result<String, DeployError> {
    let mut hasher = Sha256::new();

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| DeployError::Internal(format!("strip_prefix failed: {}", e)))?;
        if rel.as_os_str().is_empty() {
            continue;
        }

        hasher.update(rel.as_os_str().as_encoded_bytes());
        hasher.update([0u8]);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            hasher.update(b"d");
        } else if file_type.is_symlink() {
            hasher.update(b"l");
            hasher.update(fs::read_link(entry.path())?.as_os_str().as_encoded_bytes());
        } else {
            hasher.update(b"f");
            let mut file = fs::File::open(entry.path())?;
            io::copy(&mut file, &mut hasher)?;
        }
        hasher.update([0u8]);
    }

    Ok(hex::encode(hasher.finalize()))
}
