//! Deployment layout on disk

use std::path::{Path, PathBuf};

use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::storage::settings::DeploymentConfig;

/// Resolved paths of one deployment
#[derive(Debug, Clone)]
pub struct DeploymentLayout {
    /// Deployment name
    pub name: String,

    /// Deployment root
    pub root: PathBuf,

    code_subdir: String,
    venv_subdir: String,
    secret_files: Vec<PathBuf>,
    requirements: PathBuf,
    backup_dir: Option<PathBuf>,
}

impl DeploymentLayout {
    pub fn from_config(config: &DeploymentConfig) -> Self {
        Self {
            name: config.name.clone(),
            root: config.root.clone(),
            code_subdir: config.code_subdir.clone(),
            venv_subdir: config.venv_subdir.clone(),
            secret_files: config.secret_files.clone(),
            requirements: config.requirements.clone(),
            backup_dir: config.backup_dir.clone(),
        }
    }

    /// Get the deployment root
    pub fn root_dir(&self) -> Dir {
        Dir::new(&self.root)
    }

    /// Get the code (git checkout) directory
    pub fn code_dir(&self) -> Dir {
        Dir::new(self.root.join(&self.code_subdir))
    }

    /// Get the dependency environment directory
    pub fn venv_dir(&self) -> Dir {
        Dir::new(self.root.join(&self.venv_subdir))
    }

    /// The venv's pip executable
    pub fn pip(&self) -> PathBuf {
        self.root.join(&self.venv_subdir).join("bin").join("pip")
    }

    /// Get the dependency manifest
    pub fn requirements_file(&self) -> File {
        File::new(self.root.join(&self.code_subdir).join(&self.requirements))
    }

    /// Secret/config file paths, relative to the code directory
    pub fn secret_files(&self) -> &[PathBuf] {
        &self.secret_files
    }

    /// A secret file inside the live code directory
    pub fn secret_file(&self, rel: &Path) -> File {
        File::new(self.root.join(&self.code_subdir).join(rel))
    }

    /// Directory that receives this deployment's backups
    pub fn backup_root(&self) -> Dir {
        match &self.backup_dir {
            Some(dir) => Dir::new(dir),
            None => Dir::new(
                self.root
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("/")),
            ),
        }
    }

    /// Name prefix shared by all backup directories of this deployment
    pub fn backup_prefix(&self) -> String {
        format!("{}_backup_", self.name)
    }

    /// Where a half-applied code directory is parked after a failed update
    pub fn failed_code_dir(&self, stamp: &str) -> Dir {
        Dir::new(self.root.join(format!(".{}.failed-{}", self.code_subdir, stamp)))
    }
}
