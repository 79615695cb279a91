//! Timestamped deployment backups
//!
//! A backup directory holds a full copy of the code directory under `code/`,
//! a separate copy of each secret/config file under `secrets/`, and a
//! `backup.json` manifest. Backups are written once and never pruned here;
//! cleanup is left to the operator.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::filesys::space;
use crate::storage::layout::DeploymentLayout;
use crate::utils;

pub const MANIFEST_FILE: &str = "backup.json";
pub const CODE_DIR: &str = "code";
pub const SECRETS_DIR: &str = "secrets";

/// Metadata written alongside each backup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    /// Deployment name
    pub deployment: String,

    /// Creation time
    pub created_at: DateTime<Local>,

    /// `YYYYMMDD_HHMMSS` suffix used in the directory name
    pub stamp: String,

    /// Code directory the copy was taken from
    pub source: PathBuf,

    /// Checked-out revision at backup time, when it could be read
    pub revision: Option<String>,

    /// Secret/config files captured under `secrets/`, relative to the code directory
    pub secret_files: Vec<PathBuf>,

    /// Tree digest of `code/`
    pub code_digest: String,

    /// Bytes of regular files in `code/`
    pub code_bytes: u64,
}

/// One backup on disk
#[derive(Debug, Clone)]
pub struct Backup {
    dir: Dir,
    manifest: BackupManifest,
}

impl Backup {
    /// Load a backup from its directory
    pub async fn open(path: &Path) -> Result<Self, DeployError> {
        let dir = Dir::new(path);
        let manifest_file = dir.file(MANIFEST_FILE);
        if !manifest_file.exists().await {
            return Err(DeployError::NotFound(format!(
                "No backup manifest in {}",
                path.display()
            )));
        }
        let manifest = manifest_file.read_json().await?;
        Ok(Self { dir, manifest })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn manifest(&self) -> &BackupManifest {
        &self.manifest
    }

    /// The code snapshot
    pub fn code_dir(&self) -> Dir {
        self.dir.subdir(CODE_DIR)
    }

    /// Separate copy of a secret file, if it was captured
    pub fn secret_file(&self, rel: &Path) -> Option<File> {
        self.manifest
            .secret_files
            .iter()
            .any(|captured| captured == rel)
            .then(|| File::new(self.dir.path().join(SECRETS_DIR).join(rel)))
    }
}

/// Creates and finds backups for one deployment
#[derive(Debug, Clone)]
pub struct BackupStore {
    layout: DeploymentLayout,
}

impl BackupStore {
    pub fn new(layout: &DeploymentLayout) -> Self {
        Self {
            layout: layout.clone(),
        }
    }

    pub fn root(&self) -> Dir {
        self.layout.backup_root()
    }

    /// Snapshot the code directory and secret files.
    ///
    /// A half-written backup is removed before the error is returned.
    pub async fn create(&self, revision: Option<String>) -> Result<Backup, DeployError> {
        let code_dir = self.layout.code_dir();
        let root = self.root();
        root.create().await?;

        let code_bytes = code_dir.size_bytes().await?;
        if let Some(available) = space::available_space(root.path()) {
            if available < code_bytes {
                return Err(DeployError::BackupError(format!(
                    "{} needs {} bytes but only {} are free under {}",
                    code_dir.path().display(),
                    code_bytes,
                    available,
                    root.path().display()
                )));
            }
        }

        let created_at = Local::now();
        let stamp = utils::stamp(&created_at);
        let dir = self.reserve_dir(&root, &stamp).await?;
        debug!("Reserved backup directory {}", dir.path().display());

        match self.fill(&dir, &code_dir, created_at, stamp, revision).await {
            Ok(backup) => Ok(backup),
            Err(e) => {
                if let Err(cleanup) = dir.delete().await {
                    warn!(
                        "Could not remove incomplete backup {}: {}",
                        dir.path().display(),
                        cleanup
                    );
                }
                Err(e)
            }
        }
    }

    async fn fill(
        &self,
        dir: &Dir,
        code_dir: &Dir,
        created_at: DateTime<Local>,
        stamp: String,
        revision: Option<String>,
    ) -> Result<Backup, DeployError> {
        let snapshot = dir.subdir(CODE_DIR);
        let code_bytes = code_dir.copy_to(snapshot.path()).await?;

        let mut secret_files = Vec::new();
        for rel in self.layout.secret_files() {
            let live = self.layout.secret_file(rel);
            if !live.exists().await {
                debug!("Secret file {} not present, not captured", rel.display());
                continue;
            }
            let dest = dir.path().join(SECRETS_DIR).join(rel);
            copy_entry(live.path(), &dest).await?;
            secret_files.push(rel.clone());
        }

        let manifest = BackupManifest {
            deployment: self.layout.name.clone(),
            created_at,
            stamp,
            source: code_dir.path().to_path_buf(),
            revision,
            secret_files,
            code_digest: snapshot.tree_digest().await?,
            code_bytes,
        };
        dir.file(MANIFEST_FILE).write_json(&manifest).await?;

        info!(
            "Backed up {} ({} bytes, {} secret files) to {}",
            code_dir.path().display(),
            code_bytes,
            manifest.secret_files.len(),
            dir.path().display()
        );

        Ok(Backup {
            dir: dir.clone(),
            manifest,
        })
    }

    /// Create `<name>_backup_<stamp>`, adding `_<n>` if that name is taken
    async fn reserve_dir(&self, root: &Dir, stamp: &str) -> Result<Dir, DeployError> {
        let base = format!("{}{}", self.layout.backup_prefix(), stamp);
        for attempt in 0..100u32 {
            let name = if attempt == 0 {
                base.clone()
            } else {
                format!("{}_{}", base, attempt)
            };
            let candidate = root.subdir(&name);
            match tokio::fs::create_dir(candidate.path()).await {
                Ok(()) => return Ok(candidate),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(DeployError::BackupError(format!(
            "Too many backups named {} in {}",
            base,
            root.path().display()
        )))
    }

    /// All readable backups of this deployment, newest first
    pub async fn list(&self) -> Result<Vec<Backup>, DeployError> {
        let root = self.root();
        if !root.exists().await {
            return Ok(Vec::new());
        }

        let prefix = self.layout.backup_prefix();
        let mut backups = Vec::new();
        for path in root.list_dirs().await? {
            let is_ours = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix));
            if !is_ours {
                continue;
            }
            match Backup::open(&path).await {
                Ok(backup) if backup.manifest.deployment == self.layout.name => backups.push(backup),
                Ok(_) => {}
                Err(e) => warn!("Skipping {}: {}", path.display(), e),
            }
        }

        backups.sort_by(|a, b| {
            b.manifest
                .created_at
                .cmp(&a.manifest.created_at)
                .then_with(|| b.path().cmp(a.path()))
        });
        Ok(backups)
    }

    /// Most recent backup, if any
    pub async fn latest(&self) -> Result<Option<Backup>, DeployError> {
        Ok(self.list().await?.into_iter().next())
    }
}

/// Copy a file or directory entry to `dest`
pub async fn copy_entry(src: &Path, dest: &Path) -> Result<(), DeployError> {
    let metadata = tokio::fs::symlink_metadata(src).await?;
    if metadata.is_dir() {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Dir::new(src).copy_to(dest).await?;
    } else {
        File::new(src).copy_to(dest).await?;
    }
    Ok(())
}
