//! File-based storage backend
//!
//! Layout: `<base>/<release>/v<revision>.json`, each file holding one
//! compressed revision. Files are written to a temporary name first and then
//! linked or renamed into place, so readers never see a partial revision.
//! Every check-then-write runs while holding `<base>/<release>/.lock`.
//! Release names are validated before they become path components.

use async_trait::async_trait;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{
    StorageBackend, StorageConfig, check_create, check_status_change, decode_revision,
    encode_revision,
};
use crate::error::{ReleaseError, Result};
use crate::release::{ReleaseStatus, Revision, validate_name};

const LOCK_FILE: &str = ".lock";
const LOCK_RETRY: Duration = Duration::from_millis(10);
const LOCK_ATTEMPTS: u32 = 500;

/// File-based storage backend
#[derive(Debug, Clone)]
pub struct FileStorage {
    /// Base directory for storing releases
    base_dir: PathBuf,
    config: StorageConfig,
}

/// Held lock file, removed on drop
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release storage lock");
        }
    }
}

impl FileStorage {
    /// Create a file backend rooted at `base_dir`
    pub fn new(base_dir: impl Into<PathBuf>, config: StorageConfig) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir, config })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn release_dir(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.base_dir.join(name))
    }

    fn revision_path(&self, name: &str, revision: u32) -> Result<PathBuf> {
        Ok(self.release_dir(name)?.join(format!("v{}.json", revision)))
    }

    async fn lock(&self, name: &str) -> Result<LockGuard> {
        let dir = self.release_dir(name)?;
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(LOCK_FILE);

        for _ in 0..LOCK_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(LockGuard { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ReleaseError::Storage(format!(
            "timed out waiting for lock {}",
            path.display()
        )))
    }

    fn read_revision(&self, path: &Path) -> Result<Revision> {
        let data = std::fs::read(path)?;
        decode_revision(&data, &self.config)
    }

    fn read_all(&self, name: &str) -> Result<Vec<Revision>> {
        let dir = self.release_dir(name)?;
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut revisions = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if is_revision_file(&path) {
                revisions.push(self.read_revision(&path)?);
            }
        }
        revisions.sort_by_key(|r| r.revision);
        Ok(revisions)
    }

    /// Encode a revision into its temporary file
    fn stage(&self, revision: &Revision) -> Result<(PathBuf, PathBuf)> {
        let path = self.revision_path(&revision.name, revision.revision)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, encode_revision(revision, &self.config)?)?;
        Ok((tmp, path))
    }

    /// Replace a revision file atomically
    fn rewrite(&self, revision: &Revision) -> Result<()> {
        let (tmp, path) = self.stage(revision)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    async fn modify(
        &self,
        name: &str,
        revision: u32,
        apply: impl FnOnce(&mut Revision) -> Result<()> + Send,
    ) -> Result<Revision> {
        let path = self.revision_path(name, revision)?;
        if !path.exists() {
            return Err(ReleaseError::not_found(name, Some(revision)));
        }

        let _lock = self.lock(name).await?;
        let mut record = self.read_revision(&path)?;
        apply(&mut record)?;
        self.rewrite(&record)?;
        Ok(record)
    }

    fn remove_if_empty(&self, name: &str) {
        let Ok(dir) = self.release_dir(name) else {
            return;
        };
        let empty = std::fs::read_dir(&dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if empty {
            let _ = std::fs::remove_dir(&dir);
        }
    }
}

fn is_revision_file(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "json")
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('v'))
}

#[async_trait]
impl StorageBackend for FileStorage {
    async fn get(&self, name: &str, revision: u32) -> Result<Revision> {
        let path = self.revision_path(name, revision)?;
        if !path.exists() {
            return Err(ReleaseError::not_found(name, Some(revision)));
        }
        self.read_revision(&path)
    }

    async fn list(&self, name: &str) -> Result<Vec<Revision>> {
        self.read_all(name)
    }

    async fn create_if_absent(&self, revision: &Revision) -> Result<()> {
        let _lock = self.lock(&revision.name).await?;
        check_create(&self.read_all(&revision.name)?, revision)?;

        // Hard links never replace an existing file
        let (tmp, path) = self.stage(revision)?;
        let linked = std::fs::hard_link(&tmp, &path);
        std::fs::remove_file(&tmp)?;
        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(ReleaseError::conflict(
                &revision.name,
                revision.revision,
                format!("revision {} already exists", revision.revision),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_status(
        &self,
        name: &str,
        revision: u32,
        status: ReleaseStatus,
    ) -> Result<Revision> {
        self.modify(name, revision, |record| {
            record.transition(status);
            Ok(())
        })
        .await
    }

    async fn compare_and_set_status(
        &self,
        name: &str,
        revision: u32,
        expected: &ReleaseStatus,
        status: ReleaseStatus,
    ) -> Result<Revision> {
        let _lock = self.lock(name).await?;
        let existing = self.read_all(name)?;
        check_status_change(&existing, name, revision, expected, &status)?;
        let mut record = existing
            .into_iter()
            .find(|r| r.revision == revision)
            .ok_or_else(|| ReleaseError::not_found(name, Some(revision)))?;
        record.transition(status);
        self.rewrite(&record)?;
        Ok(record)
    }

    async fn delete(&self, name: &str, revision: u32) -> Result<Revision> {
        let removed = {
            let _lock = self.lock(name).await?;
            let record = self.get(name, revision).await?;
            std::fs::remove_file(self.revision_path(name, revision)?)?;
            record
        };
        self.remove_if_empty(name);
        Ok(removed)
    }

    async fn purge(&self, name: &str) -> Result<Vec<Revision>> {
        let removed = {
            let _lock = self.lock(name).await?;
            let revisions = self.read_all(name)?;
            for revision in &revisions {
                std::fs::remove_file(self.revision_path(name, revision.revision)?)?;
            }
            revisions
        };
        self.remove_if_empty(name);

        if removed.is_empty() {
            return Err(ReleaseError::not_found(name, None));
        }
        Ok(removed)
    }

    async fn list_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if !path.is_dir() {
                continue;
            }
            let has_revisions = std::fs::read_dir(&path)?
                .filter_map(|e| e.ok())
                .any(|e| is_revision_file(&e.path()));
            if has_revisions && let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}
