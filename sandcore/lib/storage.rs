//! Object storage used for snapshot archives.
//!
//! The core only needs five operations from a store, captured by [`StorageBackend`]. Keys are
//! `/`-separated relative paths such as `sandbox-1/snap-2024.tar.gz`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use getset::Getters;
use sandutils::virtual_components;
use serde::Serialize;
use tokio::fs;
use walkdir::WalkDir;

use crate::{SandcoreError, SandcoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A stored object as reported by [`StorageBackend::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct StorageObject {
    /// The object key.
    key: String,

    /// Size in bytes.
    size: u64,

    /// When the object was last written.
    last_modified: DateTime<Utc>,
}

/// A key-value blob store.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Copies the file at `local` into the store under `key`, replacing any existing object.
    async fn upload(&self, local: &Path, key: &str) -> SandcoreResult<()>;

    /// Copies the object `key` to the file at `local`.
    async fn download(&self, key: &str, local: &Path) -> SandcoreResult<()>;

    /// Deletes the object `key`, returning whether it existed.
    async fn delete(&self, key: &str) -> SandcoreResult<bool>;

    /// Lists the objects whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> SandcoreResult<Vec<StorageObject>>;

    /// Whether the object `key` exists.
    async fn exists(&self, key: &str) -> SandcoreResult<bool>;
}

/// A [`StorageBackend`] backed by a local directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LocalStorage {
    /// Creates a store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory objects are stored in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> SandcoreResult<PathBuf> {
        let components = virtual_components(key)?;
        if components.is_empty() {
            return Err(SandcoreError::InvalidPath(format!(
                "storage key must not be empty: {key:?}"
            )));
        }

        Ok(components
            .iter()
            .fold(self.root.clone(), |path, part| path.join(part)))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl StorageBackend for LocalStorage {
    async fn upload(&self, local: &Path, key: &str) -> SandcoreResult<()> {
        let target = self.object_path(key)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::copy(local, &target).await?;
        tracing::debug!(key, path = %target.display(), "stored object");
        Ok(())
    }

    async fn download(&self, key: &str, local: &Path) -> SandcoreResult<()> {
        let source = self.object_path(key)?;
        if !fs::try_exists(&source).await? {
            return Err(SandcoreError::FileNotFound(key.to_string()));
        }

        if let Some(parent) = local.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::copy(&source, local).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> SandcoreResult<bool> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> SandcoreResult<Vec<StorageObject>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();

        let objects = tokio::task::spawn_blocking(move || {
            let mut objects = Vec::new();
            for entry in WalkDir::new(&root).follow_links(false) {
                let Ok(entry) = entry else { continue };
                if !entry.file_type().is_file() {
                    continue;
                }

                let Ok(relative) = entry.path().strip_prefix(&root) else {
                    continue;
                };

                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");

                if !key.starts_with(&prefix) {
                    continue;
                }

                let Ok(metadata) = entry.metadata() else {
                    continue;
                };

                let last_modified = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());

                objects.push(StorageObject {
                    key,
                    size: metadata.len(),
                    last_modified,
                });
            }
            objects
        })
        .await?;

        Ok(objects)
    }

    async fn exists(&self, key: &str) -> SandcoreResult<bool> {
        let path = self.object_path(key)?;
        Ok(fs::try_exists(path).await?)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_storage_lifecycle() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = LocalStorage::new(dir.path().join("store"));

        let source = dir.path().join("archive.tar.gz");
        fs::write(&source, b"archive bytes").await?;

        storage.upload(&source, "sb1/snap-a.tar.gz").await?;
        storage.upload(&source, "sb2/snap-b.tar.gz").await?;
        assert!(storage.exists("sb1/snap-a.tar.gz").await?);
        assert!(!storage.exists("sb1/missing.tar.gz").await?);

        let listed = storage.list("sb1/").await?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].get_key(), "sb1/snap-a.tar.gz");
        assert_eq!(*listed[0].get_size(), 13);
        assert_eq!(storage.list("").await?.len(), 2);

        let restored = dir.path().join("out/restored.tar.gz");
        storage.download("sb1/snap-a.tar.gz", &restored).await?;
        assert_eq!(fs::read(&restored).await?, b"archive bytes");

        assert!(storage.delete("sb1/snap-a.tar.gz").await?);
        assert!(!storage.delete("sb1/snap-a.tar.gz").await?);
        assert!(matches!(
            storage.download("sb1/snap-a.tar.gz", &restored).await,
            Err(SandcoreError::FileNotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_local_storage_rejects_escaping_keys() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = LocalStorage::new(dir.path());

        assert!(storage.exists("../outside").await.is_err());
        assert!(matches!(
            storage.exists("").await,
            Err(SandcoreError::InvalidPath(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_list_on_missing_root_is_empty() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = LocalStorage::new(dir.path().join("never-created"));
        assert!(storage.list("").await?.is_empty());
        Ok(())
    }
}
