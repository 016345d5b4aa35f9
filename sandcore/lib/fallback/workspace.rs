//! The on-disk side of a fallback container: per-sandbox workspaces, an activity marker, and
//! snapshot archives.

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use getset::Getters;
use sandutils::validate_id;
use serde::Serialize;
use tokio::fs;

use crate::{storage::StorageBackend, SandcoreError, SandcoreResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Marker file present while a workspace is active.
pub const RUNNING_MARKER: &str = ".container_running";

/// Directories laid out in every new workspace.
pub const SKELETON_DIRS: &[&str] = &["code", ".config", ".cache"];

/// Suffix of snapshot archive keys.
pub const SNAPSHOT_SUFFIX: &str = ".tar.gz";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The state of a workspace as seen by the workspace layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    /// The workspace exists and is marked active.
    Running,

    /// The workspace exists but is inactive.
    Stopped,

    /// There is no workspace for the sandbox.
    NotFound,
}

/// Metadata of a stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct SnapshotInfo {
    /// The sandbox the snapshot belongs to.
    sandbox_id: String,

    /// The snapshot id.
    snapshot_id: String,

    /// Archive size in bytes.
    size: u64,

    /// When the archive was stored.
    created_at: DateTime<Utc>,
}

/// Manages sandbox workspaces on disk and archives them through a [`StorageBackend`].
pub struct ContainerWorkspace {
    root: PathBuf,
    storage: Arc<dyn StorageBackend>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ContainerWorkspace {
    /// Creates a workspace layer rooted at `root`, archiving snapshots into `storage`.
    pub fn new(root: impl Into<PathBuf>, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            root: root.into(),
            storage,
        }
    }

    /// The directory holding every workspace.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The workspace directory of `sandbox_id`, after validating the id.
    pub fn workspace_path(&self, sandbox_id: &str) -> SandcoreResult<PathBuf> {
        validate_id(sandbox_id, "sandbox id")
            .map_err(|e| SandcoreError::InvalidSandboxId(e.to_string()))?;
        Ok(self.root.join(sandbox_id))
    }

    /// Creates the workspace if needed and marks it active.
    pub async fn create(&self, sandbox_id: &str) -> SandcoreResult<PathBuf> {
        let path = self.workspace_path(sandbox_id)?;
        for dir in SKELETON_DIRS {
            fs::create_dir_all(path.join(dir)).await?;
        }

        fs::write(path.join(RUNNING_MARKER), b"").await?;
        tracing::debug!(sandbox_id, path = %path.display(), "workspace active");
        Ok(path)
    }

    /// Marks an existing workspace active. Returns `false` if there is no workspace.
    pub async fn start(&self, sandbox_id: &str) -> SandcoreResult<bool> {
        let path = self.workspace_path(sandbox_id)?;
        if !fs::try_exists(&path).await? {
            return Ok(false);
        }

        fs::write(path.join(RUNNING_MARKER), b"").await?;
        Ok(true)
    }

    /// Marks a workspace inactive. Returns `false` if there is no workspace.
    pub async fn stop(&self, sandbox_id: &str) -> SandcoreResult<bool> {
        let path = self.workspace_path(sandbox_id)?;
        if !fs::try_exists(&path).await? {
            return Ok(false);
        }

        match fs::remove_file(path.join(RUNNING_MARKER)).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(true)
    }

    /// Stops then starts a workspace.
    pub async fn restart(&self, sandbox_id: &str) -> SandcoreResult<bool> {
        if !self.stop(sandbox_id).await? {
            return Ok(false);
        }

        self.start(sandbox_id).await
    }

    /// Deletes a workspace and everything in it. Returns `false` if there was none.
    pub async fn remove(&self, sandbox_id: &str) -> SandcoreResult<bool> {
        let path = self.workspace_path(sandbox_id)?;
        match fs::remove_dir_all(&path).await {
            Ok(()) => {
                tracing::info!(sandbox_id, "removed workspace");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Reports whether the workspace exists and is active.
    pub async fn status(&self, sandbox_id: &str) -> SandcoreResult<ContainerStatus> {
        let path = self.workspace_path(sandbox_id)?;
        if !fs::try_exists(&path).await? {
            return Ok(ContainerStatus::NotFound);
        }

        if fs::try_exists(path.join(RUNNING_MARKER)).await? {
            Ok(ContainerStatus::Running)
        } else {
            Ok(ContainerStatus::Stopped)
        }
    }

    /// Archives the workspace and stores it as a snapshot.
    ///
    /// A running workspace is stopped while it is archived and started again afterwards.
    pub async fn create_snapshot(
        &self,
        sandbox_id: &str,
        snapshot_id: Option<&str>,
    ) -> SandcoreResult<SnapshotInfo> {
        let workspace = self.workspace_path(sandbox_id)?;
        let snapshot_id = match snapshot_id {
            Some(id) => {
                validate_id(id, "snapshot id")?;
                id.to_string()
            }
            None => format!("snap-{}", Utc::now().format("%Y%m%d%H%M%S%3f")),
        };

        let status = self.status(sandbox_id).await?;
        if status == ContainerStatus::NotFound {
            return Err(SandcoreError::SandboxNotFound(sandbox_id.to_string()));
        }

        if status == ContainerStatus::Running {
            self.stop(sandbox_id).await?;
        }

        let result = self.archive(sandbox_id, &workspace, &snapshot_id).await;

        if status == ContainerStatus::Running {
            self.start(sandbox_id).await?;
        }

        let size = result?;
        tracing::info!(sandbox_id, %snapshot_id, size, "created snapshot");

        Ok(SnapshotInfo {
            sandbox_id: sandbox_id.to_string(),
            snapshot_id,
            size,
            created_at: Utc::now(),
        })
    }

    /// Replaces the workspace with the contents of a snapshot.
    pub async fn restore_snapshot(&self, sandbox_id: &str, snapshot_id: &str) -> SandcoreResult<()> {
        self.workspace_path(sandbox_id)?;
        validate_id(snapshot_id, "snapshot id")?;

        let key = snapshot_key(sandbox_id, snapshot_id);
        if !self.storage.exists(&key).await? {
            return Err(SandcoreError::SnapshotNotFound(key));
        }

        let archive = tempfile::Builder::new()
            .prefix("sandcore-restore-")
            .suffix(SNAPSHOT_SUFFIX)
            .tempfile()?;
        self.storage.download(&key, archive.path()).await?;

        // Unpack next to the live workspace so a bad archive leaves it untouched.
        fs::create_dir_all(&self.root).await?;
        let staging = tempfile::Builder::new()
            .prefix(".restore-")
            .tempdir_in(&self.root)?;

        let staging_root = staging.path().to_path_buf();
        let id = sandbox_id.to_string();
        let archive_path = archive.path().to_path_buf();
        tokio::task::spawn_blocking(move || extract_archive(&archive_path, &staging_root, &id))
            .await??;

        let restored = staging.path().join(sandbox_id);
        if !fs::try_exists(&restored).await? {
            return Err(SandcoreError::InvalidPath(format!(
                "snapshot {snapshot_id} holds no workspace for {sandbox_id}"
            )));
        }

        let was_running = self.status(sandbox_id).await? == ContainerStatus::Running;
        self.remove(sandbox_id).await?;
        fs::rename(restored, self.workspace_path(sandbox_id)?).await?;

        if was_running {
            self.start(sandbox_id).await?;
        }

        tracing::info!(sandbox_id, snapshot_id, "restored snapshot");
        Ok(())
    }

    /// Lists the snapshots of a sandbox, newest first.
    pub async fn list_snapshots(&self, sandbox_id: &str) -> SandcoreResult<Vec<SnapshotInfo>> {
        self.workspace_path(sandbox_id)?;
        let prefix = format!("{sandbox_id}/");

        let mut snapshots: Vec<SnapshotInfo> = self
            .storage
            .list(&prefix)
            .await?
            .into_iter()
            .filter_map(|object| {
                let name = object.get_key().strip_prefix(&prefix)?;
                let snapshot_id = name.strip_suffix(SNAPSHOT_SUFFIX)?;
                if snapshot_id.contains('/') {
                    return None;
                }

                Some(SnapshotInfo {
                    sandbox_id: sandbox_id.to_string(),
                    snapshot_id: snapshot_id.to_string(),
                    size: *object.get_size(),
                    created_at: *object.get_last_modified(),
                })
            })
            .collect();

        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(snapshots)
    }

    /// Deletes a stored snapshot, returning whether it existed.
    pub async fn delete_snapshot(&self, sandbox_id: &str, snapshot_id: &str) -> SandcoreResult<bool> {
        self.workspace_path(sandbox_id)?;
        validate_id(snapshot_id, "snapshot id")?;
        self.storage
            .delete(&snapshot_key(sandbox_id, snapshot_id))
            .await
    }

    async fn archive(
        &self,
        sandbox_id: &str,
        workspace: &Path,
        snapshot_id: &str,
    ) -> SandcoreResult<u64> {
        let archive = tempfile::Builder::new()
            .prefix("sandcore-snapshot-")
            .suffix(SNAPSHOT_SUFFIX)
            .tempfile()?;

        let workspace = workspace.to_path_buf();
        let id = sandbox_id.to_string();
        let archive_path = archive.path().to_path_buf();
        tokio::task::spawn_blocking(move || write_archive(&workspace, &id, &archive_path))
            .await??;

        let size = fs::metadata(archive.path()).await?.len();
        self.storage
            .upload(archive.path(), &snapshot_key(sandbox_id, snapshot_id))
            .await?;

        Ok(size)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn snapshot_key(sandbox_id: &str, snapshot_id: &str) -> String {
    format!("{sandbox_id}/{snapshot_id}{SNAPSHOT_SUFFIX}")
}

fn write_archive(workspace: &Path, sandbox_id: &str, target: &Path) -> io::Result<()> {
    let encoder = GzEncoder::new(File::create(target)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(sandbox_id, workspace)?;
    builder.into_inner()?.finish()?;
    Ok(())
}

fn extract_archive(archive: &Path, root: &Path, sandbox_id: &str) -> SandcoreResult<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(archive)?));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if !path.starts_with(sandbox_id) {
            return Err(SandcoreError::InvalidPath(format!(
                "snapshot entry outside of workspace: {}",
                path.display()
            )));
        }

        entry.unpack_in(root)?;
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
