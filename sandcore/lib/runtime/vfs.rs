//! A path-confined view of a sandbox workspace with alias-based external mounts.
//!
//! Virtual paths are `/`-separated and relative to the workspace. If the first segment of a path
//! names a mount alias, the rest of the path resolves inside the mount target instead. Parent
//! directory segments are rejected everywhere, and symlinks that lead outside the resolved base
//! are refused.
//!
//! All methods do blocking I/O; callers on the async runtime should go through
//! `tokio::task::spawn_blocking`.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use sandutils::{is_valid_id, virtual_components};

use crate::{SandcoreError, SandcoreResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A file store confined to a workspace directory plus any number of mounted host directories.
#[derive(Debug, Clone)]
pub struct VirtualFs {
    root: PathBuf,
    mounts: BTreeMap<String, PathBuf>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VirtualFs {
    /// Creates a file store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> SandcoreResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            mounts: BTreeMap::new(),
        })
    }

    /// The workspace directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The mounted aliases and their host targets.
    pub fn mounts(&self) -> &BTreeMap<String, PathBuf> {
        &self.mounts
    }

    /// Maps `alias` to the existing host directory `target`. Re-mounting an alias replaces it.
    pub fn mount(&mut self, alias: &str, target: &Path) -> SandcoreResult<PathBuf> {
        if !is_valid_id(alias) {
            return Err(SandcoreError::InvalidArgument(format!(
                "mount alias must match [A-Za-z0-9_-]+: {alias:?}"
            )));
        }

        let target = match fs::canonicalize(target) {
            Ok(path) => path,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SandcoreError::MountTargetNotFound(
                    target.display().to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        };

        if !target.is_dir() {
            return Err(SandcoreError::InvalidArgument(format!(
                "mount target is not a directory: {}",
                target.display()
            )));
        }

        self.mounts.insert(alias.to_string(), target.clone());
        Ok(target)
    }

    /// Resolves a virtual path to a host path inside the workspace or a mount.
    pub fn resolve(&self, path: &str) -> SandcoreResult<PathBuf> {
        self.resolve_with_base(path).map(|(_, resolved)| resolved)
    }

    /// Writes `data` to `path`, creating parent directories as needed.
    pub fn write(&self, path: &str, data: &[u8]) -> SandcoreResult<()> {
        let (base, resolved) = self.resolve_with_base(path)?;
        if resolved == base {
            return Err(SandcoreError::InvalidPath(format!(
                "cannot write to a directory root: {path:?}"
            )));
        }

        if let Ok(metadata) = fs::symlink_metadata(&resolved) {
            if metadata.file_type().is_symlink() {
                return Err(SandcoreError::InvalidPath(format!(
                    "refusing to write through a symlink: {path:?}"
                )));
            }
        }

        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&resolved, data)?;
        Ok(())
    }

    /// Reads the file at `path`.
    pub fn read(&self, path: &str) -> SandcoreResult<Vec<u8>> {
        let resolved = self.resolve(path)?;
        match fs::metadata(&resolved) {
            Ok(metadata) if metadata.is_dir() => Err(SandcoreError::InvalidPath(format!(
                "is a directory: {path:?}"
            ))),
            Ok(_) => Ok(fs::read(&resolved)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(SandcoreError::FileNotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Lists the directory at `path` as sorted virtual paths. A missing directory is empty.
    ///
    /// Listing the workspace root also shows the mount aliases.
    pub fn list_dir(&self, path: &str) -> SandcoreResult<Vec<String>> {
        let resolved = self.resolve(path)?;
        let components = virtual_components(path)?;

        let mut entries = Vec::new();
        match fs::metadata(&resolved) {
            Ok(metadata) if !metadata.is_dir() => {
                return Err(SandcoreError::InvalidPath(format!(
                    "not a directory: {path:?}"
                )));
            }
            Ok(_) => {
                for entry in fs::read_dir(&resolved)? {
                    let entry = entry?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    entries.push(join_virtual(&components, &name));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if components.is_empty() {
            for alias in self.mounts.keys() {
                let alias = alias.clone();
                if !entries.contains(&alias) {
                    entries.push(alias);
                }
            }
        }

        entries.sort();
        Ok(entries)
    }

    fn resolve_with_base(&self, path: &str) -> SandcoreResult<(PathBuf, PathBuf)> {
        let components = virtual_components(path).map_err(|e| match e {
            sandutils::SandutilsError::PathValidation(msg) => SandcoreError::InvalidPath(msg),
            other => other.into(),
        })?;

        let (base, rest) = match components.split_first() {
            Some((first, rest)) if self.mounts.contains_key(first) => {
                (self.mounts[first].clone(), rest)
            }
            _ => (self.root.clone(), components.as_slice()),
        };

        let resolved = rest.iter().fold(base.clone(), |path, part| path.join(part));
        ensure_contained(&base, &resolved, path)?;

        Ok((base, resolved))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Checks that the deepest existing ancestor of `resolved` (the path itself when it exists) lands
/// inside `base` once symlinks are followed. A dangling symlink on the way is refused.
fn ensure_contained(base: &Path, resolved: &Path, path: &str) -> SandcoreResult<()> {
    let base = fs::canonicalize(base)?;
    let Some(existing) = resolved
        .ancestors()
        .find(|ancestor| fs::symlink_metadata(ancestor).is_ok())
    else {
        return Err(SandcoreError::InvalidPath(format!(
            "path has no existing ancestor: {path:?}"
        )));
    };

    let existing = match fs::canonicalize(existing) {
        Ok(existing) => existing,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(SandcoreError::InvalidPath(format!(
                "path goes through a dangling symlink: {path:?}"
            )));
        }
        Err(e) => return Err(e.into()),
    };

    if !existing.starts_with(&base) {
        return Err(SandcoreError::InvalidPath(format!(
            "path escapes its root: {path:?}"
        )));
    }

    Ok(())
}

fn join_virtual(components: &[String], name: &str) -> String {
    if components.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", components.join("/"), name)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let vfs = VirtualFs::new(dir.path().join("ws"))?;

        vfs.write("sub/dir/file.txt", b"\x00binary\xffdata")?;
        assert_eq!(vfs.read("sub/dir/file.txt")?, b"\x00binary\xffdata");
        assert_eq!(vfs.read("/sub/./dir//file.txt")?, b"\x00binary\xffdata");
        assert!(dir.path().join("ws/sub/dir/file.txt").is_file());
        Ok(())
    }

    #[test]
    fn test_rejects_parent_segments() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let vfs = VirtualFs::new(dir.path().join("ws"))?;

        for path in ["../etc/passwd", "a/../b", "a/b/..", ".."] {
            assert!(matches!(
                vfs.write(path, b"x"),
                Err(SandcoreError::InvalidPath(_))
            ));
            assert!(matches!(vfs.read(path), Err(SandcoreError::InvalidPath(_))));
        }
        Ok(())
    }

    #[test]
    fn test_read_missing_and_directory() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let vfs = VirtualFs::new(dir.path().join("ws"))?;
        vfs.write("d/f.txt", b"x")?;

        assert!(matches!(
            vfs.read("missing.txt"),
            Err(SandcoreError::FileNotFound(_))
        ));
        assert!(matches!(vfs.read("d"), Err(SandcoreError::InvalidPath(_))));
        assert!(matches!(vfs.write("", b"x"), Err(SandcoreError::InvalidPath(_))));
        Ok(())
    }

    #[test]
    fn test_list_dir() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let vfs = VirtualFs::new(dir.path().join("ws"))?;
        vfs.write("b.txt", b"b")?;
        vfs.write("a.txt", b"a")?;
        vfs.write("sub/c.txt", b"c")?;

        assert_eq!(vfs.list_dir("")?, vec!["a.txt", "b.txt", "sub"]);
        assert_eq!(vfs.list_dir("sub")?, vec!["sub/c.txt"]);
        assert!(vfs.list_dir("nothing/here")?.is_empty());
        assert!(matches!(
            vfs.list_dir("a.txt"),
            Err(SandcoreError::InvalidPath(_))
        ));
        Ok(())
    }

    #[test]
    fn test_mount_resolution_is_transparent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let external = dir.path().join("external");
        fs::create_dir_all(&external)?;
        fs::write(external.join("shared.txt"), b"shared")?;

        let mut vfs = VirtualFs::new(dir.path().join("ws"))?;
        vfs.mount("data", &external)?;

        assert_eq!(vfs.read("data/shared.txt")?, b"shared");
        vfs.write("data/new/out.txt", b"out")?;
        assert_eq!(fs::read(external.join("new/out.txt"))?, b"out");
        assert!(vfs.list_dir("")?.contains(&"data".to_string()));
        assert_eq!(vfs.list_dir("data/new")?, vec!["data/new/out.txt"]);
        Ok(())
    }

    #[test]
    fn test_mount_errors() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut vfs = VirtualFs::new(dir.path().join("ws"))?;

        assert!(matches!(
            vfs.mount("data", &dir.path().join("missing")),
            Err(SandcoreError::MountTargetNotFound(_))
        ));
        assert!(matches!(
            vfs.mount("bad/alias", dir.path()),
            Err(SandcoreError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_is_refused() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let outside = dir.path().join("outside");
        fs::create_dir_all(&outside)?;
        fs::write(outside.join("secret.txt"), b"secret")?;

        let vfs = VirtualFs::new(dir.path().join("ws"))?;
        std::os::unix::fs::symlink(&outside, dir.path().join("ws/link"))?;

        assert!(matches!(
            vfs.read("link/secret.txt"),
            Err(SandcoreError::InvalidPath(_))
        ));
        assert!(matches!(
            vfs.write("link/new.txt", b"x"),
            Err(SandcoreError::InvalidPath(_))
        ));
        assert!(!outside.join("new.txt").exists());

        assert!(matches!(
            vfs.write("link/a/b/f.txt", b"x"),
            Err(SandcoreError::InvalidPath(_))
        ));
        assert!(!outside.join("a").exists());

        std::os::unix::fs::symlink(
            outside.join("pwned.txt"),
            dir.path().join("ws/dangling"),
        )?;
        assert!(matches!(
            vfs.write("dangling", b"x"),
            Err(SandcoreError::InvalidPath(_))
        ));
        assert!(matches!(
            vfs.read("dangling"),
            Err(SandcoreError::InvalidPath(_))
        ));
        assert!(!outside.join("pwned.txt").exists());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_write_through_inner_symlink_is_refused() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let vfs = VirtualFs::new(dir.path().join("ws"))?;
        vfs.write("real.txt", b"real")?;
        std::os::unix::fs::symlink(dir.path().join("ws/real.txt"), dir.path().join("ws/alias"))?;

        assert_eq!(vfs.read("alias")?, b"real");
        assert!(matches!(
            vfs.write("alias", b"x"),
            Err(SandcoreError::InvalidPath(_))
        ));
        assert_eq!(vfs.read("real.txt")?, b"real");
        Ok(())
    }
}
