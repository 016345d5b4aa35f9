//! `sandutils::path` is a module containing path utilities for the sandcore project.

use std::{
    env,
    path::{Path, PathBuf},
};

use typed_path::{Utf8UnixComponent, Utf8UnixPathBuf};

use crate::{SandutilsError, SandutilsResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Splits a virtual path into its normal components.
///
/// Leading `/`, `.` segments and repeated separators are ignored, so `"/a//./b/"` yields
/// `["a", "b"]` and `""` yields an empty list. Any `..` segment is rejected outright, even one that
/// would stay inside the root after normalization.
///
/// ## Examples
///
/// ```
/// use sandutils::virtual_components;
///
/// assert_eq!(virtual_components("sub/dir/file.txt").unwrap(), vec!["sub", "dir", "file.txt"]);
/// assert!(virtual_components("sub/../file.txt").is_err());
/// ```
pub fn virtual_components(path: &str) -> SandutilsResult<Vec<String>> {
    if path.contains('\0') {
        return Err(SandutilsError::PathValidation(
            "path must not contain NUL bytes".to_string(),
        ));
    }

    let path = Utf8UnixPathBuf::from(path);
    let mut components = Vec::new();

    for component in path.components() {
        match component {
            Utf8UnixComponent::RootDir | Utf8UnixComponent::CurDir => continue,
            Utf8UnixComponent::ParentDir => {
                return Err(SandutilsError::PathValidation(format!(
                    "parent directory segments are not allowed: {path}"
                )));
            }
            Utf8UnixComponent::Normal(c) => {
                if !c.is_empty() {
                    components.push(c.to_string());
                }
            }
        }
    }

    Ok(components)
}

/// Lexically normalizes an absolute host path, resolving `.` and `..`.
///
/// Returns an error if the path is relative or climbs above `/`.
pub fn normalize_absolute(path: &Path) -> SandutilsResult<PathBuf> {
    if !path.is_absolute() {
        return Err(SandutilsError::PathValidation(format!(
            "path must be absolute: {}",
            path.display()
        )));
    }

    let mut normalized = PathBuf::from("/");
    for component in path.components() {
        match component {
            std::path::Component::RootDir | std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                if !normalized.pop() {
                    return Err(SandutilsError::PathValidation(format!(
                        "cannot traverse above root directory: {}",
                        path.display()
                    )));
                }
            }
            std::path::Component::Normal(c) => normalized.push(c),
            std::path::Component::Prefix(_) => {
                return Err(SandutilsError::PathValidation(format!(
                    "unsupported path prefix: {}",
                    path.display()
                )));
            }
        }
    }

    Ok(normalized)
}

/// Returns `true` if `path`, after lexical normalization, is `root` or lies beneath it.
pub fn is_within(path: &Path, root: &Path) -> bool {
    match (normalize_absolute(path), normalize_absolute(root)) {
        (Ok(path), Ok(root)) => path.starts_with(root),
        _ => false,
    }
}

/// Resolves an executable path that can be overridden from the environment.
///
/// If `env_var` is set it must point at an existing file, otherwise the default is used and must
/// exist.
pub fn resolve_env_path(env_var: &str, default_path: impl AsRef<Path>) -> SandutilsResult<PathBuf> {
    let (path, source) = match env::var_os(env_var) {
        Some(value) => (PathBuf::from(value), format!("environment variable {env_var}")),
        None => (default_path.as_ref().to_path_buf(), "default path".to_string()),
    };

    if !path.exists() {
        return Err(SandutilsError::BinaryNotFound(
            path.display().to_string(),
            source,
        ));
    }

    tracing::debug!(path = %path.display(), %source, "resolved executable path");
    Ok(path)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
