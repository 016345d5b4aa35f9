//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Overrides the directory holding sandbox workspaces.
pub const SANDBOX_ROOT_ENV_VAR: &str = "SANDBOX_ROOT";

/// Overrides the directory holding snapshot archives.
pub const SNAPSHOT_ROOT_ENV_VAR: &str = "SANDCORE_SNAPSHOT_ROOT";

/// Overrides the safe root for external mounts.
pub const MOUNT_ROOT_ENV_VAR: &str = "SANDCORE_MOUNT_ROOT";

/// Overrides the audit log location.
pub const RECORDER_FILE_ENV_VAR: &str = "SERVERLESS_RECORDER_FILE";

/// Overrides the public base URL of the preview router.
pub const PREVIEW_ROUTER_URL_ENV_VAR: &str = "PREVIEW_ROUTER_URL";

/// Overrides the fallback server executable.
pub const FALLBACK_EXE_ENV_VAR: &str = "SANDCORE_FALLBACK_EXE";

/// Environment variable that makes Python flush its output immediately.
pub const PYTHON_UNBUFFERED_ENV_VAR: &str = "PYTHONUNBUFFERED";
