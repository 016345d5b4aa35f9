use std::{
    error::Error,
    fmt::{self, Display},
};

use sandutils::SandutilsError;
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a sandcore-related operation.
pub type SandcoreResult<T> = Result<T, SandcoreError>;

/// An error that occurred while managing sandboxes, fallback containers or previews.
#[derive(pretty_error_debug::Debug, Error)]
pub enum SandcoreError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// An error from one of the shared utilities.
    #[error(transparent)]
    Utils(#[from] SandutilsError),

    /// An error that occurred during an HTTP request.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// An error that occurred when (de)serializing JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error that occurred when parsing a TOML configuration.
    #[error("config parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// The configuration is unusable.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A port range could not be parsed or is empty.
    #[error("invalid port range: {0}")]
    InvalidPortRange(String),

    /// No sandbox with the given id exists.
    #[error("sandbox not found: {0}")]
    SandboxNotFound(String),

    /// A sandbox with the given id already exists.
    #[error("sandbox already exists: {0}")]
    SandboxAlreadyExists(String),

    /// The concurrent sandbox limit has been reached.
    #[error("sandbox limit reached: at most {0} sandboxes may exist at once")]
    SandboxLimitReached(usize),

    /// A sandbox id does not match the allowed charset.
    #[error("invalid sandbox id: {0}")]
    InvalidSandboxId(String),

    /// No background job with the given id is running for the sandbox.
    #[error("background job {job_id} not found in sandbox {sandbox_id}")]
    JobNotFound {
        /// The sandbox the job was looked up in.
        sandbox_id: String,

        /// The missing job.
        job_id: String,
    },

    /// No preview target is registered for the sandbox and port.
    #[error("preview target not found: {sandbox_id}:{port}")]
    PreviewTargetNotFound {
        /// The sandbox of the target.
        sandbox_id: String,

        /// The port of the target.
        port: u16,
    },

    /// A file inside a sandbox does not exist.
    #[error("file not found: {0}")]
    FileNotFound(String),

    /// A mount target on the host does not exist.
    #[error("mount target not found: {0}")]
    MountTargetNotFound(String),

    /// A snapshot does not exist.
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// A path is malformed or escapes its root.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// A request argument is malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not permitted.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Every port of the fallback range is in use.
    #[error("no free port in range {start}-{end}")]
    PortRangeExhausted {
        /// First port of the range.
        start: u16,

        /// Last port of the range.
        end: u16,
    },

    /// The upstream of a preview could not be reached.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The interpreter for an allowed command is not installed.
    #[error("command not found on PATH: {0}")]
    CommandNotFound(String),

    /// The fallback server could not be started.
    #[error("failed to start fallback server for {sandbox_id}: {reason}")]
    FallbackSpawn {
        /// The sandbox being promoted.
        sandbox_id: String,

        /// Why the spawn failed.
        reason: String,
    },
}

/// The broad class of a [`SandcoreError`], used to pick a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Something the caller asked for does not exist.
    NotFound,

    /// The caller sent malformed input.
    InvalidInput,

    /// The caller is not allowed to do this.
    PermissionDenied,

    /// The request clashes with existing state.
    Conflict,

    /// A bounded resource has run out.
    ResourceExhausted,

    /// A preview upstream could not be reached.
    UpstreamUnavailable,

    /// Anything else.
    Internal,
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandcoreError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> SandcoreError {
        SandcoreError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SandboxNotFound(_)
            | Self::JobNotFound { .. }
            | Self::PreviewTargetNotFound { .. }
            | Self::FileNotFound(_)
            | Self::MountTargetNotFound(_)
            | Self::SnapshotNotFound(_) => ErrorKind::NotFound,
            Self::InvalidSandboxId(_)
            | Self::InvalidPath(_)
            | Self::InvalidArgument(_)
            | Self::InvalidPortRange(_) => ErrorKind::InvalidInput,
            Self::Utils(SandutilsError::PathValidation(_) | SandutilsError::InvalidId(_)) => {
                ErrorKind::InvalidInput
            }
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::SandboxAlreadyExists(_) => ErrorKind::Conflict,
            Self::SandboxLimitReached(_) | Self::PortRangeExhausted { .. } => {
                ErrorKind::ResourceExhausted
            }
            Self::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            _ => ErrorKind::Internal,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            SandcoreError::SandboxNotFound("x".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            SandcoreError::Utils(SandutilsError::PathValidation("..".into())).kind(),
            ErrorKind::InvalidInput
        );
        assert_eq!(
            SandcoreError::PortRangeExhausted {
                start: 1,
                end: 2
            }
            .kind(),
            ErrorKind::ResourceExhausted
        );
        assert_eq!(
            SandcoreError::UpstreamUnavailable("refused".into()).kind(),
            ErrorKind::UpstreamUnavailable
        );
        assert_eq!(
            SandcoreError::custom(anyhow::anyhow!("boom")).kind(),
            ErrorKind::Internal
        );
    }
}
