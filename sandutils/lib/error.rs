//! `sandutils::error` is a module containing error utilities for the sandcore project.

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a sandutils-related operation.
pub type SandutilsResult<T> = Result<T, SandutilsError>;

/// An error that occurred in one of the sandutils helpers.
#[derive(pretty_error_debug::Debug, Error)]
pub enum SandutilsError {
    /// A virtual or host path was malformed.
    #[error("path validation error: {0}")]
    PathValidation(String),

    /// An identifier did not match `[A-Za-z0-9_-]+`.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// An executable could not be found where a variable or default pointed.
    #[error("binary not found at: {0}\nSource: {1}")]
    BinaryNotFound(String, String),
}
