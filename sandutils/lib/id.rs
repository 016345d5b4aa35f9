//! Identifier validation for names that end up as path components and process arguments.

use crate::{SandutilsError, SandutilsResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The maximum length in bytes of an identifier.
pub const MAX_ID_LEN: usize = 128;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns `true` if `id` is non-empty, at most [`MAX_ID_LEN`] bytes, and made only of ASCII
/// letters, digits, `_` and `-`.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Validates an identifier, naming it by `label` in the error message.
///
/// ## Examples
///
/// ```
/// use sandutils::validate_id;
///
/// assert!(validate_id("sandbox_01", "sandbox id").is_ok());
/// assert!(validate_id("../etc", "sandbox id").is_err());
/// ```
pub fn validate_id(id: &str, label: &str) -> SandutilsResult<()> {
    if is_valid_id(id) {
        return Ok(());
    }

    Err(SandutilsError::InvalidId(format!(
        "{label} must match [A-Za-z0-9_-]{{1,{MAX_ID_LEN}}}: {id:?}"
    )))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
