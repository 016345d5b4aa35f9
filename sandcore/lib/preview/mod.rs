//! Preview routing.
//!
//! External HTTP traffic for a sandbox preview arrives at `/preview/{sandbox_id}/{port}/...`. The
//! [`PreviewRegistry`] maps each `(sandbox_id, port)` to the URL serving it, and the
//! [`PreviewRouter`] forwards requests there. When the primary upstream cannot be reached, the
//! router promotes the sandbox to a fallback container, records the fallback URL in the
//! registry, and retries once.

mod health;
mod registry;
mod router;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use health::*;
pub use registry::*;
pub use router::*;
