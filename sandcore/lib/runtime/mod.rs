//! The lightweight sandbox runtime.
//!
//! A sandbox lives here as a [`SandboxInstance`]: a workspace directory behind a [`VirtualFs`],
//! plus its preview ports and background jobs. The [`SandboxManager`] owns every instance and
//! runs commands in them, consulting the [`QuotaManager`] first and delegating anything it
//! cannot run locally to a fallback container. Lifecycle events go to the [`EventRecorder`].

mod background;
mod instance;
mod manager;
mod quota;
mod recorder;
mod vfs;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use background::*;
pub use instance::*;
pub use manager::*;
pub use quota::*;
pub use recorder::*;
pub use vfs::*;
