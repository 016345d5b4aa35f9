//! Fallback containers.
//!
//! When the lightweight runtime cannot serve a sandbox, the sandbox is promoted to a fallback
//! container: its workspace is marked active, a port is reserved, and a static file server is
//! started in its own session to serve the workspace on that port.
//!
//! - [`PortAllocator`] hands out ports from a bounded range.
//! - [`ContainerWorkspace`] owns the on-disk workspaces and their snapshots.
//! - [`FallbackProcess`] is one supervised server process.
//! - [`FallbackOrchestrator`] ties them together and implements [`ContainerPromoter`].
//! - [`serve_static`] is the built-in server launched by default.

mod orchestrator;
mod port;
mod process;
mod static_server;
mod workspace;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use orchestrator::*;
pub use port::*;
pub use process::*;
pub use static_server::*;
pub use workspace::*;
