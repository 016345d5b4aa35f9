//! `sandcore` runs ephemeral, per-user compute sandboxes.
//!
//! # Overview
//!
//! A sandbox is a workspace directory that can run short-lived commands, expose network
//! previews, and be snapshotted and restored. sandcore handles:
//! - Sandbox lifecycle, from creation through idle expiry
//! - Command execution with a per-sandbox sliding-window quota
//! - Promotion of a sandbox to a supervised fallback server when the lightweight runtime cannot
//!   serve it
//! - Preview proxying with transparent failover to the fallback
//! - A durable audit log of lifecycle events
//!
//! Only `python` and `node` run directly in the lightweight runtime. Every other command, and
//! every request marked as needing a native environment, is delegated to the sandbox's fallback
//! container. The fallback container is a degraded-mode process supervisor, not a security
//! boundary.
//!
//! # Modules
//!
//! - [`cli`] - Command-line interface and argument parsing
//! - [`config`] - Configuration types and defaults
//! - [`fallback`] - Port allocation, workspaces, snapshots and fallback process supervision
//! - [`preview`] - Preview registry, health probing and the proxy router
//! - [`runtime`] - Sandboxes, execution, background jobs, quotas and audit events
//! - [`server`] - REST API server implementation
//! - [`storage`] - Snapshot storage backends
//! - [`utils`] - Common utilities and helpers
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use sandcore::{config::SandcoreConfig, runtime::ExecRequest, server::ServerState};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let state = ServerState::new(SandcoreConfig::default())?;
//!
//!     let sandbox = state.manager().create_sandbox(None).await?;
//!     let request = ExecRequest::builder()
//!         .command("python")
//!         .code("print('hello')")
//!         .build();
//!
//!     let outcome = state.manager().exec_command(&sandbox.sandbox_id, request).await?;
//!     println!("{}", serde_json::to_string(&outcome)?);
//!
//!     state.destroy_sandbox(&sandbox.sandbox_id).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod cli;
pub mod config;
pub mod fallback;
pub mod preview;
pub mod runtime;
pub mod server;
pub mod storage;
pub mod utils;

pub use error::*;
