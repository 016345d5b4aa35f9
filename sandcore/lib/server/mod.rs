//! The HTTP service.
//!
//! Exposes the sandbox API under `/sandboxes`, usage under `/usage`, and the preview router under
//! `/preview`. Errors are rendered as a JSON [`ErrorResponse`].

mod handlers;
mod routes;
mod state;
mod types;

use tokio::{
    net::TcpListener,
    signal::unix::{signal, SignalKind},
};

use crate::{config::SandcoreConfig, SandcoreResult};

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use routes::*;
pub use state::*;
pub use types::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The sandcore HTTP server.
pub struct SandboxServer {
    state: ServerState,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxServer {
    /// Creates a server for the given configuration.
    pub fn new(config: SandcoreConfig) -> SandcoreResult<Self> {
        Ok(Self {
            state: ServerState::new(config)?,
        })
    }

    /// The shared state.
    pub fn state(&self) -> &ServerState {
        &self.state
    }

    /// Serves on the configured address until SIGINT or SIGTERM, then stops background jobs and
    /// fallback servers.
    pub async fn serve(self) -> SandcoreResult<()> {
        let server = self.state.config().get_server();
        let listener = TcpListener::bind((server.get_host().as_str(), *server.get_port())).await?;
        tracing::info!("server listening on {}", listener.local_addr()?);
        self.serve_on(listener).await
    }

    /// Serves on an already bound listener.
    pub async fn serve_on(self, listener: TcpListener) -> SandcoreResult<()> {
        let reaper = self.state.spawn_reaper();
        let app = create_router(self.state.clone());

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await;

        reaper.abort();
        self.state.shutdown().await;

        Ok(result?)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Resolves when the process receives SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGTERM handler");
            return std::future::pending().await;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(sigint) => sigint,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        _ = sigint.recv() => tracing::info!("received SIGINT"),
    }
}
