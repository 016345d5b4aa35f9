//! Promotion of sandboxes to supervised fallback servers.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{sync::Mutex, time};

use crate::{config::FallbackConfig, SandcoreResult};

use super::{ContainerWorkspace, FallbackProcess, FallbackServer, PortAllocator};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Something that can stand up a fallback container for a sandbox and hand back its URL.
#[async_trait]
pub trait ContainerPromoter: Send + Sync {
    /// Ensures a fallback server is running for `sandbox_id` and returns its base URL.
    async fn promote_to_container(&self, sandbox_id: &str) -> SandcoreResult<String>;
}

/// Composes the workspace layer, the port allocator and process supervision.
///
/// At most one live [`FallbackProcess`] exists per sandbox. The process map is the only owner of
/// process handles and their log files.
pub struct FallbackOrchestrator {
    workspace: Arc<ContainerWorkspace>,
    ports: Arc<PortAllocator>,
    server: FallbackServer,
    startup_grace: Duration,
    stop_timeout: Duration,
    processes: Mutex<HashMap<String, FallbackProcess>>,
}

/// A snapshot of one tracked fallback server.
#[derive(Debug, Clone, Serialize)]
pub struct FallbackStatus {
    /// The sandbox.
    pub sandbox_id: String,

    /// The port the server is bound to.
    pub port: u16,

    /// The server URL.
    pub url: String,

    /// OS process id.
    pub pid: Option<u32>,

    /// Whether the process was alive when the status was taken.
    pub running: bool,

    /// When the server was spawned.
    pub started_at: DateTime<Utc>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FallbackOrchestrator {
    /// Creates an orchestrator.
    pub fn new(
        workspace: Arc<ContainerWorkspace>,
        ports: Arc<PortAllocator>,
        server: FallbackServer,
        config: &FallbackConfig,
    ) -> Self {
        Self {
            workspace,
            ports,
            server,
            startup_grace: config.startup_grace(),
            stop_timeout: config.stop_timeout(),
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// The workspace layer used by this orchestrator.
    pub fn workspace(&self) -> &Arc<ContainerWorkspace> {
        &self.workspace
    }

    /// The port allocator used by this orchestrator.
    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    /// Starts a fallback server for `sandbox_id`, or returns the URL of the one already running.
    ///
    /// Promotions are serialized by a single lock held until the new server has had its startup
    /// grace period, so concurrent callers for the same sandbox observe one spawn and one URL.
    pub async fn promote(&self, sandbox_id: &str) -> SandcoreResult<String> {
        let mut processes = self.processes.lock().await;

        if let Some(existing) = processes.get_mut(sandbox_id) {
            if existing.is_running() {
                return Ok(existing.url().to_string());
            }

            if let Some(mut dead) = processes.remove(sandbox_id) {
                tracing::info!(sandbox_id, port = dead.port(), "replacing exited fallback server");
                dead.close_handles();
                self.ports.release(dead.port()).await;
            }
        }

        let workspace = self.workspace.create(sandbox_id).await?;
        let port = self.ports.allocate().await?;

        let process = match FallbackProcess::spawn(&self.server, sandbox_id, port, &workspace).await
        {
            Ok(process) => process,
            Err(e) => {
                self.ports.release(port).await;
                if let Err(stop_err) = self.workspace.stop(sandbox_id).await {
                    tracing::warn!(sandbox_id, error = %stop_err, "failed to mark workspace inactive");
                }
                return Err(e);
            }
        };

        let url = process.url().to_string();
        processes.insert(sandbox_id.to_string(), process);

        time::sleep(self.startup_grace).await;
        tracing::info!(sandbox_id, %url, "promoted sandbox to fallback container");

        Ok(url)
    }

    /// Stops the fallback server of `sandbox_id`. Does nothing if none is tracked.
    ///
    /// The lock is held until the workspace is marked inactive, so a concurrent promotion of the
    /// same sandbox starts only after this stop has finished.
    pub async fn stop_container(&self, sandbox_id: &str) -> SandcoreResult<()> {
        let mut processes = self.processes.lock().await;
        let Some(mut process) = processes.remove(sandbox_id) else {
            return Ok(());
        };

        process.terminate(self.stop_timeout).await;
        self.ports.release(process.port()).await;
        self.workspace.stop(sandbox_id).await?;

        tracing::info!(sandbox_id, "stopped fallback container");
        Ok(())
    }

    /// Forgets every tracked server whose process has exited, releasing its port and closing its
    /// log handles. Returns the sandboxes that were reaped.
    pub async fn cleanup_stale(&self) -> SandcoreResult<Vec<String>> {
        let mut processes = self.processes.lock().await;
        let dead: Vec<String> = processes
            .iter_mut()
            .filter_map(|(id, process)| (!process.is_running()).then(|| id.clone()))
            .collect();

        let mut reaped = Vec::with_capacity(dead.len());
        for mut process in dead.iter().filter_map(|id| processes.remove(id)) {
            process.close_handles();
            self.ports.release(process.port()).await;
            if let Err(e) = self.workspace.stop(process.sandbox_id()).await {
                tracing::warn!(sandbox_id = process.sandbox_id(), error = %e, "failed to mark workspace inactive");
            }

            tracing::info!(sandbox_id = process.sandbox_id(), port = process.port(), "reaped stale fallback server");
            reaped.push(process.sandbox_id().to_string());
        }

        Ok(reaped)
    }

    /// Stops every tracked server.
    pub async fn shutdown(&self) {
        let mut processes = self.processes.lock().await;
        for (_, mut process) in processes.drain() {
            process.terminate(self.stop_timeout).await;
            self.ports.release(process.port()).await;
            if let Err(e) = self.workspace.stop(process.sandbox_id()).await {
                tracing::warn!(sandbox_id = process.sandbox_id(), error = %e, "failed to mark workspace inactive");
            }
        }
    }

    /// The URL of the live server of `sandbox_id`, if there is one.
    pub async fn url_for(&self, sandbox_id: &str) -> Option<String> {
        let mut processes = self.processes.lock().await;
        let process = processes.get_mut(sandbox_id)?;
        process.is_running().then(|| process.url().to_string())
    }

    /// The status of every tracked server.
    pub async fn list(&self) -> Vec<FallbackStatus> {
        let mut processes = self.processes.lock().await;
        let mut statuses: Vec<FallbackStatus> = processes
            .values_mut()
            .map(|process| FallbackStatus {
                sandbox_id: process.sandbox_id().to_string(),
                port: process.port(),
                url: process.url().to_string(),
                pid: process.pid(),
                running: process.is_running(),
                started_at: process.started_at(),
            })
            .collect();

        statuses.sort_by(|a, b| a.sandbox_id.cmp(&b.sandbox_id));
        statuses
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ContainerPromoter for FallbackOrchestrator {
    async fn promote_to_container(&self, sandbox_id: &str) -> SandcoreResult<String> {
        self.promote(sandbox_id).await
    }
}
