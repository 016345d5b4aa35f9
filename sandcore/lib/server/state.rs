//! Server state management.
//!
//! [`ServerState`] wires every component together and is shared by all request handlers. It also
//! owns the operations that span several components, such as tearing a sandbox down.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use sandutils::{is_within, normalize_absolute};
use tokio::{task::JoinHandle, time};

use crate::{
    config::SandcoreConfig,
    fallback::{ContainerWorkspace, FallbackOrchestrator, FallbackServer, PortAllocator},
    preview::{build_client, HealthChecker, PreviewRegistry, PreviewRouter},
    runtime::{BackgroundExecutor, EventRecorder, QuotaManager, SandboxManager, SandboxUsage, UsageTotals},
    storage::{LocalStorage, StorageBackend},
    utils::dir_size,
    SandcoreError, SandcoreResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Shared server state.
///
/// Cloning is cheap; every component sits behind an `Arc`.
#[derive(Clone)]
pub struct ServerState {
    config: Arc<SandcoreConfig>,
    manager: Arc<SandboxManager>,
    background: Arc<BackgroundExecutor>,
    orchestrator: Arc<FallbackOrchestrator>,
    registry: Arc<PreviewRegistry>,
    router: Arc<PreviewRouter>,
    quota: Arc<QuotaManager>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ServerState {
    /// Builds every component from the configuration.
    pub fn new(config: SandcoreConfig) -> SandcoreResult<Self> {
        let server = FallbackServer::from_config(config.get_fallback())?;
        Self::with_fallback_server(config, server)
    }

    /// Builds every component, launching fallback containers with `server`.
    pub fn with_fallback_server(
        config: SandcoreConfig,
        server: FallbackServer,
    ) -> SandcoreResult<Self> {
        let recorder = Arc::new(EventRecorder::new(config.get_events_file())?);
        let quota = Arc::new(QuotaManager::new(config.get_quota().clone()));

        let storage: Arc<dyn StorageBackend> =
            Arc::new(LocalStorage::new(config.get_snapshot_root()));
        let workspace = Arc::new(ContainerWorkspace::new(config.get_sandbox_root(), storage));
        let ports = Arc::new(PortAllocator::new(*config.get_fallback().get_port_range()));
        let orchestrator = Arc::new(FallbackOrchestrator::new(
            workspace,
            ports,
            server,
            config.get_fallback(),
        ));

        let manager = Arc::new(SandboxManager::new(
            config.get_sandbox_root(),
            config.get_exec().default_timeout(),
            orchestrator.clone(),
            quota.clone(),
            recorder,
        ));
        let background = Arc::new(BackgroundExecutor::new(
            manager.clone(),
            config.get_exec().background_timeout(),
        ));

        let preview = config.get_preview();
        let client = build_client(preview.request_timeout())?;
        let registry = Arc::new(PreviewRegistry::new(
            HealthChecker::new(client.clone(), preview.health_timeout()),
            preview.health_debounce(),
        ));
        let router = Arc::new(PreviewRouter::with_client(
            client,
            registry.clone(),
            orchestrator.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            manager,
            background,
            orchestrator,
            registry,
            router,
            quota,
        })
    }

    /// The configuration.
    pub fn config(&self) -> &Arc<SandcoreConfig> {
        &self.config
    }

    /// The sandbox manager.
    pub fn manager(&self) -> &Arc<SandboxManager> {
        &self.manager
    }

    /// The background job executor.
    pub fn background(&self) -> &Arc<BackgroundExecutor> {
        &self.background
    }

    /// The fallback orchestrator.
    pub fn orchestrator(&self) -> &Arc<FallbackOrchestrator> {
        &self.orchestrator
    }

    /// The preview registry.
    pub fn registry(&self) -> &Arc<PreviewRegistry> {
        &self.registry
    }

    /// The preview router.
    pub fn router(&self) -> &Arc<PreviewRouter> {
        &self.router
    }

    /// The quota manager.
    pub fn quota(&self) -> &Arc<QuotaManager> {
        &self.quota
    }

    /// Tears a sandbox down completely.
    ///
    /// Background jobs are stopped, the fallback container is stopped, preview targets are
    /// evicted, the sandbox leaves the manager, and its workspace is deleted.
    pub async fn destroy_sandbox(&self, sandbox_id: &str) -> SandcoreResult<()> {
        if !self.manager.contains(sandbox_id).await {
            return Err(SandcoreError::SandboxNotFound(sandbox_id.to_string()));
        }

        self.background.stop_sandbox_jobs(sandbox_id).await?;
        self.orchestrator.stop_container(sandbox_id).await?;
        let evicted = self.registry.evict_sandbox(sandbox_id);
        self.manager.delete_sandbox(sandbox_id).await?;
        self.orchestrator.workspace().remove(sandbox_id).await?;

        tracing::info!(sandbox_id, evicted_previews = evicted, "destroyed sandbox");
        Ok(())
    }

    /// Exposes a port of a sandbox through the preview router and returns its public URL.
    pub async fn expose_preview(&self, sandbox_id: &str, port: u16) -> SandcoreResult<String> {
        if !self.manager.contains(sandbox_id).await {
            return Err(SandcoreError::SandboxNotFound(sandbox_id.to_string()));
        }

        let backend_url = format!("http://127.0.0.1:{port}");
        self.registry
            .register(sandbox_id, port, &backend_url, Default::default());

        let url = format!(
            "{}/preview/{sandbox_id}/{port}",
            self.config.get_server().public_base_url()
        );
        self.manager.register_preview(sandbox_id, port, &url).await?;

        Ok(url)
    }

    /// Mounts a host directory into a sandbox after checking it lies under the mount root.
    pub async fn mount(&self, sandbox_id: &str, alias: &str, target: &Path) -> SandcoreResult<PathBuf> {
        let mount_root = self.config.get_mount_root().clone();
        let lexical = normalize_absolute(target)?;
        if !is_within(&lexical, &mount_root) {
            return Err(SandcoreError::PermissionDenied(format!(
                "mount target must be under {}",
                mount_root.display()
            )));
        }

        let (resolved, resolved_root) = tokio::task::spawn_blocking(move || {
            let root = std::fs::canonicalize(&mount_root).unwrap_or(mount_root);
            (std::fs::canonicalize(&lexical), root)
        })
        .await?;

        let resolved = resolved.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                SandcoreError::MountTargetNotFound(target.display().to_string())
            }
            _ => e.into(),
        })?;

        if !is_within(&resolved, &resolved_root) {
            return Err(SandcoreError::PermissionDenied(format!(
                "mount target resolves outside {}",
                resolved_root.display()
            )));
        }

        self.manager.mount(sandbox_id, alias, &resolved).await
    }

    /// The usage of one sandbox, with its storage measured now.
    pub async fn sandbox_usage(&self, sandbox_id: &str) -> SandcoreResult<SandboxUsage> {
        let summary = self.manager.get_sandbox(sandbox_id).await?;
        let bytes = dir_size(summary.workspace).await?;
        self.quota.record_storage_usage(sandbox_id, bytes);
        Ok(self.quota.get_usage(sandbox_id))
    }

    /// Usage totals across every sandbox, with storage measured now.
    pub async fn total_usage(&self) -> SandcoreResult<UsageTotals> {
        for summary in self.manager.list_sandboxes().await {
            let bytes = dir_size(summary.workspace).await?;
            self.quota.record_storage_usage(&summary.sandbox_id, bytes);
        }
        Ok(self.quota.get_all_usage())
    }

    /// Runs one sweep: reaps exited fallback servers, then destroys idle sandboxes.
    pub async fn sweep(&self) {
        match self.orchestrator.cleanup_stale().await {
            Ok(reaped) if !reaped.is_empty() => {
                tracing::info!(count = reaped.len(), "reaped exited fallback servers")
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "fallback cleanup failed"),
        }

        let Some(ttl) = self.config.idle_timeout() else {
            return;
        };

        for sandbox_id in self.manager.idle_sandboxes(ttl).await {
            tracing::info!(sandbox_id, idle_timeout_secs = ttl.as_secs(), "destroying idle sandbox");
            if let Err(e) = self.destroy_sandbox(&sandbox_id).await {
                tracing::warn!(sandbox_id, error = %e, "failed to destroy idle sandbox");
            }
        }
    }

    /// Starts the periodic sweep task.
    pub fn spawn_reaper(&self) -> JoinHandle<()> {
        let state = self.clone();
        let period = self.config.get_fallback().cleanup_interval();

        tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                state.sweep().await;
            }
        })
    }

    /// Stops every background job and fallback server.
    pub async fn shutdown(&self) {
        self.background.shutdown().await;
        self.orchestrator.shutdown().await;
        tracing::info!("sandcore state shut down");
    }
}
