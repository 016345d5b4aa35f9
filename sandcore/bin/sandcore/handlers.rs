use std::{
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
};

use sandcore::{
    cli::FallbackAction,
    config::SandcoreConfig,
    fallback::{serve_static, ContainerWorkspace},
    server::SandboxServer,
    storage::LocalStorage,
    SandcoreResult,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const LOG_FILE_PREFIX: &str = "sandcore.log";
const DEFAULT_LOG_FILTER: &str = "sandcore=info";
const VERBOSE_LOG_FILTER: &str = "sandcore=debug";

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

pub async fn serve_subcommand(
    host: Option<String>,
    port: Option<u16>,
    config: Option<PathBuf>,
) -> SandcoreResult<()> {
    let mut config = SandcoreConfig::load(config.as_deref()).await?;
    config.set_listen_address(host, port);

    SandboxServer::new(config)?.serve().await
}

pub async fn static_serve_subcommand(port: u16, bind: IpAddr, root: PathBuf) -> SandcoreResult<()> {
    serve_static(root, SocketAddr::new(bind, port)).await
}

pub async fn fallback_subcommand(
    config: Option<PathBuf>,
    action: FallbackAction,
) -> SandcoreResult<()> {
    let config = SandcoreConfig::load(config.as_deref()).await?;
    let storage = Arc::new(LocalStorage::new(config.get_snapshot_root()));
    let workspace = ContainerWorkspace::new(config.get_sandbox_root(), storage);

    match action {
        FallbackAction::Create { sandbox_id } => {
            let path = workspace.create(&sandbox_id).await?;
            println!("{}", path.display());
        }
        FallbackAction::Start { sandbox_id } => {
            report(&sandbox_id, "started", workspace.start(&sandbox_id).await?);
        }
        FallbackAction::Stop { sandbox_id } => {
            report(&sandbox_id, "stopped", workspace.stop(&sandbox_id).await?);
        }
        FallbackAction::Restart { sandbox_id } => {
            report(&sandbox_id, "restarted", workspace.restart(&sandbox_id).await?);
        }
        FallbackAction::Remove { sandbox_id } => {
            report(&sandbox_id, "removed", workspace.remove(&sandbox_id).await?);
        }
        FallbackAction::Status { sandbox_id } => {
            let status = workspace.status(&sandbox_id).await?;
            println!("{}", serde_json::to_string(&status)?.trim_matches('"'));
        }
        FallbackAction::Snapshot {
            sandbox_id,
            snapshot_id,
        } => {
            let info = workspace
                .create_snapshot(&sandbox_id, snapshot_id.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        FallbackAction::Restore {
            sandbox_id,
            snapshot_id,
        } => {
            workspace.restore_snapshot(&sandbox_id, &snapshot_id).await?;
            println!("restored {sandbox_id} from {snapshot_id}");
        }
        FallbackAction::Snapshots { sandbox_id } => {
            let snapshots = workspace.list_snapshots(&sandbox_id).await?;
            println!("{}", serde_json::to_string_pretty(&snapshots)?);
        }
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Installs the tracing subscriber, adding a daily-rotated file writer when `log_dir` is given.
///
/// The returned guard flushes the file writer when dropped.
pub fn init_tracing(verbose: bool, log_dir: Option<&Path>) -> SandcoreResult<Option<WorkerGuard>> {
    let filter = if verbose {
        EnvFilter::new(VERBOSE_LOG_FILTER)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    let stdout_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true);

    let Some(log_dir) = log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .init();
        return Ok(None);
    };

    std::fs::create_dir_all(log_dir)?;
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX));

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(fmt::layer().with_ansi(false).with_writer(writer))
        .init();

    Ok(Some(guard))
}

fn report(sandbox_id: &str, action: &str, changed: bool) {
    if changed {
        println!("{action} {sandbox_id}");
    } else {
        println!("{sandbox_id}: nothing to do");
    }
}
