//! A single supervised fallback server process.

use std::{
    env,
    fs::File,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use chrono::{DateTime, Utc};
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use sandutils::resolve_env_path;
use tokio::{
    fs::{self, OpenOptions},
    process::{Child, Command},
    time,
};

use crate::{
    config::{FallbackConfig, DEFAULT_FALLBACK_BIND},
    utils::{FALLBACK_EXE_ENV_VAR, PYTHON_UNBUFFERED_ENV_VAR},
    SandcoreError, SandcoreResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Directory under the workspace where fallback server logs go.
pub const FALLBACK_LOG_DIR: &str = "logs";

/// Log file receiving the fallback server's stdout.
pub const FALLBACK_STDOUT_LOG: &str = "fallback_http.log";

/// Log file receiving the fallback server's stderr.
pub const FALLBACK_STDERR_LOG: &str = "fallback_http.err";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How to launch a fallback server: an executable plus an argument template.
///
/// The placeholders `{port}`, `{bind}` and `{root}` in the arguments are replaced at spawn time.
#[derive(Debug, Clone)]
pub struct FallbackServer {
    exe: PathBuf,
    args: Vec<String>,
    bind: String,
}

/// A running fallback server tracked by the orchestrator.
///
/// The process owns its log file handles. [`FallbackProcess::terminate`] and
/// [`FallbackProcess::close_handles`] flush and close them.
#[derive(Debug)]
pub struct FallbackProcess {
    sandbox_id: String,
    port: u16,
    url: String,
    child: Child,
    workspace: PathBuf,
    stdout_log: Option<File>,
    stderr_log: Option<File>,
    started_at: DateTime<Utc>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FallbackServer {
    /// Creates a launcher for `exe` with the given argument template.
    pub fn new(
        exe: impl Into<PathBuf>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            exe: exe.into(),
            args: args.into_iter().map(Into::into).collect(),
            bind: DEFAULT_FALLBACK_BIND.to_string(),
        }
    }

    /// Builds the launcher described by the configuration.
    ///
    /// A configured executable is looked up on `PATH` when it is a bare name. Without one, the
    /// running executable is used unless `SANDCORE_FALLBACK_EXE` points elsewhere.
    pub fn from_config(config: &FallbackConfig) -> SandcoreResult<Self> {
        let exe = match config.get_server_exe() {
            Some(exe) => which::which(exe).map_err(|e| {
                SandcoreError::InvalidConfig(format!(
                    "fallback server executable {}: {e}",
                    exe.display()
                ))
            })?,
            None => resolve_env_path(FALLBACK_EXE_ENV_VAR, env::current_exe()?)?,
        };

        Ok(Self::new(exe, config.get_server_args().clone()))
    }

    /// The executable that gets spawned.
    pub fn exe(&self) -> &Path {
        &self.exe
    }

    /// The URL a server bound to `port` is reachable at.
    pub fn url(&self, port: u16) -> String {
        format!("http://{}:{}", self.bind, port)
    }

    /// The argument list for a server on `port` serving `root`.
    pub fn render_args(&self, port: u16, root: &Path) -> Vec<String> {
        let port = port.to_string();
        let root = root.display().to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{port}", &port)
                    .replace("{bind}", &self.bind)
                    .replace("{root}", &root)
            })
            .collect()
    }
}

impl FallbackProcess {
    /// Spawns a fallback server for `sandbox_id` on `port`, serving `workspace`.
    ///
    /// The server runs in its own session with stdout and stderr appended to files under
    /// `<workspace>/logs`. If spawning fails the log handles are closed before returning.
    pub async fn spawn(
        server: &FallbackServer,
        sandbox_id: &str,
        port: u16,
        workspace: &Path,
    ) -> SandcoreResult<Self> {
        let log_dir = workspace.join(FALLBACK_LOG_DIR);
        fs::create_dir_all(&log_dir).await?;

        let stdout_log = open_append(&log_dir.join(FALLBACK_STDOUT_LOG)).await?;
        let stderr_log = open_append(&log_dir.join(FALLBACK_STDERR_LOG)).await?;

        let mut command = Command::new(server.exe());
        command
            .args(server.render_args(port, workspace))
            .current_dir(workspace)
            .env(PYTHON_UNBUFFERED_ENV_VAR, "1")
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_log.try_clone()?))
            .stderr(Stdio::from(stderr_log.try_clone()?));

        unsafe {
            command.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let mut handles = [Some(stdout_log), Some(stderr_log)];
                close_all(&mut handles);
                return Err(SandcoreError::FallbackSpawn {
                    sandbox_id: sandbox_id.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        tracing::info!(
            sandbox_id,
            port,
            pid = child.id(),
            exe = %server.exe().display(),
            "started fallback server"
        );

        Ok(Self {
            sandbox_id: sandbox_id.to_string(),
            port,
            url: server.url(port),
            child,
            workspace: workspace.to_path_buf(),
            stdout_log: Some(stdout_log),
            stderr_log: Some(stderr_log),
            started_at: Utc::now(),
        })
    }

    /// The sandbox this server belongs to.
    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    /// The port the server is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The URL the server is reachable at.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The directory being served.
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// When the server was spawned.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// The OS process id, if the process has not been reaped yet.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Whether the process is still running, based on its exit status.
    pub fn is_running(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::debug!(sandbox_id = %self.sandbox_id, %status, "fallback server exited");
                false
            }
            Err(e) => {
                tracing::warn!(sandbox_id = %self.sandbox_id, error = %e, "failed to query fallback server status");
                false
            }
        }
    }

    /// Stops the server: SIGTERM, up to `timeout` for it to exit, then SIGKILL. Log handles are
    /// closed afterwards.
    pub async fn terminate(&mut self, timeout: Duration) {
        if self.is_running() {
            if let Some(pid) = self.child.id() {
                if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    tracing::warn!(sandbox_id = %self.sandbox_id, pid, error = %e, "failed to send SIGTERM");
                }
            }

            match time::timeout(timeout, self.child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::info!(sandbox_id = %self.sandbox_id, %status, "fallback server stopped");
                }
                Ok(Err(e)) => {
                    tracing::warn!(sandbox_id = %self.sandbox_id, error = %e, "failed to wait for fallback server");
                }
                Err(_) => {
                    tracing::warn!(sandbox_id = %self.sandbox_id, "fallback server ignored SIGTERM, killing");
                    if let Err(e) = self.child.kill().await {
                        tracing::error!(sandbox_id = %self.sandbox_id, error = %e, "failed to kill fallback server");
                    }
                }
            }
        }

        self.close_handles();
    }

    /// Flushes and closes the log handles. Safe to call more than once.
    pub fn close_handles(&mut self) {
        let mut handles = [self.stdout_log.take(), self.stderr_log.take()];
        close_all(&mut handles);
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn open_append(path: &Path) -> SandcoreResult<File> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;

    Ok(file.into_std().await)
}

fn close_all(handles: &mut [Option<File>]) {
    for handle in handles.iter_mut() {
        if let Some(file) = handle.take() {
            if let Err(e) = file.sync_all() {
                tracing::debug!(error = %e, "failed to sync fallback log");
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
