//! The registry of live sandboxes and the execution path.

use std::{
    collections::HashMap,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::{Duration, Instant},
};

use sandutils::validate_id;
use serde::Serialize;
use serde_json::json;
use tokio::{fs, io::AsyncReadExt, process::Command, sync::Mutex, time};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::{
    fallback::ContainerPromoter,
    utils::PYTHON_UNBUFFERED_ENV_VAR,
    SandcoreError, SandcoreResult,
};

use super::{
    BackgroundJob, EventRecorder, QuotaManager, SandboxInstance, SandboxSummary, VirtualFs,
    EVENT_BACKGROUND_CREATED, EVENT_BACKGROUND_STOPPED, EVENT_EXEC_DENIED, EVENT_EXEC_FALLBACK,
    EVENT_EXEC_SUCCESS, EVENT_EXEC_TIMEOUT, EVENT_KEEPALIVE, EVENT_MOUNT, EVENT_PREVIEW_REGISTER,
    EVENT_SANDBOX_CREATED, EVENT_SANDBOX_DELETED,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Commands that run directly in the lightweight runtime. Everything else is delegated.
pub const ALLOWED_COMMANDS: &[&str] = &["python", "node"];

/// Standard error reported for an execution that hit its timeout.
pub const TIMEOUT_MARKER: &str = "Execution timed out";

/// Message returned alongside a delegated execution.
pub const DELEGATED_MESSAGE: &str = "Command delegated to fallback container";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A command to run in a sandbox.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ExecRequest {
    /// The command name, e.g. `python`.
    #[builder(setter(into))]
    pub command: String,

    /// Arguments, placed after the script when `code` is given.
    #[builder(default)]
    pub args: Vec<String>,

    /// Source code written to a script file and run by the command.
    #[builder(default, setter(strip_option, into))]
    pub code: Option<String>,

    /// Upper bound on the run time. Defaults to the manager's timeout.
    #[builder(default, setter(strip_option))]
    pub timeout: Option<Duration>,

    /// Forces delegation to the fallback container.
    #[builder(default)]
    pub requires_native: bool,
}

/// The result of [`SandboxManager::exec_command`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ExecOutcome {
    /// The command ran locally, to completion or until it was killed by the timeout.
    Completed {
        /// Captured standard output.
        stdout: String,

        /// Captured standard error, or [`TIMEOUT_MARKER`].
        stderr: String,

        /// Exit code, or the negated signal number if the process was killed.
        exit_code: i32,

        /// Whether the timeout fired.
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        timed_out: bool,
    },

    /// The sandbox has used up its execution quota.
    QuotaExceeded {
        /// Always `quota_exceeded`.
        error: &'static str,
    },

    /// The command was handed to the fallback container.
    Delegated {
        /// Base URL of the fallback container.
        fallback_url: String,

        /// Human readable note.
        message: String,
    },
}

/// Owns every live [`SandboxInstance`] and runs commands in them.
pub struct SandboxManager {
    sandbox_root: PathBuf,
    default_timeout: Duration,
    sandboxes: Mutex<HashMap<String, SandboxInstance>>,
    promoter: Arc<dyn ContainerPromoter>,
    quota: Arc<QuotaManager>,
    recorder: Arc<EventRecorder>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl ExecOutcome {
    /// The quota-exceeded outcome.
    pub fn quota_exceeded() -> Self {
        Self::QuotaExceeded {
            error: "quota_exceeded",
        }
    }
}

impl SandboxManager {
    /// Creates a manager placing workspaces under `sandbox_root`.
    pub fn new(
        sandbox_root: impl Into<PathBuf>,
        default_timeout: Duration,
        promoter: Arc<dyn ContainerPromoter>,
        quota: Arc<QuotaManager>,
        recorder: Arc<EventRecorder>,
    ) -> Self {
        Self {
            sandbox_root: sandbox_root.into(),
            default_timeout,
            sandboxes: Mutex::new(HashMap::new()),
            promoter,
            quota,
            recorder,
        }
    }

    /// The directory holding every workspace.
    pub fn sandbox_root(&self) -> &Path {
        &self.sandbox_root
    }

    /// The quota manager consulted before executions.
    pub fn quota(&self) -> &Arc<QuotaManager> {
        &self.quota
    }

    /// The audit log.
    pub fn recorder(&self) -> &Arc<EventRecorder> {
        &self.recorder
    }

    /// Creates a sandbox with the given id, or a generated one.
    pub async fn create_sandbox(&self, sandbox_id: Option<String>) -> SandcoreResult<SandboxSummary> {
        let sandbox_id = sandbox_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        validate_id(&sandbox_id, "sandbox id")
            .map_err(|e| SandcoreError::InvalidSandboxId(e.to_string()))?;

        let summary = {
            let mut sandboxes = self.sandboxes.lock().await;
            if sandboxes.contains_key(&sandbox_id) {
                return Err(SandcoreError::SandboxAlreadyExists(sandbox_id));
            }

            if !self.quota.try_record_sandbox_created(&sandbox_id) {
                return Err(SandcoreError::SandboxLimitReached(
                    *self.quota.quota().get_max_concurrent_sandboxes(),
                ));
            }

            let workspace = self.sandbox_root.join(&sandbox_id);
            let vfs = match tokio::task::spawn_blocking(move || VirtualFs::new(workspace)).await {
                Ok(Ok(vfs)) => vfs,
                Ok(Err(e)) => {
                    self.quota.record_sandbox_destroyed(&sandbox_id);
                    return Err(e);
                }
                Err(e) => {
                    self.quota.record_sandbox_destroyed(&sandbox_id);
                    return Err(e.into());
                }
            };

            let instance = SandboxInstance::new(sandbox_id.clone(), vfs);
            let summary = instance.summary(Instant::now());
            sandboxes.insert(sandbox_id.clone(), instance);
            summary
        };

        tracing::info!(sandbox_id, workspace = %summary.workspace.display(), "created sandbox");
        self.recorder
            .record(
                EVENT_SANDBOX_CREATED,
                &sandbox_id,
                json!({ "workspace": summary.workspace }),
            )
            .await;

        Ok(summary)
    }

    /// Whether a sandbox exists.
    pub async fn contains(&self, sandbox_id: &str) -> bool {
        self.sandboxes.lock().await.contains_key(sandbox_id)
    }

    /// The summary of one sandbox.
    pub async fn get_sandbox(&self, sandbox_id: &str) -> SandcoreResult<SandboxSummary> {
        self.with_sandbox(sandbox_id, |instance| instance.summary(Instant::now()))
            .await
    }

    /// The summaries of every sandbox, sorted by id.
    pub async fn list_sandboxes(&self) -> Vec<SandboxSummary> {
        let now = Instant::now();
        let mut summaries: Vec<SandboxSummary> = self
            .sandboxes
            .lock()
            .await
            .values()
            .map(|instance| instance.summary(now))
            .collect();

        summaries.sort_by(|a, b| a.sandbox_id.cmp(&b.sandbox_id));
        summaries
    }

    /// Removes a sandbox from the registry and returns it.
    ///
    /// Any background job still linked to it is aborted. The workspace stays on disk.
    pub async fn delete_sandbox(&self, sandbox_id: &str) -> SandcoreResult<SandboxInstance> {
        let instance = self
            .sandboxes
            .lock()
            .await
            .remove(sandbox_id)
            .ok_or_else(|| SandcoreError::SandboxNotFound(sandbox_id.to_string()))?;

        for job in instance.background_jobs().values() {
            job.abort();
        }

        self.quota.record_sandbox_destroyed(sandbox_id);
        tracing::info!(sandbox_id, "deleted sandbox");
        self.recorder
            .record(EVENT_SANDBOX_DELETED, sandbox_id, json!({}))
            .await;

        Ok(instance)
    }

    /// Runs a command in a sandbox.
    ///
    /// Quota exhaustion and timeouts are reported in the returned [`ExecOutcome`], not as errors.
    /// Commands outside [`ALLOWED_COMMANDS`], and any request with `requires_native`, are never
    /// run locally; the sandbox is promoted to its fallback container instead.
    pub async fn exec_command(
        &self,
        sandbox_id: &str,
        request: ExecRequest,
    ) -> SandcoreResult<ExecOutcome> {
        let workspace = self
            .with_sandbox(sandbox_id, |instance| {
                instance.touch();
                instance.workspace().to_path_buf()
            })
            .await?;

        if !self.quota.allow_and_record(sandbox_id) {
            self.recorder
                .record(EVENT_EXEC_DENIED, sandbox_id, json!({ "reason": "quota" }))
                .await;
            return Ok(ExecOutcome::quota_exceeded());
        }

        if request.requires_native || !ALLOWED_COMMANDS.contains(&request.command.as_str()) {
            let fallback_url = self.promoter.promote_to_container(sandbox_id).await?;
            tracing::info!(sandbox_id, command = %request.command, %fallback_url, "delegated execution");
            self.recorder
                .record(
                    EVENT_EXEC_FALLBACK,
                    sandbox_id,
                    json!({ "command": request.command, "requires_native": request.requires_native }),
                )
                .await;

            return Ok(ExecOutcome::Delegated {
                fallback_url,
                message: DELEGATED_MESSAGE.to_string(),
            });
        }

        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let (argv, outcome) = run_local(&workspace, &request, timeout).await?;

        match &outcome {
            ExecOutcome::Completed {
                timed_out: true,
                exit_code,
                ..
            } => {
                tracing::warn!(sandbox_id, ?argv, timeout_secs = timeout.as_secs_f64(), "execution timed out");
                self.recorder
                    .record(
                        EVENT_EXEC_TIMEOUT,
                        sandbox_id,
                        json!({ "cmd": argv, "exit_code": exit_code }),
                    )
                    .await;
            }
            ExecOutcome::Completed { exit_code, .. } => {
                tracing::debug!(sandbox_id, ?argv, exit_code, "execution finished");
                self.recorder
                    .record(
                        EVENT_EXEC_SUCCESS,
                        sandbox_id,
                        json!({ "cmd": argv, "exit_code": exit_code }),
                    )
                    .await;
            }
            _ => {}
        }

        Ok(outcome)
    }

    /// Records a keepalive for a sandbox.
    pub async fn keep_alive(&self, sandbox_id: &str) -> SandcoreResult<()> {
        self.with_sandbox(sandbox_id, SandboxInstance::keep_alive)
            .await?;
        self.recorder
            .record(EVENT_KEEPALIVE, sandbox_id, json!({}))
            .await;
        Ok(())
    }

    /// Mounts the host directory `target` into the sandbox under `alias`.
    ///
    /// Only containment inside the sandbox file store is enforced here; restricting which host
    /// directories may be mounted is up to the caller.
    pub async fn mount(&self, sandbox_id: &str, alias: &str, target: &Path) -> SandcoreResult<PathBuf> {
        let requested = target.to_path_buf();
        let canonical = tokio::task::spawn_blocking(move || std::fs::canonicalize(&requested))
            .await?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    SandcoreError::MountTargetNotFound(target.display().to_string())
                }
                _ => e.into(),
            })?;

        let mounted = self
            .with_sandbox(sandbox_id, |instance| instance.mount(alias, &canonical))
            .await??;

        self.recorder
            .record(
                EVENT_MOUNT,
                sandbox_id,
                json!({ "alias": alias, "target": mounted }),
            )
            .await;

        Ok(mounted)
    }

    /// Records a preview port of a sandbox.
    pub async fn register_preview(&self, sandbox_id: &str, port: u16, url: &str) -> SandcoreResult<()> {
        self.with_sandbox(sandbox_id, |instance| instance.register_preview(port, url))
            .await?;
        self.recorder
            .record(
                EVENT_PREVIEW_REGISTER,
                sandbox_id,
                json!({ "port": port, "url": url }),
            )
            .await;
        Ok(())
    }

    /// Forgets a preview port of a sandbox, returning its URL.
    pub async fn unregister_preview(&self, sandbox_id: &str, port: u16) -> SandcoreResult<Option<String>> {
        self.with_sandbox(sandbox_id, |instance| instance.unregister_preview(port))
            .await
    }

    /// Links a background job to its sandbox.
    pub async fn ensure_background(&self, sandbox_id: &str, job: BackgroundJob) -> SandcoreResult<()> {
        let job_id = job.job_id().to_string();
        self.with_sandbox(sandbox_id, |instance| instance.attach_job(job))
            .await?;
        self.recorder
            .record(
                EVENT_BACKGROUND_CREATED,
                sandbox_id,
                json!({ "job_id": job_id }),
            )
            .await;
        Ok(())
    }

    /// Unlinks a background job from its sandbox, returning it if it was linked.
    pub async fn remove_background(
        &self,
        sandbox_id: &str,
        job_id: &str,
    ) -> SandcoreResult<Option<BackgroundJob>> {
        let job = self
            .with_sandbox(sandbox_id, |instance| instance.detach_job(job_id))
            .await?;

        if job.is_some() {
            self.recorder
                .record(
                    EVENT_BACKGROUND_STOPPED,
                    sandbox_id,
                    json!({ "job_id": job_id }),
                )
                .await;
        }

        Ok(job)
    }

    /// Writes a file into a sandbox.
    pub async fn write_file(&self, sandbox_id: &str, path: &str, data: Vec<u8>) -> SandcoreResult<()> {
        let vfs = self.touched_fs(sandbox_id).await?;
        let path = path.to_string();
        tokio::task::spawn_blocking(move || vfs.write(&path, &data)).await?
    }

    /// Reads a file from a sandbox.
    pub async fn read_file(&self, sandbox_id: &str, path: &str) -> SandcoreResult<Vec<u8>> {
        let vfs = self.touched_fs(sandbox_id).await?;
        let path = path.to_string();
        tokio::task::spawn_blocking(move || vfs.read(&path)).await?
    }

    /// Lists a directory of a sandbox.
    pub async fn list_files(&self, sandbox_id: &str, path: &str) -> SandcoreResult<Vec<String>> {
        let vfs = self.touched_fs(sandbox_id).await?;
        let path = path.to_string();
        tokio::task::spawn_blocking(move || vfs.list_dir(&path)).await?
    }

    /// The sandboxes that have been idle for at least `ttl`.
    pub async fn idle_sandboxes(&self, ttl: Duration) -> Vec<String> {
        self.idle_sandboxes_at(ttl, Instant::now()).await
    }

    /// [`SandboxManager::idle_sandboxes`] at an explicit point in time.
    pub async fn idle_sandboxes_at(&self, ttl: Duration, now: Instant) -> Vec<String> {
        let mut idle: Vec<String> = self
            .sandboxes
            .lock()
            .await
            .values()
            .filter(|instance| instance.idle_for(now) >= ttl)
            .map(|instance| instance.sandbox_id().to_string())
            .collect();

        idle.sort();
        idle
    }

    async fn touched_fs(&self, sandbox_id: &str) -> SandcoreResult<VirtualFs> {
        self.with_sandbox(sandbox_id, |instance| {
            instance.touch();
            instance.fs().clone()
        })
        .await
    }

    async fn with_sandbox<T>(
        &self,
        sandbox_id: &str,
        f: impl FnOnce(&mut SandboxInstance) -> T,
    ) -> SandcoreResult<T> {
        let mut sandboxes = self.sandboxes.lock().await;
        let instance = sandboxes
            .get_mut(sandbox_id)
            .ok_or_else(|| SandcoreError::SandboxNotFound(sandbox_id.to_string()))?;

        Ok(f(instance))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// The script file name used for `command`.
pub fn script_name(command: &str) -> String {
    match command {
        "python" => "sandbox_exec.py".to_string(),
        "node" => "sandbox_exec.js".to_string(),
        other => format!("sandbox_exec.{other}"),
    }
}

/// Finds the interpreter binary for an allowed command.
pub fn resolve_interpreter(command: &str) -> SandcoreResult<PathBuf> {
    let candidates: &[&str] = match command {
        "python" => &["python", "python3"],
        "node" => &["node", "nodejs"],
        other => return Err(SandcoreError::CommandNotFound(other.to_string())),
    };

    candidates
        .iter()
        .find_map(|name| which::which(name).ok())
        .ok_or_else(|| SandcoreError::CommandNotFound(command.to_string()))
}

async fn run_local(
    workspace: &Path,
    request: &ExecRequest,
    timeout: Duration,
) -> SandcoreResult<(Vec<String>, ExecOutcome)> {
    let program = resolve_interpreter(&request.command)?;

    let mut args = Vec::with_capacity(request.args.len() + 1);
    if let Some(code) = &request.code {
        let script = workspace.join(script_name(&request.command));
        fs::write(&script, code).await?;
        args.push(script.display().to_string());
    }
    args.extend(request.args.iter().cloned());

    let argv: Vec<String> = std::iter::once(request.command.clone())
        .chain(args.iter().cloned())
        .collect();

    let mut child = Command::new(&program)
        .args(&args)
        .current_dir(workspace)
        .env(PYTHON_UNBUFFERED_ENV_VAR, "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| SandcoreError::custom(anyhow::anyhow!("child stdout was not captured")))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| SandcoreError::custom(anyhow::anyhow!("child stderr was not captured")))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await.map(|_| buf)
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr.read_to_end(&mut buf).await.map(|_| buf)
    });

    let collect = async {
        let status = child.wait().await?;
        let stdout = stdout_task.await??;
        let stderr = stderr_task.await??;
        Ok::<_, SandcoreError>((status, stdout, stderr))
    };
    let result = time::timeout(timeout, collect).await;

    let outcome = match result {
        Ok(collected) => {
            let (status, stdout, stderr) = collected?;
            ExecOutcome::Completed {
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
                exit_code: exit_code(status),
                timed_out: false,
            }
        }
        Err(_) => {
            if let Err(e) = child.start_kill() {
                tracing::warn!(error = %e, "failed to kill timed out process");
            }
            let status = child.wait().await?;
            ExecOutcome::Completed {
                stdout: String::new(),
                stderr: TIMEOUT_MARKER.to_string(),
                exit_code: exit_code(status),
                timed_out: true,
            }
        }
    };

    Ok((argv, outcome))
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(-1)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
