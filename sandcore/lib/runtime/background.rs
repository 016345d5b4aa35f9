//! Recurring commands that run on an interval until stopped.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::future;
use tokio::{
    sync::Mutex,
    task::{AbortHandle, JoinHandle},
    time,
};
use uuid::Uuid;

use crate::{SandcoreError, SandcoreResult};

use super::{ExecRequest, SandboxManager};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Shortest allowed pause between two runs of a job.
pub const MIN_JOB_INTERVAL: Duration = Duration::from_secs(1);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A handle to a running background job.
#[derive(Debug, Clone)]
pub struct BackgroundJob {
    job_id: String,
    command: String,
    args: Vec<String>,
    interval: Duration,
    abort: AbortHandle,
}

/// Starts and stops background jobs.
///
/// Each job is a task that runs its command through [`SandboxManager::exec_command`], so quota
/// checks and fallback delegation apply to every run, then sleeps for its interval. A job ends
/// when it is stopped or when its sandbox disappears.
pub struct BackgroundExecutor {
    manager: Arc<SandboxManager>,
    exec_timeout: Duration,
    jobs: Arc<Mutex<HashMap<String, RunningJob>>>,
}

struct RunningJob {
    sandbox_id: String,
    handle: JoinHandle<()>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl BackgroundJob {
    /// The job id.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// The command run on each tick.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The command arguments.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The pause between runs.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Aborts the job task without waiting for it.
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// Whether the job task has ended.
    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}

impl BackgroundExecutor {
    /// Creates an executor running each tick with `exec_timeout`.
    pub fn new(manager: Arc<SandboxManager>, exec_timeout: Duration) -> Self {
        Self {
            manager,
            exec_timeout,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts running `command` in a sandbox every `interval`.
    ///
    /// Intervals shorter than [`MIN_JOB_INTERVAL`] are raised to it.
    pub async fn start_job(
        &self,
        sandbox_id: &str,
        command: impl Into<String>,
        args: Vec<String>,
        interval: Duration,
    ) -> SandcoreResult<BackgroundJob> {
        if !self.manager.contains(sandbox_id).await {
            return Err(SandcoreError::SandboxNotFound(sandbox_id.to_string()));
        }

        let command = command.into();
        let interval = interval.max(MIN_JOB_INTERVAL);
        let job_id = Uuid::new_v4().simple().to_string();

        let job = {
            let mut jobs = self.jobs.lock().await;
            let handle = tokio::spawn(run_job(
                self.manager.clone(),
                self.jobs.clone(),
                sandbox_id.to_string(),
                job_id.clone(),
                ExecRequest::builder()
                    .command(command.clone())
                    .args(args.clone())
                    .timeout(self.exec_timeout)
                    .build(),
                interval,
            ));

            let job = BackgroundJob {
                job_id: job_id.clone(),
                command,
                args,
                interval,
                abort: handle.abort_handle(),
            };

            jobs.insert(
                job_id.clone(),
                RunningJob {
                    sandbox_id: sandbox_id.to_string(),
                    handle,
                },
            );
            job
        };

        if let Err(e) = self.manager.ensure_background(sandbox_id, job.clone()).await {
            self.stop_job(sandbox_id, &job_id).await?;
            return Err(e);
        }

        tracing::info!(sandbox_id, job_id, interval_secs = interval.as_secs_f64(), "started background job");
        Ok(job)
    }

    /// Stops a job and waits for its task to end. Returns whether the job was known.
    pub async fn stop_job(&self, sandbox_id: &str, job_id: &str) -> SandcoreResult<bool> {
        let running = {
            let mut jobs = self.jobs.lock().await;
            match jobs.get(job_id) {
                Some(job) if job.sandbox_id == sandbox_id => jobs.remove(job_id),
                _ => None,
            }
        };

        let was_running = running.is_some();
        if let Some(mut running) = running {
            finish(job_id, &mut running.handle).await;
        }

        let was_linked = match self.manager.remove_background(sandbox_id, job_id).await {
            Ok(job) => job.is_some(),
            Err(SandcoreError::SandboxNotFound(_)) => false,
            Err(e) => return Err(e),
        };

        if was_running || was_linked {
            tracing::info!(sandbox_id, job_id, "stopped background job");
        }

        Ok(was_running || was_linked)
    }

    /// Stops every job of a sandbox, returning how many were stopped.
    pub async fn stop_sandbox_jobs(&self, sandbox_id: &str) -> SandcoreResult<usize> {
        let job_ids: Vec<String> = self
            .jobs
            .lock()
            .await
            .iter()
            .filter(|(_, job)| job.sandbox_id == sandbox_id)
            .map(|(job_id, _)| job_id.clone())
            .collect();

        let mut stopped = 0;
        for job_id in job_ids {
            if self.stop_job(sandbox_id, &job_id).await? {
                stopped += 1;
            }
        }

        Ok(stopped)
    }

    /// The ids of the running jobs of a sandbox, sorted.
    pub async fn job_ids(&self, sandbox_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .jobs
            .lock()
            .await
            .iter()
            .filter(|(_, job)| job.sandbox_id == sandbox_id)
            .map(|(job_id, _)| job_id.clone())
            .collect();

        ids.sort();
        ids
    }

    /// Aborts every job and waits for them to end.
    pub async fn shutdown(&self) {
        let mut drained: Vec<(String, RunningJob)> = self.jobs.lock().await.drain().collect();
        future::join_all(
            drained
                .iter_mut()
                .map(|(job_id, running)| finish(job_id, &mut running.handle)),
        )
        .await;
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn run_job(
    manager: Arc<SandboxManager>,
    jobs: Arc<Mutex<HashMap<String, RunningJob>>>,
    sandbox_id: String,
    job_id: String,
    request: ExecRequest,
    interval: Duration,
) {
    loop {
        match manager.exec_command(&sandbox_id, request.clone()).await {
            Ok(outcome) => {
                tracing::debug!(sandbox_id, job_id, ?outcome, "background job tick");
            }
            Err(SandcoreError::SandboxNotFound(_)) => {
                tracing::info!(sandbox_id, job_id, "sandbox is gone, ending background job");
                jobs.lock().await.remove(&job_id);
                break;
            }
            Err(e) => {
                tracing::warn!(sandbox_id, job_id, error = %e, "background job tick failed");
            }
        }

        time::sleep(interval).await;
    }
}

async fn finish(job_id: &str, handle: &mut JoinHandle<()>) {
    handle.abort();
    match handle.await {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => {}
        Err(e) => tracing::error!(job_id, error = %e, "background job panicked"),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
