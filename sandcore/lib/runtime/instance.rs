//! A single live sandbox.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::SandcoreResult;

use super::{BackgroundJob, VirtualFs};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The state of one sandbox.
///
/// Timestamps and the preview and job maps only change through the methods below.
#[derive(Debug)]
pub struct SandboxInstance {
    sandbox_id: String,
    workspace: PathBuf,
    fs: VirtualFs,
    created_on: DateTime<Utc>,
    created_at: Instant,
    last_active: Instant,
    keep_alive_at: Instant,
    preview_ports: BTreeMap<u16, String>,
    background_jobs: HashMap<String, BackgroundJob>,
}

/// A serializable view of a [`SandboxInstance`].
#[derive(Debug, Clone, Serialize)]
pub struct SandboxSummary {
    /// The sandbox id.
    pub sandbox_id: String,

    /// The workspace directory.
    pub workspace: PathBuf,

    /// Wall-clock creation time.
    pub created_at: DateTime<Utc>,

    /// Seconds since the last touch or keepalive, whichever is later.
    pub idle_secs: u64,

    /// Registered preview ports and their URLs.
    pub preview_ports: BTreeMap<u16, String>,

    /// Ids of running background jobs, sorted.
    pub background_jobs: Vec<String>,

    /// Mount aliases and their host targets.
    pub mounts: BTreeMap<String, PathBuf>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxInstance {
    /// Creates an instance owning `fs`, whose root is the workspace.
    pub fn new(sandbox_id: impl Into<String>, fs: VirtualFs) -> Self {
        let now = Instant::now();
        Self {
            sandbox_id: sandbox_id.into(),
            workspace: fs.root().to_path_buf(),
            fs,
            created_on: Utc::now(),
            created_at: now,
            last_active: now,
            keep_alive_at: now,
            preview_ports: BTreeMap::new(),
            background_jobs: HashMap::new(),
        }
    }

    /// The sandbox id.
    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    /// The workspace directory.
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// The sandbox file store.
    pub fn fs(&self) -> &VirtualFs {
        &self.fs
    }

    /// When the instance was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the instance was last used.
    pub fn last_active(&self) -> Instant {
        self.last_active
    }

    /// When the instance last received a keepalive.
    pub fn keep_alive_at(&self) -> Instant {
        self.keep_alive_at
    }

    /// Registered preview ports.
    pub fn preview_ports(&self) -> &BTreeMap<u16, String> {
        &self.preview_ports
    }

    /// Running background jobs.
    pub fn background_jobs(&self) -> &HashMap<String, BackgroundJob> {
        &self.background_jobs
    }

    /// Marks the instance as used now.
    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    /// Records a keepalive now.
    pub fn keep_alive(&mut self) {
        let now = Instant::now();
        self.keep_alive_at = now;
        self.last_active = now;
    }

    /// How long the instance has gone without a touch or keepalive, as of `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_active.max(self.keep_alive_at))
    }

    /// Mounts a host directory into the file store.
    pub fn mount(&mut self, alias: &str, target: &Path) -> SandcoreResult<PathBuf> {
        let target = self.fs.mount(alias, target)?;
        self.touch();
        Ok(target)
    }

    /// Records a preview port and its URL, replacing any earlier one.
    pub fn register_preview(&mut self, port: u16, url: impl Into<String>) {
        self.preview_ports.insert(port, url.into());
        self.touch();
    }

    /// Forgets a preview port, returning its URL.
    pub fn unregister_preview(&mut self, port: u16) -> Option<String> {
        self.preview_ports.remove(&port)
    }

    /// Links a background job to the instance.
    pub fn attach_job(&mut self, job: BackgroundJob) {
        self.background_jobs.insert(job.job_id().to_string(), job);
    }

    /// Unlinks a background job.
    pub fn detach_job(&mut self, job_id: &str) -> Option<BackgroundJob> {
        self.background_jobs.remove(job_id)
    }

    /// A serializable view of the instance as of `now`.
    pub fn summary(&self, now: Instant) -> SandboxSummary {
        let mut background_jobs: Vec<String> = self.background_jobs.keys().cloned().collect();
        background_jobs.sort();

        SandboxSummary {
            sandbox_id: self.sandbox_id.clone(),
            workspace: self.workspace.clone(),
            created_at: self.created_on,
            idle_secs: self.idle_for(now).as_secs(),
            preview_ports: self.preview_ports.clone(),
            background_jobs,
            mounts: self.fs.mounts().clone(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
