//! The durable audit log of sandbox lifecycle events.
//!
//! Events are written as newline-delimited JSON objects `{timestamp, event, sandbox_id,
//! metadata}`. The file is only ever appended to, under an exclusive file lock so several
//! processes can share it. Recording is fire-and-forget: failures are logged and never reach the
//! operation that produced the event.

use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{SecondsFormat, Utc};
use file_lock::{FileLock, FileOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::SandcoreResult;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// A sandbox was created.
pub const EVENT_SANDBOX_CREATED: &str = "sandbox.created";

/// A sandbox was deleted.
pub const EVENT_SANDBOX_DELETED: &str = "sandbox.deleted";

/// An execution was refused.
pub const EVENT_EXEC_DENIED: &str = "sandbox.exec.denied";

/// An execution was delegated to the fallback container.
pub const EVENT_EXEC_FALLBACK: &str = "sandbox.exec.fallback";

/// An execution finished.
pub const EVENT_EXEC_SUCCESS: &str = "sandbox.exec.success";

/// An execution was killed after exceeding its timeout.
pub const EVENT_EXEC_TIMEOUT: &str = "sandbox.exec.timeout";

/// A sandbox was kept alive.
pub const EVENT_KEEPALIVE: &str = "sandbox.keepalive";

/// A host directory was mounted.
pub const EVENT_MOUNT: &str = "sandbox.mount";

/// A preview port was registered.
pub const EVENT_PREVIEW_REGISTER: &str = "sandbox.preview.register";

/// A background job was started.
pub const EVENT_BACKGROUND_CREATED: &str = "sandbox.background.created";

/// A background job was stopped.
pub const EVENT_BACKGROUND_STOPPED: &str = "sandbox.background.stopped";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One line of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// RFC 3339 UTC timestamp.
    pub timestamp: String,

    /// Dotted event name.
    pub event: String,

    /// The sandbox the event is about.
    pub sandbox_id: String,

    /// Event specific details.
    pub metadata: Value,
}

/// Appends [`AuditEvent`]s to a file.
#[derive(Debug, Clone)]
pub struct EventRecorder {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl EventRecorder {
    /// Creates a recorder appending to `path`, creating its parent directory.
    pub fn new(path: impl Into<PathBuf>) -> SandcoreResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        Ok(Self {
            path,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    /// The audit log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends an event and waits for the write to finish. Failures are logged, not returned.
    pub async fn record(&self, event: &str, sandbox_id: &str, metadata: Value) {
        let entry = AuditEvent {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            event: event.to_string(),
            sandbox_id: sandbox_id.to_string(),
            metadata,
        };

        let path = self.path.clone();
        let write_lock = self.write_lock.clone();
        let result = tokio::task::spawn_blocking(move || {
            let _guard = write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            append_line(&path, &entry)
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(event, sandbox_id, error = %e, "failed to record audit event")
            }
            Err(e) => {
                tracing::error!(event, sandbox_id, error = %e, "audit event writer panicked")
            }
        }
    }

    /// Reads every event back from the log. Lines that fail to parse are skipped.
    pub async fn read_all(&self) -> SandcoreResult<Vec<AuditEvent>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn append_line(path: &Path, entry: &AuditEvent) -> SandcoreResult<()> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');

    let options = FileOptions::new().write(true).create(true).append(true);
    let mut lock = FileLock::lock(path, true, options)?;
    lock.file.write_all(&line)?;
    lock.file.flush()?;
    lock.unlock()?;

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
