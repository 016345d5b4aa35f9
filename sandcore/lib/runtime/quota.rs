//! Per-sandbox execution rate limiting and resource accounting.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use serde::Serialize;

use crate::config::ResourceQuota;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The sliding window executions are counted in.
pub const EXECUTION_WINDOW: Duration = Duration::from_secs(3600);

/// Fraction of a limit at which a warning is logged.
pub const WARNING_THRESHOLD: f64 = 0.8;

const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Tracks executions and resource usage against a static [`ResourceQuota`].
///
/// Execution admission goes through [`QuotaManager::allow_and_record`] only, which checks and
/// records in one critical section. The other counters are plain threshold comparisons, each
/// behind its own lock.
#[derive(Debug)]
pub struct QuotaManager {
    quota: ResourceQuota,
    executions: Mutex<HashMap<String, VecDeque<Instant>>>,
    active: Mutex<HashSet<String>>,
    usage: Mutex<HashMap<String, ResourceUsage>>,
}

/// Resource usage reported for a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    /// Last reported memory usage in MiB.
    pub memory_mb: u64,

    /// Last reported workspace size in bytes.
    pub storage_bytes: u64,

    /// Accumulated CPU time in seconds.
    pub cpu_seconds: f64,

    /// Accumulated network egress in bytes.
    pub network_egress_bytes: u64,
}

/// A limit a sandbox is over.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "resource", rename_all = "snake_case")]
pub enum QuotaViolation {
    /// Memory above `max_memory_mb`.
    Memory {
        /// Reported usage.
        used_mb: u64,
        /// Configured limit.
        limit_mb: u64,
    },

    /// Storage above `max_storage_gb`.
    Storage {
        /// Reported usage.
        used_bytes: u64,
        /// Configured limit.
        limit_bytes: u64,
    },

    /// CPU time above `max_cpu_seconds`.
    Cpu {
        /// Accumulated usage.
        used_seconds: f64,
        /// Configured limit.
        limit_seconds: u64,
    },

    /// Egress above `max_network_egress_gb`.
    NetworkEgress {
        /// Accumulated usage.
        used_bytes: u64,
        /// Configured limit.
        limit_bytes: u64,
    },
}

/// The usage report of one sandbox.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxUsage {
    /// The sandbox.
    pub sandbox_id: String,

    /// Executions inside the current window.
    pub executions_last_hour: usize,

    /// Configured executions per window.
    pub executions_limit: u32,

    /// Reported resource usage.
    #[serde(flatten)]
    pub resources: ResourceUsage,

    /// Limits currently exceeded.
    pub violations: Vec<QuotaViolation>,
}

/// The usage report across all sandboxes.
#[derive(Debug, Clone, Serialize)]
pub struct UsageTotals {
    /// Sandboxes currently counted against the concurrency cap.
    pub active_sandboxes: usize,

    /// The concurrency cap.
    pub max_concurrent_sandboxes: usize,

    /// Executions inside the current window, across sandboxes.
    pub total_executions_last_hour: usize,

    /// Per-sandbox reports, sorted by id.
    pub sandboxes: Vec<SandboxUsage>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl QuotaManager {
    /// Creates a manager enforcing `quota`.
    pub fn new(quota: ResourceQuota) -> Self {
        Self {
            quota,
            executions: Mutex::new(HashMap::new()),
            active: Mutex::new(HashSet::new()),
            usage: Mutex::new(HashMap::new()),
        }
    }

    /// The enforced limits.
    pub fn quota(&self) -> &ResourceQuota {
        &self.quota
    }

    /// Admits and records one execution for `sandbox_id` if the sliding window has room.
    pub fn allow_and_record(&self, sandbox_id: &str) -> bool {
        self.allow_and_record_at(sandbox_id, Instant::now())
    }

    /// [`QuotaManager::allow_and_record`] at an explicit point in time.
    pub fn allow_and_record_at(&self, sandbox_id: &str, now: Instant) -> bool {
        let limit = *self.quota.get_executions_per_hour() as usize;
        let mut executions = lock(&self.executions);
        let timestamps = executions.entry(sandbox_id.to_string()).or_default();

        purge_expired(timestamps, now);

        if timestamps.len() >= limit {
            tracing::warn!(sandbox_id, limit, "execution quota exceeded");
            return false;
        }

        // Keep the sequence non-decreasing even if callers pass an older instant.
        let now = timestamps.back().map_or(now, |last| now.max(*last));
        timestamps.push_back(now);

        if timestamps.len() as f64 >= limit as f64 * WARNING_THRESHOLD {
            tracing::warn!(
                sandbox_id,
                used = timestamps.len(),
                limit,
                "sandbox is close to its execution quota"
            );
        }

        true
    }

    /// Counts a new sandbox against the concurrency cap. Returns `false` without counting it when
    /// the cap is reached.
    pub fn try_record_sandbox_created(&self, sandbox_id: &str) -> bool {
        let max = *self.quota.get_max_concurrent_sandboxes();
        let mut active = lock(&self.active);

        if active.contains(sandbox_id) {
            return true;
        }

        if active.len() >= max {
            tracing::warn!(sandbox_id, max, "concurrent sandbox limit reached");
            return false;
        }

        active.insert(sandbox_id.to_string());
        if active.len() as f64 >= max as f64 * WARNING_THRESHOLD {
            tracing::warn!(active = active.len(), max, "approaching concurrent sandbox limit");
        }

        true
    }

    /// Whether another sandbox could be created right now.
    pub fn check_sandbox_limit(&self) -> bool {
        lock(&self.active).len() < *self.quota.get_max_concurrent_sandboxes()
    }

    /// Forgets everything recorded for a sandbox.
    pub fn record_sandbox_destroyed(&self, sandbox_id: &str) {
        lock(&self.active).remove(sandbox_id);
        lock(&self.executions).remove(sandbox_id);
        lock(&self.usage).remove(sandbox_id);
    }

    /// Records the current memory usage of a sandbox.
    pub fn record_memory_usage(&self, sandbox_id: &str, memory_mb: u64) {
        self.update_usage(sandbox_id, |usage| usage.memory_mb = memory_mb);
    }

    /// Records the current workspace size of a sandbox.
    pub fn record_storage_usage(&self, sandbox_id: &str, storage_bytes: u64) {
        self.update_usage(sandbox_id, |usage| usage.storage_bytes = storage_bytes);
    }

    /// Adds CPU time to a sandbox.
    pub fn record_cpu_seconds(&self, sandbox_id: &str, seconds: f64) {
        self.update_usage(sandbox_id, |usage| usage.cpu_seconds += seconds);
    }

    /// Adds network egress to a sandbox.
    pub fn record_network_egress(&self, sandbox_id: &str, bytes: u64) {
        self.update_usage(sandbox_id, |usage| {
            usage.network_egress_bytes = usage.network_egress_bytes.saturating_add(bytes)
        });
    }

    /// The limits `sandbox_id` is currently over.
    pub fn check_resource_limits(&self, sandbox_id: &str) -> Vec<QuotaViolation> {
        let usage = lock(&self.usage).get(sandbox_id).cloned().unwrap_or_default();
        self.violations(&usage)
    }

    /// The usage report of one sandbox.
    pub fn get_usage(&self, sandbox_id: &str) -> SandboxUsage {
        self.get_usage_at(sandbox_id, Instant::now())
    }

    /// [`QuotaManager::get_usage`] at an explicit point in time.
    pub fn get_usage_at(&self, sandbox_id: &str, now: Instant) -> SandboxUsage {
        let executions_last_hour = {
            let mut executions = lock(&self.executions);
            executions
                .get_mut(sandbox_id)
                .map(|timestamps| {
                    purge_expired(timestamps, now);
                    timestamps.len()
                })
                .unwrap_or(0)
        };

        let resources = lock(&self.usage).get(sandbox_id).cloned().unwrap_or_default();
        let violations = self.violations(&resources);

        SandboxUsage {
            sandbox_id: sandbox_id.to_string(),
            executions_last_hour,
            executions_limit: *self.quota.get_executions_per_hour(),
            resources,
            violations,
        }
    }

    /// The usage report across every sandbox known to the manager.
    pub fn get_all_usage(&self) -> UsageTotals {
        let now = Instant::now();
        let mut ids: HashSet<String> = lock(&self.active).iter().cloned().collect();
        ids.extend(lock(&self.executions).keys().cloned());
        ids.extend(lock(&self.usage).keys().cloned());

        let mut sandboxes: Vec<SandboxUsage> =
            ids.iter().map(|id| self.get_usage_at(id, now)).collect();
        sandboxes.sort_by(|a, b| a.sandbox_id.cmp(&b.sandbox_id));

        UsageTotals {
            active_sandboxes: lock(&self.active).len(),
            max_concurrent_sandboxes: *self.quota.get_max_concurrent_sandboxes(),
            total_executions_last_hour: sandboxes.iter().map(|s| s.executions_last_hour).sum(),
            sandboxes,
        }
    }

    fn update_usage(&self, sandbox_id: &str, update: impl FnOnce(&mut ResourceUsage)) {
        let mut usage = lock(&self.usage);
        update(usage.entry(sandbox_id.to_string()).or_default());
    }

    fn violations(&self, usage: &ResourceUsage) -> Vec<QuotaViolation> {
        let quota = &self.quota;
        let mut violations = Vec::new();

        if usage.memory_mb > *quota.get_max_memory_mb() {
            violations.push(QuotaViolation::Memory {
                used_mb: usage.memory_mb,
                limit_mb: *quota.get_max_memory_mb(),
            });
        }

        let storage_limit = quota.get_max_storage_gb().saturating_mul(BYTES_PER_GB);
        if usage.storage_bytes > storage_limit {
            violations.push(QuotaViolation::Storage {
                used_bytes: usage.storage_bytes,
                limit_bytes: storage_limit,
            });
        }

        if usage.cpu_seconds > *quota.get_max_cpu_seconds() as f64 {
            violations.push(QuotaViolation::Cpu {
                used_seconds: usage.cpu_seconds,
                limit_seconds: *quota.get_max_cpu_seconds(),
            });
        }

        let egress_limit = quota.get_max_network_egress_gb().saturating_mul(BYTES_PER_GB);
        if usage.network_egress_bytes > egress_limit {
            violations.push(QuotaViolation::NetworkEgress {
                used_bytes: usage.network_egress_bytes,
                limit_bytes: egress_limit,
            });
        }

        violations
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn purge_expired(timestamps: &mut VecDeque<Instant>, now: Instant) {
    while let Some(oldest) = timestamps.front() {
        if now.saturating_duration_since(*oldest) >= EXECUTION_WINDOW {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn manager(executions_per_hour: u32, max_sandboxes: usize) -> QuotaManager {
        QuotaManager::new(
            ResourceQuota::builder()
                .executions_per_hour(executions_per_hour)
                .max_concurrent_sandboxes(max_sandboxes)
                .build(),
        )
    }

    #[test]
    fn test_sliding_window() {
        let quota = manager(3, 10);
        let start = Instant::now();

        assert!(quota.allow_and_record_at("sb1", start));
        assert!(quota.allow_and_record_at("sb1", start + Duration::from_secs(10)));
        assert!(quota.allow_and_record_at("sb1", start + Duration::from_secs(20)));
        assert!(!quota.allow_and_record_at("sb1", start + Duration::from_secs(30)));

        // Other sandboxes have their own window.
        assert!(quota.allow_and_record_at("sb2", start + Duration::from_secs(30)));

        // Only the first execution has left the window.
        let later = start + EXECUTION_WINDOW;
        assert!(quota.allow_and_record_at("sb1", later));
        assert!(!quota.allow_and_record_at("sb1", later + Duration::from_secs(1)));

        let much_later = start + EXECUTION_WINDOW * 2;
        assert!(quota.allow_and_record_at("sb1", much_later));
        assert_eq!(quota.get_usage_at("sb1", much_later).executions_last_hour, 1);
    }

    #[test]
    fn test_denied_call_is_not_recorded() {
        let quota = manager(1, 10);
        let start = Instant::now();

        assert!(quota.allow_and_record_at("sb1", start));
        for i in 1..5 {
            assert!(!quota.allow_and_record_at("sb1", start + Duration::from_secs(i)));
        }
        assert_eq!(quota.get_usage_at("sb1", start).executions_last_hour, 1);
        assert!(quota.allow_and_record_at("sb1", start + EXECUTION_WINDOW));
    }

    #[test]
    fn test_concurrent_admission_never_exceeds_limit() {
        let quota = Arc::new(manager(25, 10));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let quota = quota.clone();
                std::thread::spawn(move || (0..10).filter(|_| quota.allow_and_record("sb1")).count())
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 25);
    }

    #[test]
    fn test_sandbox_cap() {
        let quota = manager(10, 2);
        assert!(quota.check_sandbox_limit());
        assert!(quota.try_record_sandbox_created("a"));
        assert!(quota.try_record_sandbox_created("a"));
        assert!(quota.try_record_sandbox_created("b"));
        assert!(!quota.check_sandbox_limit());
        assert!(!quota.try_record_sandbox_created("c"));

        quota.record_sandbox_destroyed("a");
        assert!(quota.try_record_sandbox_created("c"));
        assert_eq!(quota.get_all_usage().active_sandboxes, 2);
    }

    #[test]
    fn test_resource_limits() {
        let quota = QuotaManager::new(
            ResourceQuota::builder()
                .max_memory_mb(100)
                .max_cpu_seconds(10)
                .max_storage_gb(1)
                .build(),
        );

        quota.record_memory_usage("sb1", 50);
        quota.record_cpu_seconds("sb1", 6.0);
        assert!(quota.check_resource_limits("sb1").is_empty());

        quota.record_memory_usage("sb1", 150);
        quota.record_cpu_seconds("sb1", 6.0);
        quota.record_storage_usage("sb1", 2 * BYTES_PER_GB);
        let violations = quota.check_resource_limits("sb1");
        assert_eq!(violations.len(), 3);
        assert!(violations.contains(&QuotaViolation::Memory {
            used_mb: 150,
            limit_mb: 100
        }));

        quota.record_network_egress("sb2", 10);
        let totals = quota.get_all_usage();
        assert_eq!(totals.sandboxes.len(), 2);
        assert_eq!(totals.sandboxes[1].resources.network_egress_bytes, 10);

        quota.record_sandbox_destroyed("sb1");
        assert!(quota.check_resource_limits("sb1").is_empty());
    }

    #[test]
    fn test_usage_serializes_flat() {
        let quota = manager(5, 5);
        quota.allow_and_record("sb1");
        let json = serde_json::to_value(quota.get_usage("sb1")).unwrap();
        assert_eq!(json["executions_last_hour"], 1);
        assert_eq!(json["memory_mb"], 0);
        assert!(json["violations"].as_array().unwrap().is_empty());
    }
}
