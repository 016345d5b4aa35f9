use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use serde::Serialize;

use super::HealthChecker;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Where a `(sandbox_id, port)` preview is served from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PreviewTarget {
    /// The sandbox.
    pub sandbox_id: String,

    /// The preview port inside the sandbox.
    pub port: u16,

    /// The primary upstream, without a trailing slash.
    pub backend_url: String,

    /// The fallback container URL, once one has been promoted.
    pub fallback_url: Option<String>,

    /// Whether traffic currently goes to `fallback_url`.
    pub use_fallback: bool,

    /// Free-form labels supplied at registration.
    pub metadata: BTreeMap<String, String>,

    /// When the upstream was last probed, or the target was last switched.
    #[serde(skip)]
    pub last_health_check: Instant,
}

/// The table of preview targets, keyed by `(sandbox_id, port)`.
pub struct PreviewRegistry {
    targets: Mutex<HashMap<(String, u16), PreviewTarget>>,
    health: HealthChecker,
    debounce: Duration,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PreviewTarget {
    /// The URL traffic should go to right now.
    pub fn effective_url(&self) -> &str {
        match (&self.fallback_url, self.use_fallback) {
            (Some(fallback), true) => fallback,
            _ => &self.backend_url,
        }
    }
}

impl PreviewRegistry {
    /// Creates an empty registry. Upstreams are probed at most once per `debounce`.
    pub fn new(health: HealthChecker, debounce: Duration) -> Self {
        Self {
            targets: Mutex::new(HashMap::new()),
            health,
            debounce,
        }
    }

    /// Stores a target, replacing any previous one for the same sandbox and port.
    pub fn register(
        &self,
        sandbox_id: &str,
        port: u16,
        backend_url: &str,
        metadata: BTreeMap<String, String>,
    ) -> PreviewTarget {
        let target = PreviewTarget {
            sandbox_id: sandbox_id.to_string(),
            port,
            backend_url: backend_url.trim_end_matches('/').to_string(),
            fallback_url: None,
            use_fallback: false,
            metadata,
            last_health_check: Instant::now(),
        };

        self.lock()
            .insert((sandbox_id.to_string(), port), target.clone());
        tracing::info!(sandbox_id, port, backend_url = %target.backend_url, "registered preview target");

        target
    }

    /// Looks up a target.
    pub fn resolve(&self, sandbox_id: &str, port: u16) -> Option<PreviewTarget> {
        self.lock().get(&(sandbox_id.to_string(), port)).cloned()
    }

    /// Switches a target to `fallback_url`. Returns false if the target is unknown.
    pub fn mark_fallback(&self, sandbox_id: &str, port: u16, fallback_url: &str) -> bool {
        let mut targets = self.lock();
        let Some(target) = targets.get_mut(&(sandbox_id.to_string(), port)) else {
            return false;
        };

        target.fallback_url = Some(fallback_url.trim_end_matches('/').to_string());
        target.use_fallback = true;
        target.last_health_check = Instant::now();
        tracing::info!(sandbox_id, port, fallback_url, "preview switched to fallback");

        true
    }

    /// Switches a target back to its primary upstream. Returns false if the target is unknown.
    pub fn reset_fallback(&self, sandbox_id: &str, port: u16) -> bool {
        let mut targets = self.lock();
        let Some(target) = targets.get_mut(&(sandbox_id.to_string(), port)) else {
            return false;
        };

        target.fallback_url = None;
        target.use_fallback = false;
        target.last_health_check = Instant::now();

        true
    }

    /// Removes one target.
    pub fn unregister(&self, sandbox_id: &str, port: u16) -> Option<PreviewTarget> {
        self.lock().remove(&(sandbox_id.to_string(), port))
    }

    /// Removes every target of a sandbox, returning how many there were.
    pub fn evict_sandbox(&self, sandbox_id: &str) -> usize {
        let mut targets = self.lock();
        let before = targets.len();
        targets.retain(|(id, _), _| id != sandbox_id);
        before - targets.len()
    }

    /// Every target keyed by `"sandbox_id:port"`.
    pub fn list_targets(&self) -> BTreeMap<String, PreviewTarget> {
        self.lock()
            .values()
            .map(|target| (format!("{}:{}", target.sandbox_id, target.port), target.clone()))
            .collect()
    }

    /// Whether the debounce window since the last probe has passed.
    pub fn health_check_needed(&self, target: &PreviewTarget) -> bool {
        self.health_check_needed_at(target, Instant::now())
    }

    /// [`PreviewRegistry::health_check_needed`] at an explicit point in time.
    pub fn health_check_needed_at(&self, target: &PreviewTarget, now: Instant) -> bool {
        now.saturating_duration_since(target.last_health_check) > self.debounce
    }

    /// Whether the primary upstream of `target` should be used.
    ///
    /// False straight away for a target on fallback. Otherwise the upstream is probed when the
    /// debounce window has passed, and assumed healthy when it has not.
    pub async fn ensure_primary_healthy(&self, target: &PreviewTarget) -> bool {
        if target.use_fallback {
            return false;
        }

        if !self.health_check_needed(target) {
            return true;
        }

        let healthy = self.health.is_healthy(target.effective_url()).await;
        if let Some(stored) = self
            .lock()
            .get_mut(&(target.sandbox_id.clone(), target.port))
        {
            stored.last_health_check = Instant::now();
        }

        healthy
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, u16), PreviewTarget>> {
        self.targets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use reqwest::Client;

    use super::*;

    fn registry() -> PreviewRegistry {
        PreviewRegistry::new(
            HealthChecker::new(Client::new(), Duration::from_millis(200)),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_register_normalizes_url() {
        let registry = registry();
        let target = registry.register("sb1", 3000, "http://10.0.0.2:3000///", BTreeMap::new());

        assert_eq!(target.backend_url, "http://10.0.0.2:3000");
        assert_eq!(target.effective_url(), "http://10.0.0.2:3000");
        assert_eq!(registry.resolve("sb1", 3000), Some(target));
        assert!(registry.resolve("sb1", 3001).is_none());
    }

    #[test]
    fn test_fallback_switching() {
        let registry = registry();
        registry.register("sb1", 3000, "http://primary", BTreeMap::new());

        assert!(registry.mark_fallback("sb1", 3000, "http://127.0.0.1:33000/"));
        let target = registry.resolve("sb1", 3000).unwrap();
        assert!(target.use_fallback);
        assert_eq!(target.effective_url(), "http://127.0.0.1:33000");

        assert!(registry.reset_fallback("sb1", 3000));
        let target = registry.resolve("sb1", 3000).unwrap();
        assert!(!target.use_fallback);
        assert_eq!(target.effective_url(), "http://primary");

        assert!(!registry.mark_fallback("missing", 1, "http://x"));
        assert!(!registry.reset_fallback("missing", 1));
    }

    #[test]
    fn test_reregister_clears_fallback() {
        let registry = registry();
        registry.register("sb1", 3000, "http://primary", BTreeMap::new());
        registry.mark_fallback("sb1", 3000, "http://fallback");

        registry.register("sb1", 3000, "http://primary2", BTreeMap::new());
        let target = registry.resolve("sb1", 3000).unwrap();
        assert!(!target.use_fallback);
        assert_eq!(target.effective_url(), "http://primary2");
    }

    #[test]
    fn test_list_and_evict() {
        let registry = registry();
        registry.register("sb1", 3000, "http://a", BTreeMap::new());
        registry.register("sb1", 8080, "http://b", BTreeMap::new());
        registry.register("sb2", 3000, "http://c", BTreeMap::new());

        let keys: Vec<String> = registry.list_targets().into_keys().collect();
        assert_eq!(keys, vec!["sb1:3000", "sb1:8080", "sb2:3000"]);

        assert_eq!(registry.evict_sandbox("sb1"), 2);
        assert_eq!(registry.evict_sandbox("sb1"), 0);
        assert!(registry.unregister("sb2", 3000).is_some());
        assert!(registry.list_targets().is_empty());
    }

    #[test]
    fn test_health_check_debounce() {
        let registry = registry();
        let target = registry.register("sb1", 3000, "http://a", BTreeMap::new());
        let registered = target.last_health_check;

        assert!(!registry.health_check_needed_at(&target, registered + Duration::from_secs(5)));
        assert!(registry.health_check_needed_at(&target, registered + Duration::from_secs(6)));
    }

    #[tokio::test]
    async fn test_ensure_primary_healthy_shortcuts() {
        let registry = registry();
        registry.register("sb1", 3000, "http://127.0.0.1:1", BTreeMap::new());

        let fresh = registry.resolve("sb1", 3000).unwrap();
        assert!(registry.ensure_primary_healthy(&fresh).await);

        registry.mark_fallback("sb1", 3000, "http://127.0.0.1:2");
        let on_fallback = registry.resolve("sb1", 3000).unwrap();
        assert!(!registry.ensure_primary_healthy(&on_fallback).await);
    }

    #[tokio::test]
    async fn test_ensure_primary_healthy_probes_when_stale() {
        let registry = registry();
        let mut stale = registry.register("sb1", 3000, "http://127.0.0.1:1", BTreeMap::new());
        if let Some(earlier) = Instant::now().checked_sub(Duration::from_secs(10)) {
            stale.last_health_check = earlier;
            assert!(!registry.ensure_primary_healthy(&stale).await);
        }
    }
}
