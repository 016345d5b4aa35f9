//! The top-level sandcore configuration.

use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use getset::Getters;
use serde::{Deserialize, Serialize};
use tokio::fs;
use typed_builder::TypedBuilder;

use crate::{
    utils::{
        FALLBACK_EXE_ENV_VAR, MOUNT_ROOT_ENV_VAR, PREVIEW_ROUTER_URL_ENV_VAR, RECORDER_FILE_ENV_VAR,
        SANDBOX_ROOT_ENV_VAR, SNAPSHOT_ROOT_ENV_VAR,
    },
    SandcoreError, SandcoreResult,
};

use super::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The configuration of a sandcore service.
///
/// Every field has a default, so an empty TOML document is a valid configuration. Environment
/// variables are applied on top of the file by [`SandcoreConfig::load`].
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct SandcoreConfig {
    /// Directory holding one workspace per sandbox.
    #[builder(default = PathBuf::from(DEFAULT_SANDBOX_ROOT), setter(into))]
    sandbox_root: PathBuf,

    /// Directory where snapshot archives are stored.
    #[builder(default = PathBuf::from(DEFAULT_SNAPSHOT_ROOT), setter(into))]
    snapshot_root: PathBuf,

    /// Host directory under which mount targets must live.
    #[builder(default = PathBuf::from(DEFAULT_MOUNT_ROOT), setter(into))]
    mount_root: PathBuf,

    /// The newline-delimited JSON audit log.
    #[builder(default = PathBuf::from(DEFAULT_EVENTS_FILE), setter(into))]
    events_file: PathBuf,

    /// HTTP server settings.
    #[builder(default)]
    server: ServerConfig,

    /// Command execution settings.
    #[builder(default)]
    exec: ExecConfig,

    /// Fallback container settings.
    #[builder(default)]
    fallback: FallbackConfig,

    /// Preview proxy settings.
    #[builder(default)]
    preview: PreviewConfig,

    /// Per-sandbox resource limits.
    #[builder(default)]
    quota: ResourceQuota,

    /// Sandboxes idle for longer than this are destroyed. Unset disables the reaper.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option))]
    idle_timeout_secs: Option<u64>,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct ServerConfig {
    /// The address to listen on.
    #[builder(default = DEFAULT_SERVER_HOST.to_string(), setter(into))]
    host: String,

    /// The port to listen on.
    #[builder(default = DEFAULT_SERVER_PORT)]
    port: u16,

    /// The externally reachable base URL used when handing out preview URLs.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    public_url: Option<String>,
}

/// Command execution settings.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct ExecConfig {
    /// Timeout for an execution that does not specify one.
    #[builder(default = DEFAULT_EXEC_TIMEOUT_SECS)]
    default_timeout_secs: u64,

    /// Timeout for each background job iteration.
    #[builder(default = DEFAULT_BACKGROUND_TIMEOUT_SECS)]
    background_timeout_secs: u64,
}

/// Fallback container settings.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct FallbackConfig {
    /// Ports handed out to fallback servers.
    #[builder(default)]
    port_range: PortRange,

    /// Time a new fallback server gets to bind before its URL is returned.
    #[builder(default = DEFAULT_STARTUP_GRACE_MS)]
    startup_grace_ms: u64,

    /// Time a fallback server gets to exit after SIGTERM.
    #[builder(default = DEFAULT_STOP_TIMEOUT_SECS)]
    stop_timeout_secs: u64,

    /// Interval of the stale-process and idle-sandbox sweep.
    #[builder(default = DEFAULT_CLEANUP_INTERVAL_SECS)]
    cleanup_interval_secs: u64,

    /// The fallback server executable. Defaults to the running executable.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[builder(default, setter(strip_option, into))]
    server_exe: Option<PathBuf>,

    /// Arguments for the fallback server, with `{port}`, `{bind}` and `{root}` placeholders.
    #[builder(default = FallbackConfig::default_server_args())]
    server_args: Vec<String>,
}

/// Preview proxy settings.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct PreviewConfig {
    /// Upper bound for a proxied request.
    #[builder(default = DEFAULT_PROXY_TIMEOUT_SECS)]
    request_timeout_secs: u64,

    /// Upper bound for a health probe.
    #[builder(default = DEFAULT_HEALTH_TIMEOUT_SECS)]
    health_timeout_secs: u64,

    /// Minimum time between two probes of the same target.
    #[builder(default = DEFAULT_HEALTH_DEBOUNCE_SECS)]
    health_debounce_secs: u64,
}

/// Static per-sandbox resource limits.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder, PartialEq, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct ResourceQuota {
    /// Executions allowed in any sliding one-hour window.
    #[builder(default = DEFAULT_EXECUTIONS_PER_HOUR)]
    executions_per_hour: u32,

    /// Sandboxes that may exist at once.
    #[builder(default = DEFAULT_MAX_CONCURRENT_SANDBOXES)]
    max_concurrent_sandboxes: usize,

    /// Memory limit in MiB.
    #[builder(default = DEFAULT_MAX_MEMORY_MB)]
    max_memory_mb: u64,

    /// CPU time limit in seconds.
    #[builder(default = DEFAULT_MAX_CPU_SECONDS)]
    max_cpu_seconds: u64,

    /// Storage limit in GiB.
    #[builder(default = DEFAULT_MAX_STORAGE_GB)]
    max_storage_gb: u64,

    /// Network egress limit in GiB.
    #[builder(default = DEFAULT_MAX_NETWORK_EGRESS_GB)]
    max_network_egress_gb: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandcoreConfig {
    /// Loads the configuration from an optional TOML file and applies environment overrides.
    pub async fn load(path: Option<&Path>) -> SandcoreResult<Self> {
        let mut config = match path {
            Some(path) => {
                let contents = fs::read_to_string(path).await?;
                let config: Self = toml::from_str(&contents)?;
                tracing::info!(path = %path.display(), "loaded configuration file");
                config
            }
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Overrides fields from their environment variables when those are set.
    pub fn apply_env_overrides(&mut self) {
        if let Some(path) = env::var_os(SANDBOX_ROOT_ENV_VAR) {
            self.sandbox_root = PathBuf::from(path);
        }

        if let Some(path) = env::var_os(SNAPSHOT_ROOT_ENV_VAR) {
            self.snapshot_root = PathBuf::from(path);
        }

        if let Some(path) = env::var_os(MOUNT_ROOT_ENV_VAR) {
            self.mount_root = PathBuf::from(path);
        }

        if let Some(path) = env::var_os(RECORDER_FILE_ENV_VAR) {
            self.events_file = PathBuf::from(path);
        }

        if let Some(path) = env::var_os(FALLBACK_EXE_ENV_VAR) {
            self.fallback.server_exe = Some(PathBuf::from(path));
        }

        if let Ok(url) = env::var(PREVIEW_ROUTER_URL_ENV_VAR) {
            self.server.public_url = Some(url);
        }
    }

    /// Rejects configurations that cannot work.
    pub fn validate(&self) -> SandcoreResult<()> {
        if !self.mount_root.is_absolute() {
            return Err(SandcoreError::InvalidConfig(format!(
                "mount_root must be absolute: {}",
                self.mount_root.display()
            )));
        }

        if self.exec.default_timeout_secs == 0 || self.exec.background_timeout_secs == 0 {
            return Err(SandcoreError::InvalidConfig(
                "execution timeouts must be greater than zero".to_string(),
            ));
        }

        if self.preview.request_timeout_secs == 0 || self.preview.health_timeout_secs == 0 {
            return Err(SandcoreError::InvalidConfig(
                "preview timeouts must be greater than zero".to_string(),
            ));
        }

        if self.fallback.cleanup_interval_secs == 0 {
            return Err(SandcoreError::InvalidConfig(
                "fallback.cleanup_interval_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Replaces the listen address with values given on the command line.
    pub fn set_listen_address(&mut self, host: Option<String>, port: Option<u16>) {
        if let Some(host) = host {
            self.server.host = host;
        }

        if let Some(port) = port {
            self.server.port = port;
        }
    }

    /// The idle timeout as a duration, if one is configured.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

impl ServerConfig {
    /// The base URL preview links are built from.
    pub fn public_base_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }
}

impl ExecConfig {
    /// The default execution timeout.
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    /// The timeout of one background job iteration.
    pub fn background_timeout(&self) -> Duration {
        Duration::from_secs(self.background_timeout_secs)
    }
}

impl FallbackConfig {
    fn default_server_args() -> Vec<String> {
        DEFAULT_FALLBACK_SERVER_ARGS
            .iter()
            .map(|arg| arg.to_string())
            .collect()
    }

    /// The startup grace period.
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    /// The graceful stop timeout.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// The sweep interval.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

impl PreviewConfig {
    /// The proxied request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// The health probe timeout.
    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    /// The health probe debounce window.
    pub fn health_debounce(&self) -> Duration {
        Duration::from_secs(self.health_debounce_secs)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for SandcoreConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for ResourceQuota {
    fn default() -> Self {
        Self::builder().build()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SandcoreConfig::default();
        assert_eq!(
            config.get_sandbox_root(),
            &PathBuf::from("/tmp/serverless_sandboxes")
        );
        assert_eq!(config.get_mount_root(), &PathBuf::from("/sandbox/mounts"));
        assert_eq!(config.get_exec().default_timeout(), Duration::from_secs(15));
        assert_eq!(config.get_fallback().get_port_range().start(), 33000);
        assert_eq!(config.get_fallback().get_port_range().end(), 33999);
        assert_eq!(*config.get_quota().get_executions_per_hour(), 120);
        assert_eq!(
            config.get_server().public_base_url(),
            "http://127.0.0.1:8000"
        );
        assert!(config.idle_timeout().is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: SandcoreConfig = toml::from_str(
            r#"
            sandbox_root = "/srv/sandboxes"
            idle_timeout_secs = 600

            [server]
            port = 9000
            public_url = "https://preview.example.com/"

            [fallback]
            port_range = "40000-40009"

            [quota]
            executions_per_hour = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.get_sandbox_root(), &PathBuf::from("/srv/sandboxes"));
        assert_eq!(*config.get_server().get_port(), 9000);
        assert_eq!(config.get_server().get_host(), DEFAULT_SERVER_HOST);
        assert_eq!(
            config.get_server().public_base_url(),
            "https://preview.example.com"
        );
        assert_eq!(config.get_fallback().get_port_range().len(), 10);
        assert_eq!(
            config.get_fallback().get_server_args()[0],
            "static-serve".to_string()
        );
        assert_eq!(*config.get_quota().get_executions_per_hour(), 3);
        assert_eq!(
            *config.get_quota().get_max_concurrent_sandboxes(),
            DEFAULT_MAX_CONCURRENT_SANDBOXES
        );
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = SandcoreConfig::builder().mount_root("relative").build();
        assert!(matches!(
            config.validate(),
            Err(SandcoreError::InvalidConfig(_))
        ));

        let config = SandcoreConfig::builder()
            .exec(ExecConfig::builder().default_timeout_secs(0).build())
            .build();
        assert!(matches!(
            config.validate(),
            Err(SandcoreError::InvalidConfig(_))
        ));
    }

    #[test]
    #[serial_test::serial]
    fn test_env_overrides() {
        env::set_var(SANDBOX_ROOT_ENV_VAR, "/var/lib/sandboxes");
        env::set_var(RECORDER_FILE_ENV_VAR, "/var/log/events.log");
        env::set_var(PREVIEW_ROUTER_URL_ENV_VAR, "http://router:8080");

        let mut config = SandcoreConfig::default();
        config.apply_env_overrides();

        env::remove_var(SANDBOX_ROOT_ENV_VAR);
        env::remove_var(RECORDER_FILE_ENV_VAR);
        env::remove_var(PREVIEW_ROUTER_URL_ENV_VAR);

        assert_eq!(
            config.get_sandbox_root(),
            &PathBuf::from("/var/lib/sandboxes")
        );
        assert_eq!(
            config.get_events_file(),
            &PathBuf::from("/var/log/events.log")
        );
        assert_eq!(
            config.get_server().public_base_url(),
            "http://router:8080"
        );
    }
}
