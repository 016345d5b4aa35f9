//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default directory holding one workspace per sandbox.
pub const DEFAULT_SANDBOX_ROOT: &str = "/tmp/serverless_sandboxes";

/// The default directory where snapshot archives are stored.
pub const DEFAULT_SNAPSHOT_ROOT: &str = "/tmp/sandcore_snapshots";

/// The only host directory under which external mounts may live.
pub const DEFAULT_MOUNT_ROOT: &str = "/sandbox/mounts";

/// The default audit log file.
pub const DEFAULT_EVENTS_FILE: &str = "./serverless_events.log";

/// Default host for the HTTP server
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default port for the HTTP server
pub const DEFAULT_SERVER_PORT: u16 = 8000;

/// Default wall-clock bound for a single command execution.
pub const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 15;

/// Timeout applied to each iteration of a background job.
pub const DEFAULT_BACKGROUND_TIMEOUT_SECS: u64 = 10;

/// First port handed out to fallback servers.
pub const DEFAULT_FALLBACK_PORT_START: u16 = 33000;

/// Last port handed out to fallback servers.
pub const DEFAULT_FALLBACK_PORT_END: u16 = 33999;

/// How long a freshly spawned fallback server gets to bind its listener.
pub const DEFAULT_STARTUP_GRACE_MS: u64 = 500;

/// How long a fallback server gets to exit after SIGTERM before it is killed.
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 5;

/// Interval of the periodic stale-process and idle-sandbox sweep.
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 30;

/// Address fallback servers bind to.
pub const DEFAULT_FALLBACK_BIND: &str = "127.0.0.1";

/// Upper bound for a proxied preview request.
pub const DEFAULT_PROXY_TIMEOUT_SECS: u64 = 30;

/// Upper bound for a health probe.
pub const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 2;

/// Minimum time between two health probes of the same target.
pub const DEFAULT_HEALTH_DEBOUNCE_SECS: u64 = 5;

/// Default number of executions a sandbox may run per hour.
pub const DEFAULT_EXECUTIONS_PER_HOUR: u32 = 120;

/// Default number of sandboxes that may exist at the same time.
pub const DEFAULT_MAX_CONCURRENT_SANDBOXES: usize = 10;

/// Default memory limit per sandbox in MiB.
pub const DEFAULT_MAX_MEMORY_MB: u64 = 2048;

/// Default CPU time limit per sandbox in seconds.
pub const DEFAULT_MAX_CPU_SECONDS: u64 = 3600;

/// Default storage limit per sandbox in GiB.
pub const DEFAULT_MAX_STORAGE_GB: u64 = 5;

/// Default network egress limit per sandbox in GiB.
pub const DEFAULT_MAX_NETWORK_EGRESS_GB: u64 = 1;

/// The arguments passed to the fallback server executable.
///
/// `{port}`, `{bind}` and `{root}` are substituted at spawn time.
pub const DEFAULT_FALLBACK_SERVER_ARGS: &[&str] = &[
    "static-serve",
    "--port",
    "{port}",
    "--bind",
    "{bind}",
    "--root",
    "{root}",
];
