//! Sandbox configuration
//!
//! Configuration for scopes, isolation and process limits, loaded from the environment.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use super::isolation::IsolationMode;
use crate::config::EnvReader;

/// Read-only host paths visible inside a bubblewrap sandbox
const DEFAULT_RO_BINDS: &[&str] = &[
    "/usr",
    "/bin",
    "/sbin",
    "/lib",
    "/lib32",
    "/lib64",
    "/etc/alternatives",
    "/etc/ld.so.cache",
    "/etc/ld.so.conf",
    "/etc/ld.so.conf.d",
    "/etc/java-17-openjdk",
    "/etc/java-21-openjdk",
];

/// Sandbox configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    /// Directory under which per-invocation scopes are created
    pub scratch_root: PathBuf,
    /// Isolation backend selection
    pub isolation: IsolationMode,
    /// Refuse backends that leave sibling scopes reachable (anything but bubblewrap)
    pub require_isolation: bool,
    /// Host paths bound read-only under bubblewrap
    pub ro_binds: Vec<PathBuf>,
    /// PATH given to sandboxed programs
    pub path_env: String,
    /// Host variables copied into the child environment when set
    pub env_passthrough: Vec<String>,
    /// Bytes kept per stream (stdout, stderr)
    pub output_limit_bytes: usize,
    /// Compile time limit in milliseconds (default: 30000ms = 30s)
    pub compile_time_limit_ms: u32,
    /// Compile memory limit in MB (default: 2048MB)
    pub compile_memory_limit_mb: u32,
    /// RLIMIT_NPROC, unset by default
    pub max_processes: Option<u64>,
    /// Maximum file size in KB
    pub max_file_size_kb: u64,
    /// Maximum open files
    pub max_open_files: u64,
    /// RSS watchdog sampling interval
    pub memory_poll_interval: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            scratch_root: std::env::temp_dir().join("grader-scopes"),
            isolation: IsolationMode::Auto,
            require_isolation: true,
            ro_binds: DEFAULT_RO_BINDS.iter().map(PathBuf::from).collect(),
            path_env: "/usr/local/bin:/usr/bin:/bin".to_string(),
            env_passthrough: Vec::new(),
            output_limit_bytes: 64 * 1024,
            compile_time_limit_ms: 30_000,
            compile_memory_limit_mb: 2048,
            max_processes: None,
            max_file_size_kb: 262_144, // 256MB
            max_open_files: 256,
            memory_poll_interval: Duration::from_millis(20),
        }
    }
}

impl SandboxConfig {
    pub(crate) fn from_reader(env: &EnvReader<'_>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            scratch_root: env
                .string("SANDBOX_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_root),
            isolation: env.parse("SANDBOX_ISOLATION", defaults.isolation)?,
            require_isolation: env.flag("SANDBOX_REQUIRE_ISOLATION", defaults.require_isolation)?,
            ro_binds: env
                .list("SANDBOX_RO_BINDS")
                .map(|binds| binds.into_iter().map(PathBuf::from).collect())
                .unwrap_or(defaults.ro_binds),
            path_env: env.string("SANDBOX_PATH").unwrap_or(defaults.path_env),
            env_passthrough: env
                .list("SANDBOX_ENV_PASSTHROUGH")
                .unwrap_or(defaults.env_passthrough),
            output_limit_bytes: env
                .parse("SANDBOX_OUTPUT_LIMIT_BYTES", defaults.output_limit_bytes)?,
            compile_time_limit_ms: env
                .parse("SANDBOX_COMPILE_TIME_LIMIT_MS", defaults.compile_time_limit_ms)?,
            compile_memory_limit_mb: env
                .parse("SANDBOX_COMPILE_MEMORY_LIMIT_MB", defaults.compile_memory_limit_mb)?,
            max_processes: env.optional("SANDBOX_MAX_PROCESSES")?,
            max_file_size_kb: env.parse("SANDBOX_MAX_FILE_SIZE_KB", defaults.max_file_size_kb)?,
            max_open_files: env.parse("SANDBOX_MAX_OPEN_FILES", defaults.max_open_files)?,
            memory_poll_interval: Duration::from_millis(
                env.parse("SANDBOX_MEMORY_POLL_MS", 20u64)?.max(1),
            ),
        })
    }
}
