//! Runner module - Process execution layer
//!
//! This module runs exactly one command inside an already materialized scope:
//! - `SandboxedRunner`: untrusted code under rlimits, a private process group,
//!   optional namespace isolation, a wall-clock deadline and an RSS watchdog
//! - bounded stdout/stderr capture
//!
//! The runner module does NOT:
//! - Create or remove scopes (see `sandbox`)
//! - Know about languages, compilation or test cases
//! - Compare outputs or determine verdicts

pub mod capture;
pub mod limits;
pub mod process_group;
pub mod sandboxed;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::RunError;

pub use capture::CapturedOutput;
pub use limits::ProcessLimits;
pub use sandboxed::SandboxedRunner;

/// Command specification for execution
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program path or name
    pub program: String,
    /// Arguments to the program
    pub args: Vec<String>,
    /// The complete child environment (the host environment is never inherited)
    pub env: Vec<(String, String)>,
    /// Working directory
    pub work_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            work_dir: None,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|a| a.into()).collect();
        self
    }

    pub fn with_env(
        mut self,
        env: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        self.env = env.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        self
    }

    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Create from a command vector (first element is program, rest are args)
    pub fn from_vec(cmd: &[String]) -> Self {
        let mut iter = cmd.iter();
        let program = iter.next().cloned().unwrap_or_default();
        Self {
            program,
            args: iter.cloned().collect(),
            env: Vec::new(),
            work_dir: None,
        }
    }

    /// Convert to a vector of strings (program + args)
    pub fn to_vec(&self) -> Vec<String> {
        let mut v = vec![self.program.clone()];
        v.extend(self.args.iter().cloned());
        v
    }
}

/// Per-run limits as requested by the caller: `{timeoutMs, memoryMb}` on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLimits {
    /// Wall-clock limit in milliseconds
    #[serde(rename = "timeoutMs")]
    pub time_ms: u32,
    /// Memory ceiling in MB
    pub memory_mb: u32,
}

impl RunLimits {
    pub fn new(time_ms: u32, memory_mb: u32) -> Self {
        Self { time_ms, memory_mb }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.time_ms))
    }
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            time_ms: 1000,
            memory_mb: 256,
        }
    }
}

/// Which ceiling a killed program ran into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Memory,
    Cpu,
    OutputFile,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Memory => "memory",
            ResourceKind::Cpu => "cpu",
            ResourceKind::OutputFile => "output_file",
        };
        write!(f, "{}", s)
    }
}

/// Execution status (raw, no verdict interpretation)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Program exited normally with given exit code
    Exited(i32),
    /// Killed by a signal the sandbox did not send
    Signaled(i32),
    /// Wall-clock deadline reached; the whole process group was killed
    TimedOut,
    /// A resource ceiling was hit
    ResourceLimitExceeded(ResourceKind),
}

impl RunStatus {
    /// Check if execution was successful (exited with code 0)
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Exited(0))
    }
}

/// Outcome of running a program
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Wall-clock time from spawn to exit
    pub elapsed: Duration,
    /// Highest resident set size sampled for the process group, in KB
    pub memory_kb: u64,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Runner trait for executing programs
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run a command with the given limits and stdin. Cancelling the token
    /// kills the process group and returns `RunError::Cancelled`.
    async fn run(
        &self,
        cmd: &CommandSpec,
        limits: &ProcessLimits,
        stdin: &str,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, RunError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_spec_round_trip() {
        let cmd = vec!["python3".to_string(), "-u".to_string(), "main.py".to_string()];
        let spec = CommandSpec::from_vec(&cmd).with_work_dir("/tmp/scope");
        assert_eq!(spec.program, "python3");
        assert_eq!(spec.args, vec!["-u", "main.py"]);
        assert_eq!(spec.to_vec(), cmd);
        assert_eq!(spec.work_dir.as_deref(), Some(Path::new("/tmp/scope")));
    }

    #[test]
    fn test_run_limits_wire_format() {
        let limits: RunLimits = serde_json::from_str(r#"{"timeoutMs": 200, "memoryMb": 64}"#).unwrap();
        assert_eq!(limits, RunLimits::new(200, 64));
        assert_eq!(limits.timeout(), Duration::from_millis(200));
    }
}
