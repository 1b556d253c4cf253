//! Sandboxed runner implementation
//!
//! Executes untrusted code as the leader of a fresh process group with a
//! cleared environment, kernel rlimits and the configured isolation backend.
//! The wall-clock deadline, cancellation and the RSS watchdog all end in a
//! SIGKILL of the whole group, never of the top process alone.

use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::capture::{read_capped, CapturedOutput};
use super::limits::ProcessLimits;
use super::process_group::ProcessGroup;
use super::{CommandSpec, ResourceKind, RunOutcome, RunStatus, Runner};
use crate::error::{LaunchError, RunError};
use crate::sandbox::{Isolation, SandboxConfig};

/// How long to wait for the output pipes to close once the group is dead
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Messages runtimes print when an allocation fails under RLIMIT_AS or their own heap cap
const OUT_OF_MEMORY_MARKERS: &[&str] = &[
    "MemoryError",
    "std::bad_alloc",
    "java.lang.OutOfMemoryError",
    "JavaScript heap out of memory",
    "Cannot allocate memory",
    "out of memory",
];

/// Why the supervisor killed the group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kill {
    Deadline,
    Memory,
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runner that executes untrusted code
#[derive(Debug, Clone)]
pub struct SandboxedRunner {
    isolation: Isolation,
    /// Bytes kept per output stream
    output_limit: usize,
    /// RSS watchdog sampling interval
    memory_poll: Duration,
}

impl SandboxedRunner {
    pub fn new(isolation: Isolation, output_limit: usize, memory_poll: Duration) -> Self {
        Self {
            isolation,
            output_limit,
            memory_poll,
        }
    }

    pub fn from_config(isolation: Isolation, config: &SandboxConfig) -> Self {
        Self::new(
            isolation,
            config.output_limit_bytes,
            config.memory_poll_interval,
        )
    }

    pub fn isolation(&self) -> &Isolation {
        &self.isolation
    }

    /// Run a command under the given limits
    pub async fn execute(
        &self,
        cmd: &CommandSpec,
        limits: &ProcessLimits,
        stdin: &str,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }

        let argv = self.isolation.wrap(cmd);
        let (program, args) = argv.split_first().ok_or_else(|| LaunchError::Spawn {
            program: String::new(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })?;

        let mut command = Command::new(program);
        command
            .args(args)
            .env_clear()
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &cmd.work_dir {
            command.current_dir(dir);
        }

        let setup = limits.child_setup(self.isolation.unshares_in_child());
        // SAFETY: `ChildSetup::apply` only issues setsid/unshare/setrlimit
        // syscalls on plain copied data; it neither allocates nor locks.
        unsafe {
            command.pre_exec(move || setup.apply());
        }

        debug!(
            "Running {:?} (isolation: {}, limits: {:?})",
            cmd.to_vec(),
            self.isolation,
            limits
        );

        let started = Instant::now();
        let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
            program: cmd.program.clone(),
            source,
        })?;
        let group = match child.id() {
            Some(pid) => ProcessGroup::new(pid),
            None => {
                return Err(LaunchError::Wait(std::io::Error::other(
                    "child was reaped before supervision started",
                ))
                .into())
            }
        };

        let _stdin_writer = child.stdin.take().map(|mut pipe| {
            let data = stdin.as_bytes().to_vec();
            AbortOnDrop(tokio::spawn(async move {
                // The program may exit without reading its input
                let _ = pipe.write_all(&data).await;
                let _ = pipe.shutdown().await;
            }))
        });
        let stdout_reader = AbortOnDrop(tokio::spawn(read_capped(
            child.stdout.take(),
            self.output_limit,
        )));
        let stderr_reader = AbortOnDrop(tokio::spawn(read_capped(
            child.stderr.take(),
            self.output_limit,
        )));

        let deadline = tokio::time::Instant::now() + limits.wall_time;
        let memory_limit_kb = limits.memory_kb();
        let mut sampler = tokio::time::interval(self.memory_poll);
        sampler.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut peak_kb = 0u64;
        let mut killed: Option<Kill> = None;

        let exit_status = loop {
            tokio::select! {
                biased;
                status = child.wait() => break status.map_err(LaunchError::Wait)?,
                _ = cancel.cancelled() => {
                    group.kill();
                    let _ = child.wait().await;
                    debug!("Run cancelled, killed process group {}", group.id());
                    return Err(RunError::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline), if killed.is_none() => {
                    group.kill();
                    killed = Some(Kill::Deadline);
                }
                _ = sampler.tick(), if killed.is_none() => {
                    if let Some(kb) = group.resident_kb() {
                        peak_kb = peak_kb.max(kb);
                        if kb > memory_limit_kb {
                            group.kill();
                            killed = Some(Kill::Memory);
                        }
                    }
                }
            }
        };
        let elapsed = started.elapsed();

        // Leftover descendants (background jobs) die with the leader
        group.kill();

        let stdout = collect(stdout_reader, "stdout").await;
        let stderr = collect(stderr_reader, "stderr").await;

        let status = match killed {
            Some(Kill::Deadline) => RunStatus::TimedOut,
            Some(Kill::Memory) => RunStatus::ResourceLimitExceeded(ResourceKind::Memory),
            None => self.classify_exit(exit_status, &stderr),
        };

        debug!(
            "Process group {} finished: {:?} in {}ms, peak {}KB",
            group.id(),
            status,
            elapsed.as_millis(),
            peak_kb
        );

        Ok(RunOutcome {
            status,
            elapsed,
            memory_kb: peak_kb,
            stdout,
            stderr,
        })
    }

    fn classify_exit(&self, status: ExitStatus, stderr: &CapturedOutput) -> RunStatus {
        let signal = status.signal().or_else(|| {
            // bwrap reports a signalled child as 128 + signal
            match (&self.isolation, status.code()) {
                (Isolation::Bubblewrap { .. }, Some(code)) if (129..160).contains(&code) => {
                    Some(code - 128)
                }
                _ => None,
            }
        });

        match signal.map(Signal::try_from) {
            Some(Ok(Signal::SIGXCPU)) => RunStatus::ResourceLimitExceeded(ResourceKind::Cpu),
            Some(Ok(Signal::SIGXFSZ)) => RunStatus::ResourceLimitExceeded(ResourceKind::OutputFile),
            Some(_) if reports_out_of_memory(stderr) => {
                RunStatus::ResourceLimitExceeded(ResourceKind::Memory)
            }
            Some(_) => RunStatus::Signaled(signal.unwrap_or_default()),
            None => {
                let code = status.code().unwrap_or(-1);
                if code != 0 && reports_out_of_memory(stderr) {
                    RunStatus::ResourceLimitExceeded(ResourceKind::Memory)
                } else {
                    RunStatus::Exited(code)
                }
            }
        }
    }
}

fn reports_out_of_memory(stderr: &CapturedOutput) -> bool {
    let text = stderr.text();
    OUT_OF_MEMORY_MARKERS
        .iter()
        .any(|marker| text.contains(marker))
}

async fn collect(
    mut reader: AbortOnDrop<std::io::Result<CapturedOutput>>,
    stream: &str,
) -> CapturedOutput {
    match tokio::time::timeout(DRAIN_GRACE, &mut reader.0).await {
        Ok(Ok(Ok(output))) => output,
        Ok(Ok(Err(e))) => {
            warn!("Failed to read {}: {}", stream, e);
            CapturedOutput::default()
        }
        Ok(Err(e)) => {
            warn!("{} reader task failed: {}", stream, e);
            CapturedOutput::default()
        }
        Err(_) => {
            warn!(
                "{} still open {}ms after the process group was killed",
                stream,
                DRAIN_GRACE.as_millis()
            );
            CapturedOutput::default()
        }
    }
}

#[async_trait]
impl Runner for SandboxedRunner {
    async fn run(
        &self,
        cmd: &CommandSpec,
        limits: &ProcessLimits,
        stdin: &str,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        self.execute(cmd, limits, stdin, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::has_binary;

    fn runner(output_limit: usize) -> SandboxedRunner {
        SandboxedRunner::new(Isolation::None, output_limit, Duration::from_millis(10))
    }

    fn limits(wall_ms: u64) -> ProcessLimits {
        ProcessLimits {
            wall_time: Duration::from_millis(wall_ms),
            memory_mb: 128,
            address_space: false,
            file_size_kb: 1024,
            open_files: 64,
            max_processes: None,
        }
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("/bin/sh")
            .with_args(["-c", script])
            .with_env([("PATH", "/usr/local/bin:/usr/bin:/bin")])
    }

    #[tokio::test]
    async fn test_echoes_stdin() {
        let outcome = runner(1024)
            .execute(&sh("cat"), &limits(2000), "5\n", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Exited(0));
        assert_eq!(outcome.stdout.text(), "5\n");
    }

    #[tokio::test]
    async fn test_reports_exit_code_and_stderr() {
        let outcome = runner(1024)
            .execute(&sh("echo oops >&2; exit 3"), &limits(2000), "", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Exited(3));
        assert_eq!(outcome.stderr.text(), "oops\n");
    }

    #[tokio::test]
    async fn test_timeout_is_distinct_from_exit_code() {
        let started = Instant::now();
        let outcome = runner(1024)
            .execute(&sh("while :; do :; done"), &limits(200), "", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::TimedOut);
        assert!(outcome.elapsed >= Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_timeout_kills_whole_tree() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = sh("(sleep 1; touch escaped) & sleep 30").with_work_dir(dir.path());

        let outcome = runner(1024)
            .execute(&cmd, &limits(200), "", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::TimedOut);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("escaped").exists());
    }

    #[tokio::test]
    async fn test_output_is_bounded() {
        let outcome = runner(1000)
            .execute(&sh("head -c 200000 /dev/zero | tr '\\0' x"), &limits(5000), "", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::Exited(0));
        assert_eq!(outcome.stdout.text().len(), 1000);
        assert_eq!(outcome.stdout.omitted_bytes(), 199_000);
        assert!(outcome.stdout.render().contains("[output truncated"));
    }

    #[tokio::test]
    async fn test_print_forever_times_out_with_bounded_output() {
        let outcome = runner(4096)
            .execute(&sh("yes"), &limits(300), "", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, RunStatus::TimedOut);
        assert_eq!(outcome.stdout.text().len(), 4096);
        assert!(outcome.stdout.is_truncated());
    }

    #[tokio::test]
    async fn test_environment_is_allow_listed() {
        let cmd = sh("env").with_env([("PATH", "/usr/bin:/bin"), ("GRADER_PROBE", "1")]);
        let outcome = runner(64 * 1024)
            .execute(&cmd, &limits(2000), "", &CancellationToken::new())
            .await
            .unwrap();
        let env = outcome.stdout.text();
        assert!(env.contains("GRADER_PROBE=1"));
        assert!(!env.lines().any(|line| line.starts_with("HOME=")));
        assert!(!env.lines().any(|line| line.starts_with("USER=")));
    }

    #[tokio::test]
    async fn test_cancellation_kills_process() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = runner(1024)
            .execute(&sh("sleep 30"), &limits(30_000), "", &cancel)
            .await;
        assert!(matches!(result, Err(RunError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_error() {
        let cmd = CommandSpec::new("/nonexistent/interpreter");
        let result = runner(1024)
            .execute(&cmd, &limits(1000), "", &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(RunError::Launch(LaunchError::Spawn { .. }))
        ));
    }

    #[tokio::test]
    async fn test_file_size_limit() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = sh("head -c 4194304 /dev/zero > big.bin").with_work_dir(dir.path());
        let outcome = runner(1024)
            .execute(&cmd, &limits(5000), "", &CancellationToken::new())
            .await
            .unwrap();
        // The shell reports the failed write, or `head` dies from SIGXFSZ
        assert!(!outcome.is_success());
        let written = std::fs::metadata(dir.path().join("big.bin")).map(|m| m.len()).unwrap_or(0);
        assert!(written <= 1024 * 1024);
    }

    #[tokio::test]
    async fn test_memory_watchdog() {
        if !has_binary("python3") {
            return;
        }
        let cmd = CommandSpec::new("python3")
            .with_args(["-c", "import time\nx = b'x' * (300 * 1024 * 1024)\ntime.sleep(5)"])
            .with_env([("PATH", "/usr/local/bin:/usr/bin:/bin")]);

        let outcome = runner(1024)
            .execute(&cmd, &limits(4000), "", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome.status,
            RunStatus::ResourceLimitExceeded(ResourceKind::Memory)
        );
    }

    #[tokio::test]
    async fn test_address_space_limit() {
        if !has_binary("python3") {
            return;
        }
        let cmd = CommandSpec::new("python3")
            .with_args(["-c", "x = bytearray(300 * 1024 * 1024)"])
            .with_env([("PATH", "/usr/local/bin:/usr/bin:/bin")]);
        let mut limits = limits(4000);
        limits.address_space = true;

        let outcome = runner(4096)
            .execute(&cmd, &limits, "", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome.status,
            RunStatus::ResourceLimitExceeded(ResourceKind::Memory)
        );
    }

    #[test]
    fn test_bwrap_signal_exit_codes() {
        let bwrap = SandboxedRunner::new(
            Isolation::Bubblewrap { ro_binds: vec![] },
            1024,
            Duration::from_millis(10),
        );
        let status = ExitStatus::from_raw(137 << 8);
        assert_eq!(
            bwrap.classify_exit(status, &CapturedOutput::default()),
            RunStatus::Signaled(9)
        );
        assert_eq!(
            runner(1024).classify_exit(status, &CapturedOutput::default()),
            RunStatus::Exited(137)
        );

        let xcpu = ExitStatus::from_raw(Signal::SIGXCPU as i32);
        assert_eq!(
            runner(1024).classify_exit(xcpu, &CapturedOutput::default()),
            RunStatus::ResourceLimitExceeded(ResourceKind::Cpu)
        );

        let oom = CapturedOutput::from_text("Traceback ...\nMemoryError\n");
        assert_eq!(
            runner(1024).classify_exit(ExitStatus::from_raw(1 << 8), &oom),
            RunStatus::ResourceLimitExceeded(ResourceKind::Memory)
        );
    }
}
