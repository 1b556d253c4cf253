//! Executor - the compile-then-run cycle for one submission's code
//!
//! `prepare` materializes a build scope, writes the source and runs the
//! compile phase once. `execute` gives every run a fresh scope seeded with a
//! copy of the build scope, so no run can observe another run's files.
//! Every sandboxed process (compile or run) holds one slot of the global pool
//! for as long as it is alive.

use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::compiler::compile_in_scope;
use crate::error::RunError;
use crate::languages::LanguageProfile;
use crate::runner::{CommandSpec, ProcessLimits, RunLimits, RunOutcome, Runner};
use crate::sandbox::{SandboxConfig, Scope, ScopeManager};

/// Scope subdirectory handed to programs as TMPDIR
pub const SCOPE_TMP_DIR: &str = ".tmp";

/// Counters over the executor's lifetime
#[derive(Debug, Default)]
struct SandboxStats {
    compiles: AtomicU64,
    runs: AtomicU64,
    launch_failures: AtomicU64,
    in_flight: AtomicUsize,
}

/// Point-in-time copy of the executor counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub compiles: u64,
    pub runs: u64,
    pub launch_failures: u64,
    pub in_flight: usize,
}

/// Decrements the in-flight counter on every exit path
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Source (and compiled artifacts) ready to run any number of times.
/// Dropping it removes the build scope.
#[derive(Debug)]
pub struct Program {
    profile: Arc<LanguageProfile>,
    limits: RunLimits,
    build: Scope,
}

impl Program {
    pub fn profile(&self) -> &LanguageProfile {
        &self.profile
    }

    pub fn limits(&self) -> RunLimits {
        self.limits
    }
}

/// Result of the compile phase
#[derive(Debug)]
pub enum Prepared {
    Ready(Program),
    CompileFailed { diagnostic: String },
}

/// Result of a one-shot compile-and-run
#[derive(Debug)]
pub enum SandboxRun {
    CompileError { diagnostic: String },
    Finished(RunOutcome),
}

pub struct Executor {
    runner: Arc<dyn Runner>,
    scopes: ScopeManager,
    config: SandboxConfig,
    slots: Arc<Semaphore>,
    slot_count: usize,
    stats: SandboxStats,
}

impl Executor {
    pub fn new(runner: Arc<dyn Runner>, config: SandboxConfig, slot_count: usize) -> Self {
        let slot_count = slot_count.max(1);
        info!(
            "Sandbox pool: {} slots, scopes under {}",
            slot_count,
            config.scratch_root.display()
        );
        Self {
            runner,
            scopes: ScopeManager::new(&config.scratch_root),
            config,
            slots: Arc::new(Semaphore::new(slot_count)),
            slot_count,
            stats: SandboxStats::default(),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn slots_in_use(&self) -> usize {
        self.slot_count - self.slots.available_permits()
    }

    pub fn scopes(&self) -> &ScopeManager {
        &self.scopes
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            compiles: self.stats.compiles.load(Ordering::SeqCst),
            runs: self.stats.runs.load(Ordering::SeqCst),
            launch_failures: self.stats.launch_failures.load(Ordering::SeqCst),
            in_flight: self.stats.in_flight.load(Ordering::SeqCst),
        }
    }

    /// Materialize the build scope and compile once (if the language needs it)
    pub async fn prepare(
        &self,
        profile: Arc<LanguageProfile>,
        source: &str,
        limits: RunLimits,
        cancel: &CancellationToken,
    ) -> Result<Prepared, RunError> {
        let build = self.scopes.create(&format!("build-{}", profile.id))?;
        build.write_file(&profile.source_file, source).await?;

        let Some(compile_cmd) = profile.render_compile_command(&limits) else {
            return Ok(Prepared::Ready(Program {
                profile,
                limits,
                build,
            }));
        };

        let compile_limits = ProcessLimits {
            wall_time: std::time::Duration::from_millis(u64::from(
                self.config.compile_time_limit_ms,
            )),
            memory_mb: self.config.compile_memory_limit_mb,
            ..self.process_limits(&limits, &profile)
        };

        let _slot = self.acquire_slot(cancel).await?;
        let _in_flight = InFlight::enter(&self.stats.in_flight);
        self.stats.compiles.fetch_add(1, Ordering::SeqCst);

        let tmp_dir = build.create_dir(SCOPE_TMP_DIR).await?;
        let env = self.child_env(build.path(), &tmp_dir, &profile);
        let result = compile_in_scope(
            self.runner.as_ref(),
            &build,
            &compile_cmd,
            &compile_limits,
            env,
            cancel,
        )
        .await;
        let result = self.track(result)?;

        if result.success {
            debug!("Compiled {} in {}", profile.id, build.path().display());
            Ok(Prepared::Ready(Program {
                profile,
                limits,
                build,
            }))
        } else {
            Ok(Prepared::CompileFailed {
                diagnostic: result.message.unwrap_or_default(),
            })
        }
    }

    /// Run a prepared program once in a fresh scope
    pub async fn execute(
        &self,
        program: &Program,
        stdin: &str,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, RunError> {
        let _slot = self.acquire_slot(cancel).await?;

        let scope = self.scopes.create(&format!("run-{}", program.profile.id))?;
        scope.copy_dir_in(program.build.path()).await?;
        let tmp_dir = scope.create_dir(SCOPE_TMP_DIR).await?;

        let cmd = CommandSpec::from_vec(&program.profile.render_run_command(&program.limits))
            .with_env(self.child_env(scope.path(), &tmp_dir, &program.profile))
            .with_work_dir(scope.path());
        let limits = self.process_limits(&program.limits, &program.profile);

        let _in_flight = InFlight::enter(&self.stats.in_flight);
        self.stats.runs.fetch_add(1, Ordering::SeqCst);

        let result = self.runner.run(&cmd, &limits, stdin, cancel).await;
        self.track(result)
    }

    /// Compile (if needed) and run once
    pub async fn run(
        &self,
        profile: Arc<LanguageProfile>,
        source: &str,
        stdin: &str,
        limits: RunLimits,
        cancel: &CancellationToken,
    ) -> Result<SandboxRun, RunError> {
        match self.prepare(profile, source, limits, cancel).await? {
            Prepared::CompileFailed { diagnostic } => Ok(SandboxRun::CompileError { diagnostic }),
            Prepared::Ready(program) => Ok(SandboxRun::Finished(
                self.execute(&program, stdin, cancel).await?,
            )),
        }
    }

    /// Wait for a pool slot; cancellation is honoured while waiting
    async fn acquire_slot(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit, RunError> {
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RunError::Cancelled),
            permit = Arc::clone(&self.slots).acquire_owned() => {
                permit.map_err(|_| RunError::Cancelled)
            }
        }
    }

    fn track<T>(&self, result: Result<T, RunError>) -> Result<T, RunError> {
        if let Err(RunError::Launch(e)) = &result {
            self.stats.launch_failures.fetch_add(1, Ordering::SeqCst);
            tracing::error!("Sandbox launch failed: {}", e);
        }
        result
    }

    fn process_limits(&self, limits: &RunLimits, profile: &LanguageProfile) -> ProcessLimits {
        ProcessLimits {
            wall_time: limits.timeout(),
            memory_mb: limits.memory_mb,
            address_space: profile.address_space_limit,
            file_size_kb: self.config.max_file_size_kb,
            open_files: self.config.max_open_files,
            max_processes: self.config.max_processes,
        }
    }

    /// The complete child environment: nothing is inherited implicitly
    fn child_env(
        &self,
        scope: &Path,
        tmp_dir: &Path,
        profile: &LanguageProfile,
    ) -> Vec<(String, String)> {
        let mut env = vec![
            ("PATH".to_string(), self.config.path_env.clone()),
            ("HOME".to_string(), scope.display().to_string()),
            ("TMPDIR".to_string(), tmp_dir.display().to_string()),
            ("LANG".to_string(), "C.UTF-8".to_string()),
        ];
        for name in &self.config.env_passthrough {
            if let Ok(value) = std::env::var(name) {
                env.push((name.clone(), value));
            }
        }
        env.extend(profile.env.iter().cloned());
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::languages::LanguageId;
    use crate::runner::RunStatus;
    use crate::test_support::{sh_executor, sh_registry};

    #[tokio::test]
    async fn test_interpreted_run() {
        let root = tempfile::tempdir().unwrap();
        let executor = sh_executor(root.path(), 2);
        let profile = sh_registry().profile_for(LanguageId::Python).unwrap();

        let run = executor
            .run(profile, "read x; echo \"got $x\"", "5\n", RunLimits::new(2000, 64), &CancellationToken::new())
            .await
            .unwrap();

        match run {
            SandboxRun::Finished(outcome) => {
                assert_eq!(outcome.status, RunStatus::Exited(0));
                assert_eq!(outcome.stdout.text(), "got 5\n");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(executor.stats().compiles, 0);
        assert_eq!(executor.stats().runs, 1);
        assert_eq!(executor.slots_in_use(), 0);
    }

    #[tokio::test]
    async fn test_compile_error_never_runs() {
        let root = tempfile::tempdir().unwrap();
        let executor = sh_executor(root.path(), 2);
        let profile = sh_registry().profile_for(LanguageId::C).unwrap();

        let run = executor
            .run(profile, "if then fi (", "", RunLimits::new(2000, 64), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(run, SandboxRun::CompileError { ref diagnostic } if !diagnostic.is_empty()));
        assert_eq!(executor.stats().compiles, 1);
        assert_eq!(executor.stats().runs, 0);
    }

    #[tokio::test]
    async fn test_runs_share_artifacts_but_not_scopes() {
        let root = tempfile::tempdir().unwrap();
        let executor = sh_executor(root.path(), 2);
        let profile = sh_registry().profile_for(LanguageId::C).unwrap();
        let cancel = CancellationToken::new();

        let source = "ls scratch.txt 2>/dev/null || echo fresh; echo dirty > scratch.txt";
        let program = match executor
            .prepare(profile, source, RunLimits::new(2000, 64), &cancel)
            .await
            .unwrap()
        {
            Prepared::Ready(program) => program,
            Prepared::CompileFailed { diagnostic } => panic!("compile failed: {}", diagnostic),
        };

        for _ in 0..2 {
            let outcome = executor.execute(&program, "", &cancel).await.unwrap();
            assert_eq!(outcome.stdout.text(), "fresh\n");
        }
        assert_eq!(executor.stats().compiles, 1);
        assert_eq!(executor.stats().runs, 2);

        drop(program);
        let leftovers = std::fs::read_dir(root.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_child_environment() {
        let root = tempfile::tempdir().unwrap();
        let executor = sh_executor(root.path(), 1);
        let profile = sh_registry().profile_for(LanguageId::Python).unwrap();

        let run = executor
            .run(profile, "echo \"$HOME|$TMPDIR|$LANG|$GRADER_LANG\"", "", RunLimits::new(2000, 64), &CancellationToken::new())
            .await
            .unwrap();
        let SandboxRun::Finished(outcome) = run else {
            panic!("unexpected compile error");
        };
        let text = outcome.stdout.text();
        let fields: Vec<&str> = text.trim().split('|').collect();
        assert!(fields[0].starts_with(root.path().to_str().unwrap()));
        assert_eq!(fields[1], format!("{}/{}", fields[0], SCOPE_TMP_DIR));
        assert_eq!(fields[2], "C.UTF-8");
        assert_eq!(fields[3], "python");
    }

    #[tokio::test]
    async fn test_tmpdir_is_writable_inside_scope() {
        let root = tempfile::tempdir().unwrap();
        let executor = sh_executor(root.path(), 1);
        let profile = sh_registry().profile_for(LanguageId::Python).unwrap();

        let run = executor
            .run(
                profile,
                "echo scratch > \"$TMPDIR/t\" && cat \"$TMPDIR/t\"",
                "",
                RunLimits::new(2000, 64),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let SandboxRun::Finished(outcome) = run else {
            panic!("unexpected compile error");
        };
        assert_eq!(outcome.status, RunStatus::Exited(0));
        assert_eq!(outcome.stdout.text().trim(), "scratch");
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_launch() {
        let root = tempfile::tempdir().unwrap();
        let executor = sh_executor(root.path(), 1);
        let profile = sh_registry().profile_for(LanguageId::Python).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = executor
            .run(profile, "echo never", "", RunLimits::new(2000, 64), &cancel)
            .await;
        assert!(matches!(result, Err(RunError::Cancelled)));
        assert_eq!(executor.stats().runs, 0);
        assert_eq!(executor.slots_in_use(), 0);
    }
}
