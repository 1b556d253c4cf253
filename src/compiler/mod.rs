//! Compiler module - Compile phase of a submission
//!
//! Runs a language's compile command inside the submission's build scope,
//! under its own time and memory limits. A failed compilation is an outcome
//! (the student's diagnostic), not an error.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::RunError;
use crate::runner::{CommandSpec, ProcessLimits, ResourceKind, RunOutcome, RunStatus, Runner};
use crate::sandbox::Scope;

/// Result of a compilation attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileResult {
    pub success: bool,
    pub message: Option<String>,
}

impl CompileResult {
    fn succeeded() -> Self {
        Self {
            success: true,
            message: None,
        }
    }
}

/// Compile source code inside the build scope
pub async fn compile_in_scope(
    runner: &dyn Runner,
    scope: &Scope,
    compile_cmd: &[String],
    limits: &ProcessLimits,
    env: Vec<(String, String)>,
    cancel: &CancellationToken,
) -> Result<CompileResult, RunError> {
    if compile_cmd.is_empty() {
        return Ok(CompileResult::succeeded());
    }

    debug!("Compiling with {:?} in {}", compile_cmd, scope.path().display());

    let spec = CommandSpec::from_vec(compile_cmd)
        .with_env(env)
        .with_work_dir(scope.path());

    let result = runner.run(&spec, limits, "", cancel).await?;

    if result.is_success() {
        Ok(CompileResult::succeeded())
    } else {
        Ok(CompileResult {
            success: false,
            message: Some(failure_message(&result, limits)),
        })
    }
}

fn failure_message(result: &RunOutcome, limits: &ProcessLimits) -> String {
    if !result.stderr.is_empty() {
        return result.stderr.render();
    }
    if !result.stdout.is_empty() {
        return result.stdout.render();
    }

    match result.status {
        RunStatus::TimedOut => format!(
            "Compilation timed out after {}ms",
            limits.wall_time.as_millis()
        ),
        RunStatus::ResourceLimitExceeded(ResourceKind::Memory) => format!(
            "Compiler exceeded the {}MB memory limit",
            limits.memory_mb
        ),
        RunStatus::ResourceLimitExceeded(kind) => {
            format!("Compiler exceeded its {} limit", kind)
        }
        RunStatus::Signaled(sig) => format!("Compiler was killed by signal {}", sig),
        RunStatus::Exited(code) => format!("Compilation failed with exit code {}", code),
    }
}
