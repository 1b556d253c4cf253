//! Judger module - the test case evaluator
//!
//! Compiles a submission once, fans its test cases out to the sandbox with a
//! per-submission cap, compares each case's output and hands the outcomes to
//! the grading aggregator in request order.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{CaseStatus, ExecutionRequest, RunRequest, TestCase};
use crate::error::{EngineError, RunError};
use crate::executor::{Executor, Prepared, SandboxRun};
use crate::grading::{self, ExecutionOutcome, SubmissionReport};
use crate::languages::{LanguageId, LanguageProfile, LanguageRegistry};
use crate::runner::{ResourceKind, RunOutcome, RunStatus};

/// Request-size limits and the per-submission parallelism cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvaluatorLimits {
    pub max_source_bytes: usize,
    pub max_input_bytes: usize,
    pub max_test_cases: usize,
    /// At most this many cases of one submission run at once
    pub per_submission_parallelism: usize,
}

impl Default for EvaluatorLimits {
    fn default() -> Self {
        Self {
            max_source_bytes: 1024 * 1024,
            max_input_bytes: 10 * 1024 * 1024,
            max_test_cases: 100,
            per_submission_parallelism: 4,
        }
    }
}

/// Result of a "run my code" request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub request_id: String,
    /// Compiled and exited with code 0
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_limit: Option<ResourceKind>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed_ms: u64,
    pub memory_kb: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunReport {
    /// A request the engine could not run at all
    pub fn failed(request_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            exit_code: None,
            timed_out: false,
            resource_limit: None,
            stdout: String::new(),
            stderr: String::new(),
            elapsed_ms: 0,
            memory_kb: 0,
            compile_output: None,
            error: Some(error.into()),
        }
    }
}

pub struct Evaluator {
    registry: Arc<LanguageRegistry>,
    executor: Arc<Executor>,
    limits: EvaluatorLimits,
}

impl Evaluator {
    pub fn new(
        registry: Arc<LanguageRegistry>,
        executor: Arc<Executor>,
        limits: EvaluatorLimits,
    ) -> Self {
        Self {
            registry,
            executor,
            limits,
        }
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn limits(&self) -> EvaluatorLimits {
        self.limits
    }

    /// Grade a submission against its test cases
    pub async fn evaluate(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<SubmissionReport, EngineError> {
        self.validate_submission(request)?;
        let language = self.resolve(&request.language, request.allowed_languages.as_deref())?;

        if request.test_cases.is_empty() {
            info!("Submission {}: no test cases, skipping sandbox", request.submission_id);
            return Ok(grading::aggregate(&request.submission_id, language, Vec::new()));
        }

        let profile = self.registry.profile_for(language)?;
        let limits = profile.effective_limits(request.limits.as_ref());
        info!(
            "Submission {}: {} with {} test cases, limits {}ms/{}MB",
            request.submission_id,
            describe(&profile),
            request.test_cases.len(),
            limits.time_ms,
            limits.memory_mb
        );

        let program = match self
            .executor
            .prepare(profile, &request.code, limits, cancel)
            .await?
        {
            Prepared::Ready(program) => Arc::new(program),
            Prepared::CompileFailed { diagnostic } => {
                info!("Submission {}: compile error", request.submission_id);
                return Ok(grading::compile_failure(
                    &request.submission_id,
                    language,
                    &request.test_cases,
                    diagnostic,
                ));
            }
        };

        // Cancelled on every early return, which kills the cases still running
        let cases_token = cancel.child_token();
        let _cases_guard = cases_token.clone().drop_guard();
        let permits = Arc::new(Semaphore::new(self.limits.per_submission_parallelism.max(1)));

        let mut tasks = JoinSet::new();
        for (index, case) in request.test_cases.iter().enumerate() {
            let executor = Arc::clone(&self.executor);
            let program = Arc::clone(&program);
            let permits = Arc::clone(&permits);
            let token = cases_token.clone();
            let input = case.input.clone();

            tasks.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = token.cancelled() => return (index, Err(RunError::Cancelled)),
                    permit = permits.acquire_owned() => permit,
                };
                let Ok(_permit) = permit else {
                    return (index, Err(RunError::Cancelled));
                };
                (index, executor.execute(&program, &input, &token).await)
            });
        }

        let mut slots: Vec<Option<ExecutionOutcome>> = vec![None; request.test_cases.len()];
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = match joined {
                Ok(done) => done,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(_) => (usize::MAX, Err(RunError::Cancelled)),
            };

            match result {
                Ok(outcome) => {
                    let case = &request.test_cases[index];
                    let judged = judge_case(index, case, &outcome);
                    debug!(
                        "Submission {} case {}: {} in {}ms",
                        request.submission_id, index, judged.status, judged.elapsed_ms
                    );
                    slots[index] = Some(judged);
                }
                Err(RunError::Cancelled) => {
                    info!("Submission {}: cancelled", request.submission_id);
                    failure = Some(EngineError::Cancelled);
                    break;
                }
                Err(RunError::Launch(e)) => {
                    warn!(
                        "Submission {}: sandbox failure on case {}: {}",
                        request.submission_id, index, e
                    );
                    failure = Some(EngineError::Launch(e));
                    break;
                }
            }
        }

        if let Some(err) = failure {
            // Siblings are killed and their scopes removed before we return
            cases_token.cancel();
            tasks.shutdown().await;
            return Err(err);
        }

        let outcomes: Vec<ExecutionOutcome> = slots.into_iter().flatten().collect();
        let report = grading::aggregate(&request.submission_id, language, outcomes);
        info!(
            "Submission {}: {}/{} passed, grade {:.2}",
            report.submission_id, report.passed, report.total, report.grade
        );
        Ok(report)
    }

    /// Run code once against custom stdin, no grading
    pub async fn run_custom(
        &self,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> Result<RunReport, EngineError> {
        self.validate_source(&request.code)?;
        self.validate_input(&request.stdin, "stdin")?;
        let language = self.resolve(&request.language, None)?;
        let profile = self.registry.profile_for(language)?;
        let limits = profile.effective_limits(request.limits.as_ref());

        debug!("Run request {}: {}", request.request_id, language);

        let run = self
            .executor
            .run(profile, &request.code, &request.stdin, limits, cancel)
            .await?;

        let report = match run {
            SandboxRun::CompileError { diagnostic } => RunReport {
                compile_output: Some(diagnostic),
                error: None,
                ..RunReport::failed(&request.request_id, "")
            },
            SandboxRun::Finished(outcome) => {
                let (exit_code, timed_out, resource_limit) = match outcome.status {
                    RunStatus::Exited(code) => (Some(code), false, None),
                    RunStatus::Signaled(sig) => (Some(128 + sig), false, None),
                    RunStatus::TimedOut => (None, true, None),
                    RunStatus::ResourceLimitExceeded(kind) => (None, false, Some(kind)),
                };
                RunReport {
                    request_id: request.request_id.clone(),
                    success: outcome.is_success(),
                    exit_code,
                    timed_out,
                    resource_limit,
                    stdout: outcome.stdout.render(),
                    stderr: outcome.stderr.render(),
                    elapsed_ms: outcome.elapsed_ms(),
                    memory_kb: outcome.memory_kb,
                    compile_output: None,
                    error: None,
                }
            }
        };
        Ok(report)
    }

    fn resolve(
        &self,
        language: &str,
        allowed: Option<&[LanguageId]>,
    ) -> Result<LanguageId, EngineError> {
        let id = self.registry.resolve(language)?;
        match allowed {
            Some(allowed) if !allowed.contains(&id) => Err(EngineError::LanguageNotAllowed(id)),
            _ => Ok(id),
        }
    }

    fn validate_submission(&self, request: &ExecutionRequest) -> Result<(), EngineError> {
        if request.submission_id.trim().is_empty() {
            return Err(EngineError::InvalidRequest("submissionId is empty".into()));
        }
        self.validate_source(&request.code)?;
        if request.test_cases.len() > self.limits.max_test_cases {
            return Err(EngineError::InvalidRequest(format!(
                "{} test cases exceed the limit of {}",
                request.test_cases.len(),
                self.limits.max_test_cases
            )));
        }
        for (index, case) in request.test_cases.iter().enumerate() {
            self.validate_input(&case.input, &format!("test case {} input", index))?;
        }
        if let Some(limits) = &request.limits {
            if limits.time_ms == 0 || limits.memory_mb == 0 {
                return Err(EngineError::InvalidRequest(
                    "limits must be greater than zero".into(),
                ));
            }
        }
        Ok(())
    }

    fn validate_source(&self, code: &str) -> Result<(), EngineError> {
        if code.trim().is_empty() {
            return Err(EngineError::InvalidRequest("code is empty".into()));
        }
        if code.len() > self.limits.max_source_bytes {
            return Err(EngineError::InvalidRequest(format!(
                "code is {} bytes, limit is {}",
                code.len(),
                self.limits.max_source_bytes
            )));
        }
        Ok(())
    }

    fn validate_input(&self, input: &str, what: &str) -> Result<(), EngineError> {
        if input.len() > self.limits.max_input_bytes {
            return Err(EngineError::InvalidRequest(format!(
                "{} is {} bytes, limit is {}",
                what,
                input.len(),
                self.limits.max_input_bytes
            )));
        }
        Ok(())
    }
}

/// Trimmed exact comparison
pub fn outputs_match(actual: &str, expected: &str) -> bool {
    actual.trim() == expected.trim()
}

/// Classify one finished run
fn judge_case(index: usize, case: &TestCase, outcome: &RunOutcome) -> ExecutionOutcome {
    let (status, resource) = case_status(outcome, &case.expected_output);
    ExecutionOutcome {
        index,
        status,
        hidden: case.is_hidden,
        input: case.input.clone(),
        expected_output: case.expected_output.clone(),
        stdout: outcome.stdout.render(),
        stderr: outcome.stderr.render(),
        elapsed_ms: outcome.elapsed_ms(),
        memory_kb: Some(outcome.memory_kb),
        resource,
    }
}

fn case_status(outcome: &RunOutcome, expected: &str) -> (CaseStatus, Option<ResourceKind>) {
    match outcome.status {
        RunStatus::Exited(0) => {
            // A truncated stream is not the program's full output
            let passed = !outcome.stdout.is_truncated()
                && outputs_match(&outcome.stdout.text(), expected);
            let status = if passed {
                CaseStatus::Passed
            } else {
                CaseStatus::Failed
            };
            (status, None)
        }
        RunStatus::Exited(_) | RunStatus::Signaled(_) => (CaseStatus::RuntimeError, None),
        RunStatus::TimedOut => (CaseStatus::TimedOut, None),
        RunStatus::ResourceLimitExceeded(ResourceKind::Cpu) => {
            (CaseStatus::TimedOut, Some(ResourceKind::Cpu))
        }
        RunStatus::ResourceLimitExceeded(kind) => (CaseStatus::ResourceLimitExceeded, Some(kind)),
    }
}

/// Human-readable label for logs
pub fn describe(profile: &LanguageProfile) -> String {
    if profile.requires_compilation() {
        format!("{} (compiled)", profile.id)
    } else {
        format!("{} (interpreted)", profile.id)
    }
}
