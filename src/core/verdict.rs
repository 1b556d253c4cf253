use serde::{Deserialize, Serialize};
use std::fmt;

/// Verdict for a single test case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaseStatus {
    Passed,
    Failed,
    TimedOut,
    RuntimeError,
    CompileError,
    ResourceLimitExceeded,
}

impl CaseStatus {
    pub fn is_passed(&self) -> bool {
        matches!(self, CaseStatus::Passed)
    }
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CaseStatus::Passed => "passed",
            CaseStatus::Failed => "failed",
            CaseStatus::TimedOut => "timed_out",
            CaseStatus::RuntimeError => "runtime_error",
            CaseStatus::CompileError => "compile_error",
            CaseStatus::ResourceLimitExceeded => "resource_limit_exceeded",
        };
        write!(f, "{}", s)
    }
}

/// Overall status of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmissionStatus {
    /// Every test case was executed
    Completed,
    /// Compilation failed; no test case was executed
    CompileError,
    /// The request carried no test cases
    NoTestCases,
    /// The scheduler refused the request; retry with backoff
    Overloaded,
    /// The sandbox could not be launched (host problem)
    SystemError,
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubmissionStatus::Completed => "completed",
            SubmissionStatus::CompileError => "compile_error",
            SubmissionStatus::NoTestCases => "no_test_cases",
            SubmissionStatus::Overloaded => "overloaded",
            SubmissionStatus::SystemError => "system_error",
        };
        write!(f, "{}", s)
    }
}
