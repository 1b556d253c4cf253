//! Grading aggregator
//!
//! Turns per-case outcomes into a `SubmissionReport` and renders its two views:
//! the student view, where hidden cases carry only their status, and the
//! faculty view with full per-case detail. Everything here is pure.

use serde::{Deserialize, Serialize};

use crate::core::{CaseStatus, SubmissionStatus, TestCase};
use crate::error::OverloadReason;
use crate::languages::LanguageId;
use crate::runner::ResourceKind;

/// Outcome of one test case, in full detail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    /// Position of the case in the request
    pub index: usize,
    pub status: CaseStatus,
    pub hidden: bool,
    pub input: String,
    pub expected_output: String,
    /// Captured stdout, truncated with a marker
    pub stdout: String,
    /// Captured stderr, truncated with a marker
    pub stderr: String,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_kb: Option<u64>,
    /// Which ceiling was hit, for `ResourceLimitExceeded`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceKind>,
}

impl ExecutionOutcome {
    /// Outcome for a case that never ran because compilation failed
    pub fn compile_error(index: usize, case: &TestCase) -> Self {
        Self {
            index,
            status: CaseStatus::CompileError,
            hidden: case.is_hidden,
            input: case.input.clone(),
            expected_output: case.expected_output.clone(),
            stdout: String::new(),
            stderr: String::new(),
            elapsed_ms: 0,
            memory_kb: None,
            resource: None,
        }
    }
}

/// Result of grading one submission
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionReport {
    pub submission_id: String,
    pub language: LanguageId,
    pub status: SubmissionStatus,
    /// In request order
    pub outcomes: Vec<ExecutionOutcome>,
    pub passed: usize,
    pub total: usize,
    pub grade: f64,
    /// The single compile diagnostic, when compilation failed
    pub compile_output: Option<String>,
}

/// `round(100 * passed / total, 2)`; 0 when there are no test cases
pub fn grade(passed: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let passed = passed.min(total) as f64;
    let raw = (passed * 10_000.0 / total as f64).round() / 100.0;
    raw.clamp(0.0, 100.0)
}

/// Build the report from outcomes (already in request order)
pub fn aggregate(
    submission_id: impl Into<String>,
    language: LanguageId,
    outcomes: Vec<ExecutionOutcome>,
) -> SubmissionReport {
    let total = outcomes.len();
    let passed = outcomes.iter().filter(|o| o.status.is_passed()).count();
    let status = if total == 0 {
        SubmissionStatus::NoTestCases
    } else {
        SubmissionStatus::Completed
    };

    SubmissionReport {
        submission_id: submission_id.into(),
        language,
        status,
        outcomes,
        passed,
        total,
        grade: grade(passed, total),
        compile_output: None,
    }
}

/// Report for a submission that did not compile: every case fails with
/// `CompileError` and the diagnostic is carried once
pub fn compile_failure(
    submission_id: impl Into<String>,
    language: LanguageId,
    cases: &[TestCase],
    diagnostic: impl Into<String>,
) -> SubmissionReport {
    let outcomes = cases
        .iter()
        .enumerate()
        .map(|(index, case)| ExecutionOutcome::compile_error(index, case))
        .collect::<Vec<_>>();

    SubmissionReport {
        submission_id: submission_id.into(),
        language,
        status: SubmissionStatus::CompileError,
        total: outcomes.len(),
        outcomes,
        passed: 0,
        grade: 0.0,
        compile_output: Some(diagnostic.into()),
    }
}

/// Per-case entry of the student view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentCase {
    pub index: usize,
    pub status: CaseStatus,
    pub hidden: bool,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

/// What the submission-handling collaborator returns to the student
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResponse {
    pub submission_id: String,
    pub status: SubmissionStatus,
    pub passed_tests: usize,
    pub total_tests: usize,
    pub grade: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile_output: Option<String>,
    pub per_case: Vec<StudentCase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overload_reason: Option<OverloadReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubmissionResponse {
    /// The scheduler refused the request; the caller should retry with backoff
    pub fn overloaded(submission_id: impl Into<String>, reason: OverloadReason) -> Self {
        Self {
            overload_reason: Some(reason),
            ..Self::empty(submission_id, SubmissionStatus::Overloaded)
        }
    }

    /// The engine could not grade the request (host problem or invalid request)
    pub fn system_error(submission_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::empty(submission_id, SubmissionStatus::SystemError)
        }
    }

    fn empty(submission_id: impl Into<String>, status: SubmissionStatus) -> Self {
        Self {
            submission_id: submission_id.into(),
            status,
            passed_tests: 0,
            total_tests: 0,
            grade: 0.0,
            compile_output: None,
            per_case: Vec::new(),
            overload_reason: None,
            error: None,
        }
    }
}

/// Full report for faculty
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacultyReport {
    pub submission_id: String,
    pub language: LanguageId,
    pub status: SubmissionStatus,
    pub passed_tests: usize,
    pub total_tests: usize,
    pub grade: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile_output: Option<String>,
    pub per_case: Vec<ExecutionOutcome>,
}

impl SubmissionReport {
    /// Student view: hidden cases expose only status and timing
    pub fn student_view(&self) -> SubmissionResponse {
        let per_case = self
            .outcomes
            .iter()
            .map(|outcome| {
                let reveal = |value: &String| (!outcome.hidden).then(|| value.clone());
                StudentCase {
                    index: outcome.index,
                    status: outcome.status,
                    hidden: outcome.hidden,
                    elapsed_ms: outcome.elapsed_ms,
                    input: reveal(&outcome.input),
                    expected_output: reveal(&outcome.expected_output),
                    stdout: reveal(&outcome.stdout),
                    stderr: reveal(&outcome.stderr),
                }
            })
            .collect();

        SubmissionResponse {
            submission_id: self.submission_id.clone(),
            status: self.status,
            passed_tests: self.passed,
            total_tests: self.total,
            grade: self.grade,
            compile_output: self.compile_output.clone(),
            per_case,
            overload_reason: None,
            error: None,
        }
    }

    /// Faculty view: every case in full
    pub fn faculty_view(&self) -> FacultyReport {
        FacultyReport {
            submission_id: self.submission_id.clone(),
            language: self.language,
            status: self.status,
            passed_tests: self.passed,
            total_tests: self.total,
            grade: self.grade,
            compile_output: self.compile_output.clone(),
            per_case: self.outcomes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(index: usize, status: CaseStatus, hidden: bool) -> ExecutionOutcome {
        ExecutionOutcome {
            index,
            status,
            hidden,
            input: format!("input-{}", index),
            expected_output: format!("expected-{}", index),
            stdout: format!("stdout-{}", index),
            stderr: String::new(),
            elapsed_ms: 3,
            memory_kb: Some(1024),
            resource: None,
        }
    }

    #[test]
    fn test_grade_rounding() {
        assert_eq!(grade(1, 3), 33.33);
        assert_eq!(grade(2, 3), 66.67);
        assert_eq!(grade(3, 3), 100.0);
        assert_eq!(grade(0, 7), 0.0);
        assert_eq!(grade(1, 8), 12.5);
    }

    #[test]
    fn test_grade_is_bounded() {
        for total in 0..40 {
            for passed in 0..=total + 2 {
                let g = grade(passed, total);
                assert!((0.0..=100.0).contains(&g), "grade({passed}, {total}) = {g}");
            }
        }
    }

    #[test]
    fn test_no_test_cases() {
        let report = aggregate("s1", LanguageId::Python, vec![]);
        assert_eq!(report.status, SubmissionStatus::NoTestCases);
        assert_eq!(report.grade, 0.0);
        assert_eq!((report.passed, report.total), (0, 0));
    }

    #[test]
    fn test_aggregate_counts() {
        let report = aggregate(
            "s1",
            LanguageId::Cpp,
            vec![
                outcome(0, CaseStatus::Passed, false),
                outcome(1, CaseStatus::TimedOut, false),
                outcome(2, CaseStatus::Passed, true),
                outcome(3, CaseStatus::Failed, true),
            ],
        );
        assert_eq!(report.status, SubmissionStatus::Completed);
        assert_eq!((report.passed, report.total), (2, 4));
        assert_eq!(report.grade, 50.0);
    }

    #[test]
    fn test_compile_failure_marks_every_case() {
        let cases = vec![TestCase::visible("1", "1"), TestCase::hidden("2", "2")];
        let report = compile_failure("s2", LanguageId::C, &cases, "main.c:1: error");

        assert_eq!(report.status, SubmissionStatus::CompileError);
        assert_eq!((report.passed, report.total), (0, 2));
        assert_eq!(report.grade, 0.0);
        assert!(report
            .outcomes
            .iter()
            .all(|o| o.status == CaseStatus::CompileError));
        assert_eq!(report.compile_output.as_deref(), Some("main.c:1: error"));
    }

    #[test]
    fn test_student_view_redacts_hidden_cases() {
        let report = aggregate(
            "s3",
            LanguageId::Python,
            vec![
                outcome(0, CaseStatus::Passed, false),
                outcome(1, CaseStatus::Failed, true),
            ],
        );

        let view = report.student_view();
        assert_eq!(view.per_case[0].input.as_deref(), Some("input-0"));
        assert_eq!(view.per_case[0].stdout.as_deref(), Some("stdout-0"));

        let hidden = &view.per_case[1];
        assert!(hidden.hidden);
        assert_eq!(hidden.status, CaseStatus::Failed);
        assert!(hidden.input.is_none());
        assert!(hidden.expected_output.is_none());
        assert!(hidden.stdout.is_none());
        assert!(hidden.stderr.is_none());

        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("input-1"));
        assert!(!json.contains("expected-1"));
        assert!(json.contains("\"passedTests\":1"));
        assert!(json.contains("\"status\":\"Completed\""));
    }

    #[test]
    fn test_faculty_view_is_complete() {
        let report = aggregate(
            "s4",
            LanguageId::Java,
            vec![outcome(0, CaseStatus::Failed, true)],
        );
        let view = report.faculty_view();
        assert_eq!(view.per_case[0].input, "input-0");
        assert_eq!(view.per_case[0].expected_output, "expected-0");

        let json = serde_json::to_string(&view).unwrap();
        assert!(json.contains("expected-0"));
        assert!(json.contains("\"language\":\"java\""));
    }

    #[test]
    fn test_overloaded_response() {
        let response = SubmissionResponse::overloaded("s5", OverloadReason::QueueFull);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "Overloaded");
        assert_eq!(json["overloadReason"], "queue_full");
        assert_eq!(json["totalTests"], 0);
    }
}
