//! Jobs consumed from the worker queue and the results written back

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::core::{ExecutionRequest, RunRequest};
use crate::engine::{respond, Engine};
use crate::error::EngineError;
use crate::grading::{FacultyReport, SubmissionResponse};
use crate::judger::RunReport;

/// Worker job enum - represents different types of jobs the worker can process
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "job_type")]
pub enum WorkerJob {
    /// Grade a submission against its test cases
    #[serde(rename = "grade")]
    Grade(ExecutionRequest),
    /// Run code once against custom stdin
    #[serde(rename = "run")]
    Run(RunRequest),
}

impl WorkerJob {
    pub fn id(&self) -> &str {
        match self {
            WorkerJob::Grade(request) => &request.submission_id,
            WorkerJob::Run(request) => &request.request_id,
        }
    }
}

/// Payload stored for a graded submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeResult {
    pub submission_id: String,
    /// Student view, safe to show as is
    pub response: SubmissionResponse,
    /// Full detail, absent when grading failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faculty: Option<FacultyReport>,
}

pub async fn process_grade_job(engine: &Engine, request: ExecutionRequest) -> GradeResult {
    let submission_id = request.submission_id.clone();
    info!(
        "Received grade job: submission_id={}, language={}, test_cases={}",
        submission_id,
        request.language,
        request.test_cases.len()
    );

    let result = engine.submit(request).await;
    let faculty = match &result {
        Ok(report) => Some(report.faculty_view()),
        Err(e) => {
            log_failure(&submission_id, e);
            None
        }
    };

    let response = respond(&submission_id, result);
    info!(
        "Grade job completed: submission_id={}, status={}, grade={:.2}",
        submission_id, response.status, response.grade
    );

    GradeResult {
        submission_id,
        response,
        faculty,
    }
}

pub async fn process_run_job(engine: &Engine, request: RunRequest) -> RunReport {
    let request_id = request.request_id.clone();
    match engine.run_custom(request).await {
        Ok(report) => report,
        Err(e) => {
            log_failure(&request_id, &e);
            RunReport::failed(request_id, e.to_string())
        }
    }
}

fn log_failure(id: &str, e: &EngineError) {
    match e {
        EngineError::Launch(_) => error!("Job {} failed: {}", id, e),
        _ => info!("Job {} not processed: {}", id, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::core::{SubmissionStatus, TestCase};
    use crate::sandbox::Isolation;
    use crate::scheduler::SchedulerConfig;
    use crate::test_support::{sh_registry, sh_sandbox_config};
    use std::path::Path;

    fn engine(root: &Path) -> Engine {
        let config = EngineConfig {
            sandbox: sh_sandbox_config(root),
            scheduler: SchedulerConfig {
                workers: 1,
                queue_capacity: 1,
                sandbox_slots: 2,
                ..SchedulerConfig::default()
            },
            languages_config: None,
        };
        Engine::with_parts(sh_registry(), Isolation::None, config)
    }

    #[test]
    fn test_parse_jobs() {
        let grade: WorkerJob = serde_json::from_str(
            r#"{
                "job_type": "grade",
                "submissionId": "42",
                "userId": "u7",
                "code": "print(1)",
                "language": "python",
                "testCases": [{"input": "", "expectedOutput": "1"}]
            }"#,
        )
        .unwrap();
        assert!(matches!(&grade, WorkerJob::Grade(r) if r.test_cases.len() == 1));
        assert_eq!(grade.id(), "42");

        let run: WorkerJob = serde_json::from_str(
            r#"{"job_type": "run", "requestId": "r9", "code": "x", "language": "c", "stdin": "1 2"}"#,
        )
        .unwrap();
        assert!(matches!(&run, WorkerJob::Run(r) if r.stdin == "1 2"));
        assert_eq!(run.id(), "r9");

        assert!(serde_json::from_str::<WorkerJob>(r#"{"job_type": "judge"}"#).is_err());
    }

    #[tokio::test]
    async fn test_grade_job_result() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());

        let request = ExecutionRequest::new("g1", "python", "read x; echo $x")
            .with_test_cases([TestCase::visible("3", "3"), TestCase::hidden("4", "5")]);
        let result = process_grade_job(&engine, request).await;

        assert_eq!(result.response.status, SubmissionStatus::Completed);
        assert_eq!(result.response.grade, 50.0);
        assert!(result.response.per_case[1].expected_output.is_none());
        let faculty = result.faculty.unwrap();
        assert_eq!(faculty.per_case[1].expected_output, "5");
    }

    #[tokio::test]
    async fn test_failed_grade_job_has_no_faculty_view() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());

        let request = ExecutionRequest::new("g2", "cobol", "DISPLAY 1")
            .with_test_cases([TestCase::visible("", "1")]);
        let result = process_grade_job(&engine, request).await;

        assert_eq!(result.response.status, SubmissionStatus::SystemError);
        assert!(result.response.error.is_some());
        assert!(result.faculty.is_none());
    }

    #[tokio::test]
    async fn test_run_job() {
        let root = tempfile::tempdir().unwrap();
        let engine = engine(root.path());

        let ok = process_run_job(
            &engine,
            RunRequest {
                request_id: "r1".into(),
                user_id: None,
                code: "cat".into(),
                language: "python".into(),
                stdin: "echo me".into(),
                limits: None,
            },
        )
        .await;
        assert!(ok.success);
        assert_eq!(ok.stdout, "echo me");

        let failed = process_run_job(
            &engine,
            RunRequest {
                request_id: "r2".into(),
                user_id: None,
                code: String::new(),
                language: "python".into(),
                stdin: String::new(),
                limits: None,
            },
        )
        .await;
        assert!(!failed.success);
        assert_eq!(failed.request_id, "r2");
        assert!(failed.error.unwrap().contains("code is empty"));
    }
}
