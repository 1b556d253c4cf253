//! Requests accepted by the engine (camelCase on the wire)

use serde::{Deserialize, Serialize};

use crate::languages::LanguageId;
use crate::runner::RunLimits;

/// One test case of an assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub input: String,
    pub expected_output: String,
    /// Hidden cases never reveal input, expected output or program output to the student
    #[serde(default)]
    pub is_hidden: bool,
}

impl TestCase {
    pub fn visible(input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            expected_output: expected_output.into(),
            is_hidden: false,
        }
    }

    pub fn hidden(input: impl Into<String>, expected_output: impl Into<String>) -> Self {
        Self {
            is_hidden: true,
            ..Self::visible(input, expected_output)
        }
    }
}

/// A submission to grade. Consumed once; the engine keeps no copy of the code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub submission_id: String,
    /// Submitting user, for per-user budgets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub code: String,
    /// Language name or alias, resolved by the language registry
    pub language: String,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    /// Wall-clock and memory limits per test case; language defaults otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<RunLimits>,
    /// Languages the assignment accepts; any loaded language when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_languages: Option<Vec<LanguageId>>,
}

impl ExecutionRequest {
    pub fn new(
        submission_id: impl Into<String>,
        language: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            submission_id: submission_id.into(),
            user_id: None,
            code: code.into(),
            language: language.into(),
            test_cases: Vec::new(),
            limits: None,
            allowed_languages: None,
        }
    }

    pub fn with_test_cases(mut self, test_cases: impl IntoIterator<Item = TestCase>) -> Self {
        self.test_cases = test_cases.into_iter().collect();
        self
    }

    pub fn with_limits(mut self, limits: RunLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Run code once against custom stdin ("run my code"), no grading
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub code: String,
    pub language: String,
    #[serde(default)]
    pub stdin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<RunLimits>,
}
