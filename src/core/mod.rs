pub mod request;
pub mod verdict;

pub use request::{ExecutionRequest, RunRequest, TestCase};
pub use verdict::{CaseStatus, SubmissionStatus};
