//! Assignment grader: compiles and runs untrusted student code in sandboxes
//! and grades it against instructor test cases.

pub mod compiler;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod executor;
pub mod grading;
pub mod jobs;
pub mod judger;
pub mod languages;
pub mod redis_manager;
pub mod runner;
pub mod sandbox;
pub mod scheduler;

#[cfg(test)]
mod test_support;

pub use config::EngineConfig;
pub use crate::core::{CaseStatus, ExecutionRequest, RunRequest, SubmissionStatus, TestCase};
pub use engine::Engine;
pub use error::{EngineError, LaunchError, OverloadReason};
pub use grading::{FacultyReport, SubmissionReport, SubmissionResponse};
pub use languages::{LanguageId, LanguageRegistry};
pub use scheduler::{Occupancy, Scheduler};
