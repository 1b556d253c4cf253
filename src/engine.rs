//! Engine - wires the registry, sandbox, evaluator and scheduler together
//!
//! This is the entry point for embedders: build it once from an
//! `EngineConfig`, then submit requests from any number of tasks.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::core::{ExecutionRequest, RunRequest};
use crate::error::EngineError;
use crate::executor::{Executor, StatsSnapshot};
use crate::grading::{SubmissionReport, SubmissionResponse};
use crate::judger::{Evaluator, RunReport};
use crate::languages::{LanguageId, LanguageRegistry};
use crate::runner::SandboxedRunner;
use crate::sandbox::{resolve_isolation, Isolation};
use crate::scheduler::{Occupancy, Scheduler};

pub struct Engine {
    registry: Arc<LanguageRegistry>,
    executor: Arc<Executor>,
    scheduler: Scheduler,
    isolation: Isolation,
}

impl Engine {
    /// Probe the host, load language profiles and start the worker pools
    pub async fn from_config(config: EngineConfig) -> Result<Self> {
        let isolation = resolve_isolation(&config.sandbox)
            .await
            .context("Failed to select a sandbox isolation backend")?;

        let mut registry = match &config.languages_config {
            Some(path) => LanguageRegistry::from_path(path)?,
            None => LanguageRegistry::builtin()?,
        };
        drop_unreachable_languages(&mut registry, &isolation, &config.sandbox.path_env);
        if registry.supported().is_empty() {
            error!("No language toolchain is reachable inside the sandbox");
        }
        info!("Languages: {:?}", registry.supported());

        std::fs::create_dir_all(&config.sandbox.scratch_root).with_context(|| {
            format!(
                "Failed to create sandbox root {}",
                config.sandbox.scratch_root.display()
            )
        })?;

        Ok(Self::with_parts(Arc::new(registry), isolation, config))
    }

    /// Assemble an engine from an already loaded registry and isolation backend
    pub fn with_parts(
        registry: Arc<LanguageRegistry>,
        isolation: Isolation,
        config: EngineConfig,
    ) -> Self {
        let runner = SandboxedRunner::from_config(isolation.clone(), &config.sandbox);
        let executor = Arc::new(Executor::new(
            Arc::new(runner),
            config.sandbox.clone(),
            config.scheduler.sandbox_slots,
        ));
        let evaluator = Evaluator::new(
            Arc::clone(&registry),
            Arc::clone(&executor),
            config.scheduler.evaluator_limits(),
        );
        let scheduler = Scheduler::new(Arc::new(evaluator), config.scheduler);

        Self {
            registry,
            executor,
            scheduler,
            isolation,
        }
    }

    pub async fn submit(&self, request: ExecutionRequest) -> Result<SubmissionReport, EngineError> {
        self.scheduler.submit(request).await
    }

    /// Grade and render the student view; failures become error responses
    pub async fn submit_for_student(&self, request: ExecutionRequest) -> SubmissionResponse {
        let submission_id = request.submission_id.clone();
        respond(&submission_id, self.submit(request).await)
    }

    pub async fn run_custom(&self, request: RunRequest) -> Result<RunReport, EngineError> {
        self.scheduler.run_custom(request).await
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn occupancy(&self) -> Occupancy {
        self.scheduler.occupancy()
    }

    pub fn is_saturated(&self) -> bool {
        self.scheduler.is_saturated()
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }

    pub fn isolation(&self) -> &Isolation {
        &self.isolation
    }

    pub fn languages(&self) -> Vec<LanguageId> {
        self.registry.supported()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.executor.stats()
    }
}

/// Remove profiles whose compiler or interpreter cannot be executed inside the
/// sandbox, so a missing toolchain never shows up as a student's compile or
/// runtime error
pub fn drop_unreachable_languages(
    registry: &mut LanguageRegistry,
    isolation: &Isolation,
    path_env: &str,
) -> Vec<LanguageId> {
    registry.retain(|profile| {
        match profile
            .toolchain()
            .into_iter()
            .find(|program| isolation.locate(program, path_env).is_none())
        {
            Some(missing) => {
                warn!(
                    "Disabling {}: {} is not available inside the {} sandbox",
                    profile.id, missing, isolation
                );
                false
            }
            None => true,
        }
    })
}

/// Student-facing response for a grading result
pub fn respond(
    submission_id: &str,
    result: Result<SubmissionReport, EngineError>,
) -> SubmissionResponse {
    match result {
        Ok(report) => report.student_view(),
        Err(EngineError::Overloaded(reason)) => SubmissionResponse::overloaded(submission_id, reason),
        Err(e) => SubmissionResponse::system_error(submission_id, e.to_string()),
    }
}
