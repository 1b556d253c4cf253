//! Execution scheduler
//!
//! Admission control in front of the evaluator: a FIFO pool of workers with a
//! bounded wait queue, per-user in-flight and rate budgets, and cancellation
//! that reaches every sandbox a submission started.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::config::EnvReader;
use crate::core::{ExecutionRequest, RunRequest};
use crate::error::{EngineError, OverloadReason};
use crate::grading::SubmissionReport;
use crate::judger::{Evaluator, EvaluatorLimits, RunReport};

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Submissions evaluated at once
    pub workers: usize,
    /// Submissions allowed to wait for a worker
    pub queue_capacity: usize,
    /// Sandboxed processes alive at once, across all submissions
    pub sandbox_slots: usize,
    /// Test cases of one submission in flight at once
    pub per_submission_parallelism: usize,
    pub user_max_in_flight: usize,
    /// Admissions per user within `user_rate_window`
    pub user_rate_limit: usize,
    pub user_rate_window: Duration,
    pub max_test_cases: usize,
    pub max_source_bytes: usize,
    pub max_input_bytes: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let evaluator = EvaluatorLimits::default();
        Self {
            workers: cores,
            queue_capacity: 64,
            sandbox_slots: cores * 2,
            per_submission_parallelism: evaluator.per_submission_parallelism,
            user_max_in_flight: 2,
            user_rate_limit: 10,
            user_rate_window: Duration::from_secs(10),
            max_test_cases: evaluator.max_test_cases,
            max_source_bytes: evaluator.max_source_bytes,
            max_input_bytes: evaluator.max_input_bytes,
        }
    }
}

impl SchedulerConfig {
    pub(crate) fn from_reader(env: &EnvReader<'_>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            workers: env.parse("GRADER_WORKERS", defaults.workers)?.max(1),
            queue_capacity: env.parse("GRADER_QUEUE_CAPACITY", defaults.queue_capacity)?,
            sandbox_slots: env.parse("GRADER_SANDBOX_SLOTS", defaults.sandbox_slots)?.max(1),
            per_submission_parallelism: env
                .parse(
                    "GRADER_PER_SUBMISSION_PARALLELISM",
                    defaults.per_submission_parallelism,
                )?
                .max(1),
            user_max_in_flight: env
                .parse("GRADER_USER_MAX_IN_FLIGHT", defaults.user_max_in_flight)?,
            user_rate_limit: env.parse("GRADER_USER_RATE_LIMIT", defaults.user_rate_limit)?,
            user_rate_window: Duration::from_secs(env.parse(
                "GRADER_USER_RATE_WINDOW_SECS",
                defaults.user_rate_window.as_secs(),
            )?),
            max_test_cases: env.parse("GRADER_MAX_TEST_CASES", defaults.max_test_cases)?,
            max_source_bytes: env.parse("GRADER_MAX_SOURCE_BYTES", defaults.max_source_bytes)?,
            max_input_bytes: env.parse("GRADER_MAX_INPUT_BYTES", defaults.max_input_bytes)?,
        })
    }

    pub fn evaluator_limits(&self) -> EvaluatorLimits {
        EvaluatorLimits {
            max_source_bytes: self.max_source_bytes,
            max_input_bytes: self.max_input_bytes,
            max_test_cases: self.max_test_cases,
            per_submission_parallelism: self.per_submission_parallelism,
        }
    }
}

/// Load snapshot of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Occupancy {
    /// Submissions holding a worker
    pub active: usize,
    /// Submissions waiting for a worker
    pub queued: usize,
    pub sandboxes_in_use: usize,
    pub sandbox_slots: usize,
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Occupancy {
    pub fn is_idle(&self) -> bool {
        self.active == 0 && self.queued == 0 && self.sandboxes_in_use == 0
    }
}

/// Holds one unit of a counter until dropped
struct Gauge<'a>(&'a AtomicUsize);

impl<'a> Gauge<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }

    /// Take one unit only while the counter is below `cap`
    fn try_enter(counter: &'a AtomicUsize, cap: usize) -> Option<Self> {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < cap).then_some(n + 1))
            .ok()
            .map(|_| Self(counter))
    }
}

impl Drop for Gauge<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct UserBudget {
    in_flight: usize,
    admitted: VecDeque<Instant>,
}

/// A user's admission; releases the in-flight unit on drop
struct UserGuard<'a> {
    users: &'a Mutex<HashMap<String, UserBudget>>,
    user: String,
    admitted_at: Instant,
    refund: bool,
}

impl UserGuard<'_> {
    /// The request never reached a worker; give back its rate budget too
    fn refund(mut self) {
        self.refund = true;
    }
}

impl Drop for UserGuard<'_> {
    fn drop(&mut self) {
        let mut users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(budget) = users.get_mut(&self.user) {
            budget.in_flight = budget.in_flight.saturating_sub(1);
            if self.refund {
                if let Some(pos) = budget.admitted.iter().rposition(|t| *t == self.admitted_at) {
                    budget.admitted.remove(pos);
                }
            }
        }
    }
}

/// Everything a request holds while it runs; dropping it releases them all
struct Admission<'a> {
    token: CancellationToken,
    _abandon: DropGuard,
    _user: Option<UserGuard<'a>>,
    _worker: OwnedSemaphorePermit,
    _active: Gauge<'a>,
}

pub struct Scheduler {
    evaluator: Arc<Evaluator>,
    config: SchedulerConfig,
    workers: Arc<Semaphore>,
    queued: AtomicUsize,
    active: AtomicUsize,
    users: Mutex<HashMap<String, UserBudget>>,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(evaluator: Arc<Evaluator>, config: SchedulerConfig) -> Self {
        let workers = config.workers.max(1);
        info!(
            "Scheduler: {} workers, queue capacity {}, {} cases per submission",
            workers, config.queue_capacity, config.per_submission_parallelism
        );
        Self {
            evaluator,
            workers: Arc::new(Semaphore::new(workers)),
            config: SchedulerConfig { workers, ..config },
            queued: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            users: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Grade a submission. Dropping the returned future cancels it.
    pub async fn submit(&self, request: ExecutionRequest) -> Result<SubmissionReport, EngineError> {
        self.submit_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Grade a submission; cancelling `cancel` kills its sandboxes
    pub async fn submit_with_cancel(
        &self,
        request: ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<SubmissionReport, EngineError> {
        let admission = self
            .admit(&request.submission_id, request.user_id.as_deref(), cancel)
            .await?;
        let token = admission.token.clone();

        let result = self
            .supervise(&token, cancel, self.evaluator.evaluate(&request, &token))
            .await;
        drop(admission);
        result
    }

    /// Run code against custom stdin under the same admission rules
    pub async fn run_custom(&self, request: RunRequest) -> Result<RunReport, EngineError> {
        let cancel = CancellationToken::new();
        let admission = self
            .admit(&request.request_id, request.user_id.as_deref(), &cancel)
            .await?;
        let token = admission.token.clone();

        let result = self
            .supervise(&token, &cancel, self.evaluator.run_custom(&request, &token))
            .await;
        drop(admission);
        result
    }

    pub fn occupancy(&self) -> Occupancy {
        let executor = self.evaluator.executor();
        Occupancy {
            active: self.active.load(Ordering::SeqCst),
            queued: self.queued.load(Ordering::SeqCst),
            sandboxes_in_use: executor.slots_in_use(),
            sandbox_slots: executor.slot_count(),
            workers: self.config.workers,
            queue_capacity: self.config.queue_capacity,
        }
    }

    /// No free worker and no room left in the queue
    pub fn is_saturated(&self) -> bool {
        self.workers.available_permits() == 0
            && self.queued.load(Ordering::SeqCst) >= self.config.queue_capacity
    }

    /// Cancel everything in flight and refuse new work
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Scheduler shutting down, {:?}", self.occupancy());
            self.shutdown.cancel();
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    async fn admit(
        &self,
        id: &str,
        user_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Admission<'_>, EngineError> {
        if self.shutdown.is_cancelled() {
            return Err(EngineError::ShuttingDown);
        }

        let user = match user_id {
            Some(user) => Some(self.admit_user(user)?),
            None => None,
        };

        let token = self.shutdown.child_token();
        let worker = match self.acquire_worker(&token, cancel).await {
            Ok(permit) => permit,
            Err(e) => {
                if let Some(user) = user {
                    user.refund();
                }
                if matches!(e, EngineError::Overloaded(_)) {
                    warn!("Request {} rejected: queue full", id);
                }
                return Err(e);
            }
        };

        debug!("Request {} admitted", id);
        Ok(Admission {
            _abandon: token.clone().drop_guard(),
            token,
            _user: user,
            _worker: worker,
            _active: Gauge::enter(&self.active),
        })
    }

    fn admit_user(&self, user: &str) -> Result<UserGuard<'_>, EngineError> {
        let now = Instant::now();
        let window = self.config.user_rate_window;
        let mut users = self.users.lock().unwrap_or_else(PoisonError::into_inner);

        for budget in users.values_mut() {
            while budget
                .admitted
                .front()
                .is_some_and(|t| now.duration_since(*t) >= window)
            {
                budget.admitted.pop_front();
            }
        }
        users.retain(|_, budget| budget.in_flight > 0 || !budget.admitted.is_empty());

        let budget = users.entry(user.to_string()).or_default();
        if budget.in_flight >= self.config.user_max_in_flight
            || budget.admitted.len() >= self.config.user_rate_limit
        {
            warn!(
                "User {} over budget ({} in flight, {} in window)",
                user,
                budget.in_flight,
                budget.admitted.len()
            );
            return Err(EngineError::Overloaded(OverloadReason::UserBudget));
        }

        budget.in_flight += 1;
        budget.admitted.push_back(now);
        Ok(UserGuard {
            users: &self.users,
            user: user.to_string(),
            admitted_at: now,
            refund: false,
        })
    }

    /// Take a worker, waiting in FIFO order when none is free
    async fn acquire_worker(
        &self,
        token: &CancellationToken,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, EngineError> {
        if let Ok(permit) = Arc::clone(&self.workers).try_acquire_owned() {
            return Ok(permit);
        }

        let _queued = Gauge::try_enter(&self.queued, self.config.queue_capacity)
            .ok_or(EngineError::Overloaded(OverloadReason::QueueFull))?;

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(EngineError::ShuttingDown),
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            permit = Arc::clone(&self.workers).acquire_owned() => {
                permit.map_err(|_| EngineError::ShuttingDown)
            }
        }
    }

    /// Drive `work` to completion; a caller cancellation is forwarded to the
    /// submission token so the work tears its sandboxes down before returning
    async fn supervise<T>(
        &self,
        token: &CancellationToken,
        cancel: &CancellationToken,
        work: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        tokio::pin!(work);
        let result = tokio::select! {
            biased;
            result = &mut work => result,
            _ = cancel.cancelled() => {
                token.cancel();
                work.await
            }
        };

        match result {
            Err(EngineError::Cancelled) if self.shutdown.is_cancelled() => {
                Err(EngineError::ShuttingDown)
            }
            other => other,
        }
    }
}
