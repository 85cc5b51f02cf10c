//! One virtual user, driven from creation to stop.
//!
//! A [`VirtualUser`] owns its [`VirtualUserState`] and RNG outright and runs as a
//! single tokio task. It waits out its spawn offset, runs setup (register, login,
//! seed row), then loops: pick an eligible task, execute it, record the outcome,
//! pace. Every suspension point races the user's [`CancellationToken`].

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AuthError, SetupFailure, SetupStep};
use crate::executor::{AuthClient, ExecOutcome, RequestExecutor, RequestSpec, StatusCategory};
use crate::pacing::PacingController;
use crate::stats::SwarmStats;
use crate::tasks::{TaskCatalog, TaskKind, TaskPlan};
use crate::user::VirtualUserState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The swarm's stop signal arrived.
    Cancelled,
    /// The user drew the `stop` task.
    StopTask,
    SetupFailed,
}

#[derive(Debug, Clone)]
pub struct LifecycleReport {
    pub user_id: u64,
    pub client_id: String,
    pub phase: LifecyclePhase,
    pub reached_running: bool,
    pub tasks_executed: u64,
    pub tasks_failed: u64,
    pub stop_reason: StopReason,
    pub setup_failure: Option<SetupFailure>,
}

/// Collaborators shared read-only (or via the thread-safe stats sink) by every user.
#[derive(Clone)]
pub struct SharedContext {
    pub catalog: Arc<TaskCatalog>,
    pub executor: Arc<dyn RequestExecutor>,
    pub auth: Arc<dyn AuthClient>,
    pub pacing: PacingController,
    pub stats: Arc<SwarmStats>,
}

enum SetupAbort {
    Failed(SetupFailure),
    Cancelled,
}

enum Step {
    Continue,
    Stop,
    Cancelled,
}

pub struct VirtualUser {
    id: u64,
    ctx: SharedContext,
    state: VirtualUserState,
    rng: StdRng,
    cancel: CancellationToken,
    start_delay: Duration,
    phase: LifecyclePhase,
    reached_running: bool,
    tasks_executed: u64,
    tasks_failed: u64,
}

impl VirtualUser {
    /// With a `seed`, the user's RNG is seeded with `seed + id`.
    pub fn new(id: u64, ctx: SharedContext, seed: Option<u64>, cancel: CancellationToken) -> Self {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(id)),
            None => StdRng::from_entropy(),
        };
        let state = VirtualUserState::new(&mut rng);
        Self {
            id,
            ctx,
            state,
            rng,
            cancel,
            start_delay: Duration::ZERO,
            phase: LifecyclePhase::Created,
            reached_running: false,
            tasks_executed: 0,
            tasks_failed: 0,
        }
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    pub fn state(&self) -> &VirtualUserState {
        &self.state
    }

    pub async fn run(mut self) -> LifecycleReport {
        if !self.start_delay.is_zero() {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return self.finish(StopReason::Cancelled, None),
                _ = sleep(self.start_delay) => {}
            }
        }

        self.set_phase(LifecyclePhase::Starting);
        match self.setup().await {
            Ok(()) => {}
            Err(SetupAbort::Cancelled) => return self.finish(StopReason::Cancelled, None),
            Err(SetupAbort::Failed(failure)) => {
                warn!("User {}: {}", self.id, failure);
                self.ctx.stats.record_setup_failure(failure.step);
                return self.finish(StopReason::SetupFailed, Some(failure));
            }
        }

        self.set_phase(LifecyclePhase::Running);
        self.reached_running = true;
        self.ctx.stats.record_running();

        let reason = self.run_tasks().await;
        self.set_phase(LifecyclePhase::Stopping);
        self.finish(reason, None)
    }

    async fn setup(&mut self) -> Result<(), SetupAbort> {
        let stats = Arc::clone(&self.ctx.stats);

        let start = Instant::now();
        let auth = self.ctx.auth.register(self.state.credentials());
        let registered = cancellable(&self.cancel, auth)
            .await
            .ok_or(SetupAbort::Cancelled)?;
        stats
            .setup(SetupStep::Register)
            .record(auth_status(&registered), start.elapsed());
        registered.map_err(|e| setup_failed(SetupStep::Register, e))?;

        let start = Instant::now();
        let auth = self.ctx.auth.login(self.state.credentials());
        let token = cancellable(&self.cancel, auth)
            .await
            .ok_or(SetupAbort::Cancelled)?;
        stats
            .setup(SetupStep::Login)
            .record(auth_status(&token), start.elapsed());
        let token = token.map_err(|e| setup_failed(SetupStep::Login, e))?;
        if let Err(e) = self.state.set_auth_token(token) {
            stats.record_state_inconsistency();
            warn!("User {}: {}", self.id, e);
        }

        let plan = self
            .ctx
            .catalog
            .plan(TaskKind::CreateRow, &mut self.state, &mut self.rng)
            .map_err(|e| setup_failed(SetupStep::SeedRow, e))?;
        let TaskPlan::Request { request, .. } = plan else {
            return Err(setup_failed(SetupStep::SeedRow, "create-row issued no request"));
        };
        let outcome = self.execute(&request).await.ok_or(SetupAbort::Cancelled)?;
        stats
            .setup(SetupStep::SeedRow)
            .record(outcome.status, outcome.latency);
        if !outcome.status.is_success() {
            return Err(setup_failed(
                SetupStep::SeedRow,
                format!("{} {} returned {:?}", request.method, request.name, outcome.status),
            ));
        }

        debug!(
            "User {} ({}) ready with {} known ids",
            self.id,
            self.state.client_id(),
            self.state.known_ids().len()
        );
        Ok(())
    }

    async fn run_tasks(&mut self) -> StopReason {
        loop {
            if self.cancel.is_cancelled() {
                return StopReason::Cancelled;
            }

            let kind = self.ctx.catalog.select(&self.state, &mut self.rng);
            match self.perform(kind).await {
                Step::Continue => {}
                Step::Stop => return StopReason::StopTask,
                Step::Cancelled => return StopReason::Cancelled,
            }

            let wait = self.ctx.pacing.next_wait(&mut self.rng);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return StopReason::Cancelled,
                _ = sleep(wait) => {}
            }
        }
    }

    /// Runs one task and records it. Failures are recorded, never returned.
    async fn perform(&mut self, kind: TaskKind) -> Step {
        let stats = Arc::clone(&self.ctx.stats);
        let catalog = Arc::clone(&self.ctx.catalog);
        let task_stats = stats.task(kind);

        let planned = catalog.plan(kind, &mut self.state, &mut self.rng);
        let (request, forget_on_success) = match planned {
            Ok(TaskPlan::Request {
                request,
                forget_on_success,
            }) => (request, forget_on_success),
            Ok(TaskPlan::Stop) => {
                task_stats.record_skipped();
                self.tasks_executed += 1;
                debug!("User {} drew the stop task", self.id);
                return Step::Stop;
            }
            Ok(TaskPlan::Skip) => {
                task_stats.record_skipped();
                self.tasks_executed += 1;
                return Step::Continue;
            }
            Err(e) => {
                stats.record_state_inconsistency();
                task_stats.record_skipped();
                self.tasks_executed += 1;
                warn!("User {}: {} during {}", self.id, e, kind);
                return Step::Continue;
            }
        };

        let Some(outcome) = self.execute(&request).await else {
            return Step::Cancelled;
        };
        task_stats.record(outcome.status, outcome.latency);
        self.tasks_executed += 1;

        if !outcome.status.is_success() {
            self.tasks_failed += 1;
            debug!(
                "User {}: {} {} -> {:?}",
                self.id, request.method, request.name, outcome.status
            );
        } else if let Some(id) = forget_on_success {
            if let Err(e) = self.state.forget(id) {
                stats.record_state_inconsistency();
                warn!("User {}: {} after delete", self.id, e);
            }
        }
        Step::Continue
    }

    /// `None` when cancelled mid-flight. Executor errors count as network errors.
    async fn execute(&self, request: &RequestSpec) -> Option<ExecOutcome> {
        let start = Instant::now();
        match cancellable(&self.cancel, self.ctx.executor.execute(request)).await? {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!("User {}: executor failed on {}: {}", self.id, request.name, e);
                Some(ExecOutcome {
                    status: StatusCategory::NetworkError,
                    latency: start.elapsed(),
                })
            }
        }
    }

    fn set_phase(&mut self, phase: LifecyclePhase) {
        debug!("User {}: {:?} -> {:?}", self.id, self.phase, phase);
        self.phase = phase;
    }

    fn finish(
        mut self,
        reason: StopReason,
        setup_failure: Option<SetupFailure>,
    ) -> LifecycleReport {
        self.set_phase(LifecyclePhase::Stopped);
        self.ctx.stats.record_stopped();
        LifecycleReport {
            user_id: self.id,
            client_id: self.state.client_id().to_string(),
            phase: self.phase,
            reached_running: self.reached_running,
            tasks_executed: self.tasks_executed,
            tasks_failed: self.tasks_failed,
            stop_reason: reason,
            setup_failure,
        }
    }
}

async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

fn auth_status<T>(result: &Result<T, AuthError>) -> StatusCategory {
    match result {
        Ok(_) => StatusCategory::Success,
        Err(AuthError::Rejected(status)) => StatusCategory::from_status(*status),
        Err(AuthError::Transport(_)) => StatusCategory::NetworkError,
        Err(AuthError::MissingToken) => StatusCategory::ServerError,
    }
}

fn setup_failed(step: SetupStep, reason: impl ToString) -> SetupAbort {
    SetupAbort::Failed(SetupFailure {
        step,
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeletePolicy, TaskConfig};
    use crate::executor::MockExecutor;

    fn context(mock: Arc<MockExecutor>, tasks: TaskConfig) -> SharedContext {
        SharedContext {
            catalog: Arc::new(TaskCatalog::from_config(&tasks).unwrap()),
            executor: mock.clone(),
            auth: mock,
            pacing: PacingController::new(Duration::from_millis(100), Duration::from_millis(200))
                .unwrap(),
            stats: Arc::new(SwarmStats::new()),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_then_run_until_cancelled() {
        let mock = Arc::new(MockExecutor::new(5));
        let tasks = TaskConfig {
            create_row: 1_000,
            ..TaskConfig::default()
        };
        let ctx = context(mock.clone(), tasks);
        let cancel = CancellationToken::new();
        let user = VirtualUser::new(1, ctx.clone(), Some(11), cancel.clone());
        assert_eq!(user.phase(), LifecyclePhase::Created);

        let handle = tokio::spawn(user.run());
        sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        let report = handle.await.unwrap();

        assert_eq!(report.phase, LifecyclePhase::Stopped);
        assert!(report.reached_running);
        assert!(report.setup_failure.is_none());
        assert!(report.tasks_executed >= 1);
        assert_eq!(mock.auth_calls(), 2);

        let summary = ctx.stats.summary();
        assert_eq!(summary.total_task_executions, report.tasks_executed);
        assert_eq!(summary.users.reached_running, 1);
        assert_eq!(summary.users.stopped, 1);
        assert_eq!(summary.setup[2].success, 1, "seed row recorded under setup");
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_down_fails_setup_at_register() {
        let mock = Arc::new(MockExecutor::new(1).with_status(StatusCategory::NetworkError));
        let ctx = context(mock.clone(), TaskConfig::default());
        let report = VirtualUser::new(2, ctx.clone(), Some(1), CancellationToken::new())
            .run()
            .await;

        assert_eq!(report.stop_reason, StopReason::SetupFailed);
        assert!(!report.reached_running);
        assert_eq!(report.tasks_executed, 0);
        assert_eq!(report.setup_failure.unwrap().step, SetupStep::Register);
        assert_eq!(mock.calls(), 0);

        let summary = ctx.stats.summary();
        assert_eq!(summary.users.setup_failures, 1);
        assert_eq!(summary.setup[0].network_error, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_do_not_stop_the_loop() {
        let mock = Arc::new(MockExecutor::new(1));
        let ctx = context(mock, TaskConfig::default());
        let cancel = CancellationToken::new();
        let mut user = VirtualUser::new(3, ctx.clone(), Some(5), cancel.clone());

        user.setup().await.ok().unwrap();
        // Swap in a failing executor after setup.
        user.ctx.executor = Arc::new(MockExecutor::new(1).with_status(StatusCategory::ServerError));
        let tasks = TaskConfig {
            create_row: 10_000,
            ..TaskConfig::default()
        };
        user.ctx.catalog = Arc::new(TaskCatalog::from_config(&tasks).unwrap());

        let handle = tokio::spawn(async move {
            let reason = user.run_tasks().await;
            (reason, user.tasks_executed, user.tasks_failed)
        });
        sleep(Duration::from_secs(3)).await;
        cancel.cancel();
        let (reason, executed, failed) = handle.await.unwrap();

        assert_eq!(reason, StopReason::Cancelled);
        assert!(executed > 5, "loop should keep going, executed {executed}");
        assert!(failed > 0);
        assert!(ctx.stats.summary().total_task_failures > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_in_flight_request() {
        let mock = Arc::new(MockExecutor::new(60_000));
        let ctx = context(mock, TaskConfig::default());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(VirtualUser::new(4, ctx, None, cancel.clone()).run());

        sleep(Duration::from_millis(10)).await;
        let before = Instant::now();
        cancel.cancel();
        let report = handle.await.unwrap();

        assert!(before.elapsed() < Duration::from_secs(1));
        assert_eq!(report.stop_reason, StopReason::Cancelled);
        assert!(!report.reached_running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_start_delay_skips_setup() {
        let mock = Arc::new(MockExecutor::new(1));
        let ctx = context(mock.clone(), TaskConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = VirtualUser::new(5, ctx, None, cancel)
            .with_start_delay(Duration::from_secs(30))
            .run()
            .await;
        assert_eq!(report.stop_reason, StopReason::Cancelled);
        assert_eq!(mock.auth_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_task_ends_lifecycle() {
        let mock = Arc::new(MockExecutor::new(1));
        let tasks = TaskConfig {
            create_row: 2,
            list_rows_paginated: 2,
            get_row: 2,
            update_row: 2,
            delete_row: 2,
            stop: 1,
            ..TaskConfig::default()
        };
        let ctx = context(mock, tasks);
        let report = VirtualUser::new(6, ctx.clone(), Some(77), CancellationToken::new())
            .run()
            .await;

        assert_eq!(report.stop_reason, StopReason::StopTask);
        assert!(report.reached_running);
        assert_eq!(ctx.stats.summary().task("stop").unwrap().executions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_success_delete_keeps_id_when_delete_fails() {
        let mock = Arc::new(MockExecutor::new(1));
        let tasks = TaskConfig {
            delete_policy: DeletePolicy::OnSuccess,
            ..TaskConfig::default()
        };
        let ctx = context(mock, tasks);
        let mut user = VirtualUser::new(7, ctx, Some(8), CancellationToken::new());
        user.setup().await.ok().unwrap();
        let seeded = *user.state().known_ids().iter().next().unwrap();
        assert_eq!(user.state().known_ids().len(), 1);

        user.ctx.executor = Arc::new(MockExecutor::new(1).with_status(StatusCategory::ClientError));
        assert!(matches!(user.perform(TaskKind::DeleteRow).await, Step::Continue));
        assert!(user.state().contains(seeded));
        assert_eq!(user.tasks_failed, 1);

        user.ctx.executor = Arc::new(MockExecutor::new(1));
        user.perform(TaskKind::DeleteRow).await;
        assert!(!user.state().contains(seeded));
        assert_eq!(user.ctx.stats.summary().task("delete-row").unwrap().executions, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimistic_delete_drops_id_even_on_failure() {
        let mock = Arc::new(MockExecutor::new(1));
        let ctx = context(mock, TaskConfig::default());
        let mut user = VirtualUser::new(8, ctx, Some(9), CancellationToken::new());
        user.setup().await.ok().unwrap();
        let seeded = *user.state().known_ids().iter().next().unwrap();

        user.ctx.executor = Arc::new(MockExecutor::new(1).with_status(StatusCategory::ServerError));
        user.perform(TaskKind::DeleteRow).await;
        assert!(!user.state().contains(seeded));
        assert!(!user.state().has_known_ids());

        // Nothing left to act on: id-bound tasks degrade to no-ops.
        user.perform(TaskKind::GetRow).await;
        let summary = user.ctx.stats.summary();
        assert_eq!(summary.task("get-row").unwrap().skipped, 1);
        assert_eq!(summary.state_inconsistencies, 0);
    }
}
