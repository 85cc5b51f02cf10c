use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::SwarmError;
use crate::executor::{AuthClient, RequestExecutor};
use crate::lifecycle::{LifecycleReport, SharedContext, VirtualUser};
use crate::pacing::PacingController;
use crate::ramp::SpawnRamp;
use crate::stats::{SwarmStats, SwarmSummary};
use crate::tasks::TaskCatalog;

#[derive(Debug, Clone)]
pub struct StopReport {
    /// Reports of lifecycles that reached `Stopped` within the grace period.
    pub reports: Vec<LifecycleReport>,
    /// Lifecycles aborted after the grace period ran out.
    pub abandoned: usize,
}

impl StopReport {
    pub fn stopped(&self) -> usize {
        self.reports.len()
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub summary: SwarmSummary,
    pub reports: Vec<LifecycleReport>,
    pub abandoned: usize,
}

/// Owns the population of virtual users and the stats sink they share.
pub struct SwarmController {
    ctx: SharedContext,
    ramp: SpawnRamp,
    seed: Option<u64>,
    cancel: CancellationToken,
    lifecycles: JoinSet<LifecycleReport>,
    next_id: u64,
}

impl SwarmController {
    pub fn new(ctx: SharedContext, ramp: SpawnRamp, seed: Option<u64>) -> Self {
        Self {
            ctx,
            ramp,
            seed,
            cancel: CancellationToken::new(),
            lifecycles: JoinSet::new(),
            next_id: 0,
        }
    }

    pub fn from_config(
        config: &Config,
        executor: Arc<dyn RequestExecutor>,
        auth: Arc<dyn AuthClient>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let ctx = SharedContext {
            catalog: Arc::new(TaskCatalog::from_config(&config.tasks)?),
            executor,
            auth,
            pacing: PacingController::from_config(&config.pacing)?,
            stats: Arc::new(SwarmStats::new()),
        };
        Ok(Self::new(
            ctx,
            SpawnRamp::new(config.swarm.spawn_rate),
            config.scenario.seed,
        ))
    }

    pub fn stats(&self) -> Arc<SwarmStats> {
        Arc::clone(&self.ctx.stats)
    }

    /// Lifecycles spawned and not yet joined.
    pub fn active(&self) -> usize {
        self.lifecycles.len()
    }

    /// Schedules `n` new virtual users and returns without waiting for their setup.
    /// Must be called from within a tokio runtime.
    pub fn spawn(&mut self, n: u32) {
        for idx in 0..n {
            let id = self.next_id;
            self.next_id += 1;

            let user = VirtualUser::new(id, self.ctx.clone(), self.seed, self.cancel.child_token())
                .with_start_delay(self.ramp.start_offset(idx));
            self.ctx.stats.record_spawned();
            self.lifecycles.spawn(user.run());
        }

        info!(
            "Scheduled {} virtual users at {} users/s ({} active)",
            n,
            self.ramp.rate(),
            self.lifecycles.len()
        );
    }

    /// Signals every lifecycle to stop and waits up to `grace` for them.
    /// Stragglers are aborted and counted as abandoned.
    pub async fn stop_all(&mut self, grace: Duration) -> StopReport {
        self.cancel.cancel();
        info!(
            "Stopping {} virtual users (grace {}ms)",
            self.lifecycles.len(),
            grace.as_millis()
        );

        let mut reports = Vec::new();
        let mut crashed = 0usize;
        let drained = timeout(grace, async {
            while let Some(joined) = self.lifecycles.join_next().await {
                match joined {
                    Ok(report) => reports.push(report),
                    Err(e) => {
                        warn!("Virtual user task failed: {}", e);
                        crashed += 1;
                    }
                }
            }
        })
        .await;

        let mut abandoned = 0usize;
        if drained.is_err() {
            self.lifecycles.abort_all();
            while let Some(joined) = self.lifecycles.join_next().await {
                match joined {
                    // Finished just before the abort landed.
                    Ok(report) => reports.push(report),
                    Err(e) if e.is_cancelled() => abandoned += 1,
                    Err(e) => {
                        warn!("Virtual user task failed: {}", e);
                        crashed += 1;
                    }
                }
            }
            if abandoned > 0 {
                warn!(
                    "{} virtual users ignored the stop signal for {}ms and were abandoned",
                    abandoned,
                    grace.as_millis()
                );
            }
        }
        abandoned += crashed;
        if abandoned > 0 {
            self.ctx.stats.record_abandoned(abandoned as u64);
        }

        // Later spawns get a fresh signal.
        self.cancel = CancellationToken::new();

        StopReport { reports, abandoned }
    }

    /// Spawns `population` users and lets them run until `run_duration` elapses,
    /// every user has stopped on its own, or `shutdown` resolves; then stops them all.
    ///
    /// Fails with [`SwarmError::AllSetupsFailed`] when no user got past setup and at
    /// least one failed it.
    pub async fn run<F>(
        &mut self,
        population: u32,
        run_duration: Option<Duration>,
        grace: Duration,
        shutdown: F,
    ) -> Result<RunOutcome, SwarmError>
    where
        F: Future<Output = ()>,
    {
        if population == 0 {
            return Err(SwarmError::InvalidConfig(
                "population must be at least 1".to_string(),
            ));
        }

        let deadline = async {
            match run_duration {
                Some(duration) => sleep(duration).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);
        tokio::pin!(shutdown);

        self.spawn(population);

        let mut reports = Vec::new();
        let mut crashed = 0usize;
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    info!("Run duration elapsed");
                    break;
                }
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                joined = self.lifecycles.join_next() => match joined {
                    Some(Ok(report)) => reports.push(report),
                    Some(Err(e)) => {
                        warn!("Virtual user task failed: {}", e);
                        crashed += 1;
                    }
                    None => {
                        info!("All virtual users have stopped");
                        break;
                    }
                },
            }
        }
        if crashed > 0 {
            self.ctx.stats.record_abandoned(crashed as u64);
        }

        let stop = self.stop_all(grace).await;
        reports.extend(stop.reports);

        let summary = self.ctx.stats.summary();
        let spawned = summary.users.spawned;
        let failed = summary.users.setup_failures;
        // Users cancelled before or during setup neither passed nor failed it.
        if summary.users.reached_running == 0 && failed > 0 {
            warn!("Every attempted setup failed; is the target reachable?");
            return Err(SwarmError::AllSetupsFailed { spawned, failed });
        }

        info!(
            "Swarm finished: {} users, {} task executions, {} failures, {} abandoned",
            spawned,
            summary.total_task_executions,
            summary.total_task_failures,
            summary.users.abandoned
        );

        Ok(RunOutcome {
            summary,
            reports,
            abandoned: stop.abandoned + crashed,
        })
    }
}
