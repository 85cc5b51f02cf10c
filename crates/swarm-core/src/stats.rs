use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::SetupStep;
use crate::executor::StatusCategory;
use crate::tasks::TaskKind;

/// 1ms buckets; anything slower lands in the last bucket.
const LATENCY_BUCKETS: usize = 10_001;

/// Integer-millisecond latency histogram.
#[derive(Debug, Clone)]
pub struct LatencyHistogram {
    buckets: Vec<u64>,
    max_ms: u64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self {
            buckets: vec![0; LATENCY_BUCKETS],
            max_ms: 0,
        }
    }

    pub fn record(&mut self, latency: Duration) {
        let latency_ms = latency.as_millis() as u64;
        let bucket_idx = latency_ms.min((self.buckets.len() - 1) as u64) as usize;
        self.buckets[bucket_idx] += 1;
        self.max_ms = self.max_ms.max(latency_ms);
    }

    pub fn count(&self) -> u64 {
        self.buckets.iter().sum()
    }

    pub fn max_ms(&self) -> u64 {
        self.max_ms
    }

    /// Smallest bucket covering `p` percent of samples (integer ms).
    pub fn percentile(&self, p: u64) -> u64 {
        let total = self.count();
        if total == 0 {
            return 0;
        }

        let target = (total * p).div_ceil(100).max(1);
        let mut cumulative = 0u64;

        for (bucket_idx, &count) in self.buckets.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return bucket_idx as u64;
            }
        }

        (self.buckets.len() - 1) as u64
    }
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters for one named request kind (an in-loop task or a setup step).
#[derive(Debug, Default)]
pub struct RequestStats {
    executions: AtomicU64,
    success: AtomicU64,
    client_error: AtomicU64,
    server_error: AtomicU64,
    network_error: AtomicU64,
    skipped: AtomicU64,
    latency: Mutex<LatencyHistogram>,
}

impl RequestStats {
    pub fn record(&self, status: StatusCategory, latency: Duration) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        let counter = match status {
            StatusCategory::Success => &self.success,
            StatusCategory::ClientError => &self.client_error,
            StatusCategory::ServerError => &self.server_error,
            StatusCategory::NetworkError => &self.network_error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(latency);
    }

    /// An execution that issued no request (no-op task or `stop`).
    pub fn record_skipped(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.client_error.load(Ordering::Relaxed)
            + self.server_error.load(Ordering::Relaxed)
            + self.network_error.load(Ordering::Relaxed)
    }

    fn summary(&self, name: &str) -> RequestSummary {
        let latency = self
            .latency
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        RequestSummary {
            name: name.to_string(),
            executions: self.executions(),
            success: self.success.load(Ordering::Relaxed),
            client_error: self.client_error.load(Ordering::Relaxed),
            server_error: self.server_error.load(Ordering::Relaxed),
            network_error: self.network_error.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            latency_p50_ms: latency.percentile(50),
            latency_p95_ms: latency.percentile(95),
            latency_p99_ms: latency.percentile(99),
            latency_max_ms: latency.max_ms(),
        }
    }
}

/// Aggregate statistics shared by every lifecycle of a swarm.
///
/// Counters are atomics. Each latency histogram has its own mutex, held for a
/// single bucket increment or for the copy taken by `summary`.
#[derive(Debug)]
pub struct SwarmStats {
    tasks: [RequestStats; TaskKind::COUNT],
    setup: [RequestStats; SetupStep::COUNT],
    setup_failures: [AtomicU64; SetupStep::COUNT],
    state_inconsistencies: AtomicU64,
    abandoned: AtomicU64,
    spawned: AtomicU64,
    reached_running: AtomicU64,
    stopped: AtomicU64,
    start_time: Instant,
}

impl SwarmStats {
    pub fn new() -> Self {
        Self {
            tasks: Default::default(),
            setup: Default::default(),
            setup_failures: Default::default(),
            state_inconsistencies: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
            spawned: AtomicU64::new(0),
            reached_running: AtomicU64::new(0),
            stopped: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn task(&self, kind: TaskKind) -> &RequestStats {
        &self.tasks[kind.index()]
    }

    pub fn setup(&self, step: SetupStep) -> &RequestStats {
        &self.setup[step.index()]
    }

    pub fn record_setup_failure(&self, step: SetupStep) {
        self.setup_failures[step.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_state_inconsistency(&self) {
        self.state_inconsistencies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abandoned(&self, count: u64) {
        self.abandoned.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_spawned(&self) {
        self.spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_running(&self) {
        self.reached_running.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stopped(&self) {
        self.stopped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn spawned(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    pub fn setup_failures(&self) -> u64 {
        self.setup_failures
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn summary(&self) -> SwarmSummary {
        let tasks: Vec<RequestSummary> = TaskKind::ALL
            .iter()
            .map(|kind| self.task(*kind).summary(kind.name()))
            .collect();
        let setup: Vec<RequestSummary> = SetupStep::ALL
            .iter()
            .map(|step| self.setup(*step).summary(step.name()))
            .collect();

        let spawned = self.spawned();
        let stopped = self.stopped.load(Ordering::Relaxed);
        let abandoned = self.abandoned.load(Ordering::Relaxed);
        let reached_running = self.reached_running.load(Ordering::Relaxed);

        SwarmSummary {
            duration_ms: self.elapsed_ms(),
            users: UserSummary {
                spawned,
                reached_running,
                stopped,
                abandoned,
                active: spawned.saturating_sub(stopped + abandoned),
                setup_failures: self.setup_failures(),
                setup_failures_by_step: SetupStep::ALL
                    .iter()
                    .map(|step| {
                        (
                            step.name().to_string(),
                            self.setup_failures[step.index()].load(Ordering::Relaxed),
                        )
                    })
                    .collect(),
            },
            total_task_executions: tasks.iter().map(|t| t.executions).sum(),
            total_task_failures: tasks
                .iter()
                .map(|t| t.client_error + t.server_error + t.network_error)
                .sum(),
            state_inconsistencies: self.state_inconsistencies.load(Ordering::Relaxed),
            tasks,
            setup,
        }
    }
}

impl Default for SwarmStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestSummary {
    pub name: String,
    pub executions: u64,
    pub success: u64,
    pub client_error: u64,
    pub server_error: u64,
    pub network_error: u64,
    pub skipped: u64,
    pub latency_p50_ms: u64,
    pub latency_p95_ms: u64,
    pub latency_p99_ms: u64,
    pub latency_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub spawned: u64,
    pub reached_running: u64,
    pub stopped: u64,
    pub abandoned: u64,
    pub active: u64,
    pub setup_failures: u64,
    pub setup_failures_by_step: Vec<(String, u64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmSummary {
    pub duration_ms: u64,
    pub users: UserSummary,
    pub total_task_executions: u64,
    pub total_task_failures: u64,
    pub state_inconsistencies: u64,
    pub tasks: Vec<RequestSummary>,
    pub setup: Vec<RequestSummary>,
}

impl SwarmSummary {
    /// Fraction of spawned users whose setup failed, 0.0 when none were spawned.
    pub fn setup_failure_ratio(&self) -> f64 {
        if self.users.spawned == 0 {
            return 0.0;
        }
        self.users.setup_failures as f64 / self.users.spawned as f64
    }

    pub fn task(&self, name: &str) -> Option<&RequestSummary> {
        self.tasks.iter().find(|t| t.name == name)
    }
}
