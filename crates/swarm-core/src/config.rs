use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub scenario: ScenarioConfig,
    pub swarm: SwarmConfig,
    pub pacing: PacingConfig,
    pub target: TargetConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.swarm.target_population == 0 {
            anyhow::bail!("swarm.target_population must be at least 1");
        }
        if !self.swarm.spawn_rate.is_finite() || self.swarm.spawn_rate <= 0.0 {
            anyhow::bail!(
                "swarm.spawn_rate must be a positive number (got {})",
                self.swarm.spawn_rate
            );
        }
        if self.pacing.min_wait_ms == 0 {
            anyhow::bail!("pacing.min_wait_ms must be positive");
        }
        if self.pacing.min_wait_ms > self.pacing.max_wait_ms {
            anyhow::bail!(
                "pacing.min_wait_ms ({}) exceeds pacing.max_wait_ms ({})",
                self.pacing.min_wait_ms,
                self.pacing.max_wait_ms
            );
        }
        if self.target.host_base_url.trim().is_empty() {
            anyhow::bail!("target.host_base_url must not be empty");
        }
        self.tasks.validate()
    }

    pub fn run_duration(&self) -> Option<Duration> {
        self.scenario.run_duration_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioConfig {
    /// Base seed for per-user RNGs (user `i` uses `seed + i`); entropy when absent
    pub seed: Option<u64>,
    /// Optional run duration cap in milliseconds; unbounded when absent
    pub run_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Number of virtual users to run
    pub target_population: u32,
    /// Users started per second
    pub spawn_rate: f64,
    /// How long stop_all waits for lifecycles before abandoning them
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
}

impl SwarmConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

fn default_grace_period_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacingConfig {
    pub min_wait_ms: u64,
    pub max_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Base URL of the leaderboard service, e.g. "http://localhost:5000"
    pub host_base_url: String,
    /// Request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    5_000
}

/// When delete-row drops the id from the user's known set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// As soon as the DELETE is issued, whatever the response.
    #[default]
    Optimistic,
    /// Only after the DELETE came back with a success status.
    OnSuccess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub create_row: u32,
    pub list_rows_paginated: u32,
    pub get_row: u32,
    pub update_row: u32,
    pub delete_row: u32,
    pub stop: u32,
    pub page_offset: u32,
    pub page_limit: u32,
    pub delete_policy: DeletePolicy,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            create_row: 4,
            list_rows_paginated: 3,
            get_row: 3,
            update_row: 2,
            delete_row: 2,
            stop: 1,
            page_offset: 0,
            page_limit: 5,
            delete_policy: DeletePolicy::Optimistic,
        }
    }
}

impl TaskConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let weights = [
            ("create_row", self.create_row),
            ("list_rows_paginated", self.list_rows_paginated),
            ("get_row", self.get_row),
            ("update_row", self.update_row),
            ("delete_row", self.delete_row),
            ("stop", self.stop),
        ];
        for (name, weight) in weights {
            if weight == 0 {
                anyhow::bail!("tasks.{name} weight must be positive");
            }
        }
        if let Some((name, weight)) = weights[..5].iter().find(|(_, w)| *w <= self.stop) {
            anyhow::bail!(
                "tasks.stop weight ({}) must be lower than tasks.{} ({})",
                self.stop,
                name,
                weight
            );
        }
        let total: u64 = weights.iter().map(|(_, w)| u64::from(*w)).sum();
        if total > u64::from(u32::MAX) {
            anyhow::bail!("task weights sum to {total}, above the limit of {}", u32::MAX);
        }
        if self.page_limit == 0 {
            anyhow::bail!("tasks.page_limit must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
[scenario]
seed = 42
run_duration_ms = 10000

[swarm]
target_population = 50
spawn_rate = 10.0

[pacing]
min_wait_ms = 3000
max_wait_ms = 5000

[target]
host_base_url = "http://localhost:5000"

[tasks]
delete_row = 5
delete_policy = "on_success"
    "#;

    #[test]
    fn test_config_serde() {
        let config: Config = toml::from_str(EXAMPLE).unwrap();
        assert_eq!(config.scenario.seed, Some(42));
        assert_eq!(config.run_duration(), Some(Duration::from_secs(10)));
        assert_eq!(config.swarm.target_population, 50);
        assert_eq!(config.swarm.grace_period_ms, 5_000);
        assert_eq!(config.pacing.min_wait_ms, 3000);
        assert_eq!(config.target.timeout_ms, 5_000);
        assert_eq!(config.tasks.delete_row, 5);
        assert_eq!(config.tasks.create_row, 4);
        assert_eq!(config.tasks.delete_policy, DeletePolicy::OnSuccess);
        config.validate().unwrap();
    }

    #[test]
    fn test_missing_tasks_table_uses_defaults() {
        let config_str = r#"
[swarm]
target_population = 1
spawn_rate = 1.0

[pacing]
min_wait_ms = 10
max_wait_ms = 10

[target]
host_base_url = "http://localhost:5000"
        "#;
        let config: Config = toml::from_str(config_str).unwrap();
        assert!(config.scenario.seed.is_none());
        assert!(config.run_duration().is_none());
        assert_eq!(config.tasks.page_limit, 5);
        assert_eq!(config.tasks.delete_policy, DeletePolicy::Optimistic);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_inverted_pacing() {
        let mut config: Config = toml::from_str(EXAMPLE).unwrap();
        config.pacing.min_wait_ms = 6000;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("exceeds"), "{err}");
    }

    #[test]
    fn test_validate_rejects_stop_not_lowest() {
        let mut config: Config = toml::from_str(EXAMPLE).unwrap();
        config.tasks.stop = 2;
        assert!(config.validate().is_err());

        config.tasks.stop = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_weights_summing_past_u32() {
        let mut config: Config = toml::from_str(EXAMPLE).unwrap();
        config.tasks.create_row = u32::MAX;
        config.tasks.list_rows_paginated = u32::MAX;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("sum"), "{err}");

        config.tasks = TaskConfig {
            create_row: u32::MAX - 10,
            ..TaskConfig::default()
        };
        assert!(config.validate().is_err());
        config.tasks.create_row = u32::MAX - 11;
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_bad_spawn_rate() {
        let mut config: Config = toml::from_str(EXAMPLE).unwrap();
        config.swarm.spawn_rate = 0.0;
        assert!(config.validate().is_err());
        config.swarm.spawn_rate = f64::NAN;
        assert!(config.validate().is_err());
    }
}
