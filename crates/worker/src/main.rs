use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use swarm_core::{
    AuthClient, Config, HttpJsonExecutor, MockExecutor, RequestExecutor, SwarmController,
    SwarmError, SwarmStats, SwarmSummary,
};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "worker")]
#[command(about = "Leaderboard API load worker - runs a swarm of virtual users")]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config/example.local.toml")]
    config: PathBuf,

    /// Execution mode: mock or http
    #[arg(long, default_value = "mock")]
    mode: String,

    /// Target base URL (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Number of virtual users (overrides config)
    #[arg(long)]
    users: Option<u32>,

    /// Users started per second (overrides config)
    #[arg(long)]
    spawn_rate: Option<f64>,

    /// Run duration in milliseconds (overrides config)
    #[arg(long)]
    run_time_ms: Option<u64>,

    /// Print stats every N milliseconds
    #[arg(long, default_value = "1000")]
    print_every_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct WorkerResult {
    timestamp: String,
    mode: String,
    host: String,
    target_population: u32,
    seed: Option<u64>,
    abandoned: usize,
    failed: bool,
    summary: SwarmSummary,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration after CLI overrides")?;

    info!(
        "Starting swarm of {} users against {} in {} mode",
        config.swarm.target_population, config.target.host_base_url, args.mode
    );
    info!("Seed: {:?}", config.scenario.seed);
    info!(
        "Pacing: {}-{}ms, spawn rate: {}/s",
        config.pacing.min_wait_ms, config.pacing.max_wait_ms, config.swarm.spawn_rate
    );

    let (executor, auth): (Arc<dyn RequestExecutor>, Arc<dyn AuthClient>) =
        match args.mode.as_str() {
            "mock" => {
                let mock = Arc::new(MockExecutor::new(5)); // 5ms simulated latency
                let executor: Arc<dyn RequestExecutor> = mock.clone();
                let auth: Arc<dyn AuthClient> = mock;
                (executor, auth)
            }
            "http" => {
                let http = Arc::new(
                    HttpJsonExecutor::new(&config.target.host_base_url, config.target.timeout_ms)
                        .context("Failed to create HTTP executor")?,
                );
                let executor: Arc<dyn RequestExecutor> = http.clone();
                let auth: Arc<dyn AuthClient> = http;
                (executor, auth)
            }
            _ => anyhow::bail!("Invalid mode: {}, must be 'mock' or 'http'", args.mode),
        };

    info!("Using executor: {}", executor.name());

    let mut swarm = SwarmController::from_config(&config, executor, auth)?;
    let stats = swarm.stats();
    let progress = tokio::spawn(print_progress(stats.clone(), args.print_every_ms));

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let outcome = swarm
        .run(
            config.swarm.target_population,
            config.run_duration(),
            config.swarm.grace_period(),
            shutdown,
        )
        .await;
    progress.abort();

    let (summary, abandoned, failure) = match outcome {
        Ok(outcome) => (outcome.summary, outcome.abandoned, None),
        Err(e @ SwarmError::AllSetupsFailed { .. }) => {
            let summary = stats.summary();
            let abandoned = summary.users.abandoned as usize;
            (summary, abandoned, Some(e))
        }
        Err(e) => return Err(e.into()),
    };

    let result = WorkerResult {
        timestamp: chrono::Utc::now().to_rfc3339(),
        mode: args.mode.clone(),
        host: config.target.host_base_url.clone(),
        target_population: config.swarm.target_population,
        seed: config.scenario.seed,
        abandoned,
        failed: failure.is_some(),
        summary,
    };

    // Write results to file
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let output_path = format!("results/swarm_{}.json", timestamp);

    std::fs::create_dir_all("results").ok();
    let result_json = serde_json::to_string_pretty(&result)?;
    std::fs::write(&output_path, result_json)?;

    info!("Results written to {}", output_path);
    print_summary(&result);

    match failure {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(host) = &args.host {
        config.target.host_base_url = host.clone();
    }
    if let Some(users) = args.users {
        config.swarm.target_population = users;
    }
    if let Some(rate) = args.spawn_rate {
        config.swarm.spawn_rate = rate;
    }
    if let Some(run_time_ms) = args.run_time_ms {
        config.scenario.run_duration_ms = Some(run_time_ms);
    }
}

async fn print_progress(stats: Arc<SwarmStats>, print_every_ms: u64) {
    let mut ticker = tokio::time::interval(Duration::from_millis(print_every_ms.max(1)));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let summary = stats.summary();
        let elapsed_s = summary.duration_ms / 1000;
        let rps = if elapsed_s > 0 {
            summary.total_task_executions / elapsed_s
        } else {
            0
        };

        info!(
            "Progress: users={}/{} running executions={} failures={} setup_failures={} rps={}",
            summary.users.active,
            summary.users.spawned,
            summary.total_task_executions,
            summary.total_task_failures,
            summary.users.setup_failures,
            rps
        );
    }
}

fn print_summary(result: &WorkerResult) {
    let summary = &result.summary;
    println!("\n=== Swarm Summary ({} mode) ===", result.mode);
    println!("Host: {}", result.host);
    println!("Duration: {}ms", summary.duration_ms);
    println!(
        "Users: spawned={} running={} stopped={} abandoned={}",
        summary.users.spawned,
        summary.users.reached_running,
        summary.users.stopped,
        summary.users.abandoned
    );
    println!(
        "Setup failures: {} ({:.1}%)",
        summary.users.setup_failures,
        summary.setup_failure_ratio() * 100.0
    );
    println!("State inconsistencies: {}", summary.state_inconsistencies);
    println!("Task executions: {}", summary.total_task_executions);
    println!("Task failures: {}", summary.total_task_failures);
    println!();
    println!(
        "{:<22} {:>8} {:>8} {:>6} {:>6} {:>6} {:>8} {:>6} {:>6} {:>6}",
        "name", "execs", "ok", "4xx", "5xx", "net", "skipped", "p50", "p95", "p99"
    );
    for row in summary.setup.iter().chain(summary.tasks.iter()) {
        println!(
            "{:<22} {:>8} {:>8} {:>6} {:>6} {:>6} {:>8} {:>6} {:>6} {:>6}",
            row.name,
            row.executions,
            row.success,
            row.client_error,
            row.server_error,
            row.network_error,
            row.skipped,
            row.latency_p50_ms,
            row.latency_p95_ms,
            row.latency_p99_ms
        );
    }
    println!();
}
