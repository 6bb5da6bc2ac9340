mod config;
mod shell;

use clap::{Parser, Subcommand, ValueEnum};
use conductor_pool::GlobalResourcePool;
use conductor_scheduler::{
    BackgroundExecutor, ExecutionConfig, LogAttribution, ResourceLimits, ResourceMonitor,
    TaskOutcome, TaskPayload, TaskPriority,
};
use config::ConductorConfig;
use shell::ShellJob;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conductor", about = "Conductor: admission-controlled background task runner")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml")]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Show host resources, admission thresholds and global slot usage
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Run shell commands as background tasks and wait for them
    Run {
        /// Priority for every submitted command
        #[arg(short, long, default_value = "normal")]
        priority: TaskPriority,
        /// Per-command time limit in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Commands, one task each
        #[arg(required = true, last = true)]
        commands: Vec<String>,
    },
    /// Run a command while holding an end-to-end slot
    E2e {
        /// Identity the slot is held under
        #[arg(long)]
        orchestrator_id: Option<String>,
        /// Command to run
        #[arg(required = true, last = true)]
        command: Vec<String>,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = ConductorConfig::load(&cli.config).await?;
    let monitor = Arc::new(ResourceMonitor::new(config.monitor.clone())?);
    let pool = GlobalResourcePool::new(config.pool.clone())?;

    match cli.command {
        Commands::Status { json } => {
            let resources = monitor.get_current_resources();
            if json {
                let status = serde_json::json!({
                    "resources": resources,
                    "thresholds": monitor.thresholds(),
                    "pool": pool.get_status(),
                });
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                let thresholds = monitor.thresholds();
                println!(
                    "CPU:    {:.1}% of {} cores (limit {:.1}%)",
                    resources.cpu.usage_percent, resources.cpu.cores, thresholds.max_cpu_percent
                );
                println!(
                    "Memory: {}MB used, {}MB available of {}MB (limit {}MB)",
                    resources.memory.used_mb,
                    resources.memory.available_mb,
                    resources.memory.total_mb,
                    thresholds.max_memory_mb
                );
                println!(
                    "Agents: {} of {} background slots",
                    resources.active_background_agents, thresholds.max_background_agents
                );
                println!();
                print!("{}", pool.generate_report());
            }
        }
        Commands::Run {
            priority,
            timeout_ms,
            commands,
        } => {
            pool.start_stale_sweep();
            let executor = BackgroundExecutor::builder(config.executor, monitor)
                .with_resource_pool(pool.clone())
                .with_attribution(Arc::new(LogAttribution))
                .build()?;

            let mut execution = ExecutionConfig::default().with_priority(priority);
            if let Some(ms) = timeout_ms {
                execution = execution
                    .with_resource_limits(ResourceLimits::default().with_max_duration_ms(ms as f64));
            }

            let mut submitted = Vec::with_capacity(commands.len());
            for command in &commands {
                let payload = TaskPayload::from_job(Arc::new(ShellJob::new(command.clone())));
                let task_id = executor.execute_task(payload, execution.clone())?;
                submitted.push((task_id, command));
            }
            info!(count = submitted.len(), priority = %priority, "Commands submitted");

            let mut failures = 0;
            let waited = async {
                let mut outcomes = Vec::with_capacity(submitted.len());
                for (task_id, command) in &submitted {
                    outcomes.push((*task_id, *command, executor.wait_for_task(*task_id).await));
                }
                outcomes
            };
            let outcomes = tokio::select! {
                outcomes = waited => outcomes,
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted; shutting down");
                    executor.shutdown().await;
                    pool.cleanup();
                    anyhow::bail!("interrupted");
                }
            };

            for (task_id, command, outcome) in outcomes {
                let outcome = outcome?;
                if !matches!(outcome, TaskOutcome::Completed { .. }) {
                    failures += 1;
                }
                let line = serde_json::json!({
                    "task_id": task_id,
                    "command": command,
                    "outcome": outcome,
                });
                println!("{line}");
            }

            executor.shutdown().await;
            pool.cleanup();
            if failures > 0 {
                anyhow::bail!("{failures} of {} command(s) did not complete", submitted.len());
            }
        }
        Commands::E2e {
            orchestrator_id,
            command,
        } => {
            let Some((program, args)) = command.split_first() else {
                anyhow::bail!("no end-to-end command given");
            };
            let orchestrator_id =
                orchestrator_id.unwrap_or_else(|| config.executor.orchestrator_id.clone());
            // Reclaims slots left behind by crashed holders while we wait.
            pool.start_stale_sweep();
            let slot = pool.acquire_e2e_slot(&orchestrator_id).await?;
            info!(
                orchestrator_id = %slot.orchestrator_id,
                "Holding end-to-end slot"
            );

            // The slot record lives on disk, so release it on every path.
            let run = async {
                let executor = BackgroundExecutor::builder(config.executor, monitor)
                    .with_resource_pool(pool.clone())
                    .build()?;
                let job = ShellJob::from_argv(program.clone(), args.iter().cloned());
                let task_id = executor.execute_task(
                    TaskPayload::from_job(Arc::new(job)),
                    ExecutionConfig::default().with_priority(TaskPriority::High),
                )?;
                let outcome = executor.wait_for_task(task_id).await;
                executor.shutdown().await;
                anyhow::Ok(outcome?)
            };
            let outcome = run.await;
            pool.release_e2e_slot(&orchestrator_id);
            pool.cleanup();

            let outcome = outcome?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if !matches!(outcome, TaskOutcome::Completed { .. }) {
                anyhow::bail!("end-to-end command did not complete");
            }
        }
    }

    Ok(())
}
