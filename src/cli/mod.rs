//! Command-line surface.
//!
//! The supervisor is the default command and reads everything from the
//! environment; `monitor` runs the health monitor standalone against the
//! same queues, and `status` prints a one-shot snapshot.

use clap::{Parser, Subcommand};
use console::style;
use tokio::sync::watch;

use crate::config::Settings;
use crate::monitor::HealthMonitor;
use crate::queue::QueueGateway;
use crate::supervisor::{Supervisor, EXIT_CLEAN};
use crate::worker::ExtractorRegistry;

#[derive(Parser)]
#[command(name = "registrex", version, about = "Quebec registry job extraction platform")]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the supervisor with the configured worker fleet (default).
    Run,
    /// Run the health monitor standalone.
    Monitor,
    /// Print queue depth and worker liveness per environment.
    Status,
}

/// Early verbosity probe used before the logger exists.
pub fn is_verbose() -> bool {
    std::env::args().any(|a| a == "-v" || a == "--verbose")
}

/// Parse arguments and dispatch. Returns the process exit code.
pub async fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();
    let settings = Settings::from_env();
    if cli.verbose {
        tracing::debug!(
            environments = settings.environments.len(),
            "configuration loaded"
        );
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            // Concrete registry-automation executors are wired in here by
            // deployments; none ship with the core.
            Supervisor::new(settings, ExtractorRegistry::new()).run().await
        }
        Commands::Monitor => cmd_monitor(settings).await,
        Commands::Status => cmd_status(settings),
    }
}

async fn cmd_monitor(settings: Settings) -> anyhow::Result<i32> {
    let gateway = QueueGateway::open(&settings.queue_configs())?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = HealthMonitor::new(gateway, settings.monitor_config(), shutdown_rx);
    let handle = tokio::spawn(monitor.run());

    tokio::signal::ctrl_c().await?;
    let _ = shutdown_tx.send(true);
    let _ = handle.await;
    Ok(EXIT_CLEAN)
}

fn cmd_status(settings: Settings) -> anyhow::Result<i32> {
    let gateway = QueueGateway::open(&settings.queue_configs())?;
    let dead = chrono::Duration::from_std(settings.dead_worker_threshold)
        .unwrap_or_else(|_| chrono::Duration::seconds(120));

    for (env, repo) in gateway.repositories() {
        let stats = repo.stats(dead)?;
        println!(
            "{} {} {}",
            style("●").cyan(),
            style(&env.name).bold(),
            if env.ocr_enabled { "(ocr enabled)" } else { "" }
        );
        println!(
            "    pending: {}  processing: {}  extraction_done: {}  ocr_processing: {}  ocr_done: {}  error: {}",
            stats.pending,
            stats.processing,
            stats.extraction_done,
            stats.ocr_processing,
            stats.ocr_done,
            style(stats.error).red()
        );
        println!("    active workers: {}", stats.active_workers);

        for worker in repo.list_workers()? {
            println!(
                "      {} {} [{}] completed={} failed={}",
                style("-").dim(),
                worker.id,
                worker.status.as_str(),
                worker.jobs_completed,
                worker.jobs_failed
            );
        }
    }

    Ok(EXIT_CLEAN)
}
