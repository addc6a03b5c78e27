//! Ouroboros Runtime
//!
//! Entry point: CLI args, bootstrapping, and orchestration of the
//! scheduler daemon. The runtime evolves itself; the operator mostly
//! watches.

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ouroboros::config::RuntimeConfig;
use ouroboros::runtime::Runtime;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Ouroboros -- Self-Evolving Agent Runtime
#[derive(Parser, Debug)]
#[command(
    name = "ouroboros",
    version = VERSION,
    about = "Ouroboros -- Self-Evolving Agent Runtime",
    long_about = "An autonomous runtime that diagnoses, plans, and rewrites its own tooling under a monetary budget."
)]
struct Cli {
    /// Start the runtime and its scheduler daemon
    #[arg(long)]
    run: bool,

    /// Show current runtime status
    #[arg(long)]
    status: bool,

    /// Run one full self-diagnosis and print the report
    #[arg(long)]
    diagnose: bool,

    /// Force one evolution cycle now (the gate still applies)
    #[arg(long)]
    evolve: bool,

    /// Roll back to the last pre-evolution checkpoint
    #[arg(long)]
    rollback: bool,
}

// ---- Status Command ---------------------------------------------------------

fn show_status(runtime: &Runtime) -> Result<()> {
    let balance = runtime.ledger.balance()?;
    let actions = runtime.journal.action_count()?;
    let tools = runtime.journal.tool_count()?;
    let focus = runtime.journal.focus_tier()?;

    println!("{}", "=== OUROBOROS STATUS ===".bold());
    println!("Version:      {VERSION}");
    println!("Database:     {}", runtime.config.resolved_db_path());
    let balance_str = format!("{balance:.4}");
    if balance < runtime.ledger.threshold() {
        println!("Balance:      {}", balance_str.red());
    } else {
        println!("Balance:      {}", balance_str.green());
    }
    println!("Actions:      {actions}");
    println!("Tools:        {tools}");
    println!("Focus tier:   {} ({})", focus.tier, focus.name);
    println!();
    println!("{}", "Scheduled tasks".bold());
    for task in runtime.scheduler.task_status() {
        let enabled = if task.enabled { "on " } else { "off" };
        println!(
            "  [{}] {:<26} every {:<4} pri {}  runs {}  failures {}",
            enabled, task.name, task.interval, task.priority, task.runs, task.failures
        );
    }
    Ok(())
}

// ---- Main Run ---------------------------------------------------------------

async fn run(runtime: Runtime) -> Result<()> {
    info!("ouroboros v{VERSION} starting");
    runtime.start();

    // Graceful shutdown on SIGINT/SIGTERM.
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("received shutdown signal");
    }

    runtime.shutdown().await;
    info!("scheduler stopped, goodbye");
    Ok(())
}

// ---- Entry Point -----------------------------------------------------------

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = RuntimeConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_filter())),
        )
        .init();

    let runtime = match Runtime::build(config) {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Fatal: failed to assemble runtime: {e:#}");
            std::process::exit(1);
        }
    };

    if cli.status {
        if let Err(e) = show_status(&runtime) {
            eprintln!("Status failed: {e:#}");
            std::process::exit(1);
        }
        return;
    }

    if cli.diagnose {
        match runtime.diagnosis.perform_full_diagnosis().await {
            Ok(report) => match serde_json::to_string_pretty(&report) {
                Ok(json) => println!("{json}"),
                Err(e) => eprintln!("Failed to render report: {e}"),
            },
            Err(e) => {
                eprintln!("Diagnosis failed: {e:#}");
                std::process::exit(1);
            }
        }
        return;
    }

    if cli.evolve {
        match runtime.evolution.run_autonomous_evolution().await {
            Ok(outcome) => {
                println!(
                    "cycle: {} {}",
                    outcome.status.as_str(),
                    outcome.reason.unwrap_or_default()
                );
            }
            Err(e) => {
                eprintln!("Evolution failed: {e:#}");
                std::process::exit(1);
            }
        }
        return;
    }

    if cli.rollback {
        match runtime.evolution.rollback_last_evolution() {
            Ok(summary) => println!("{summary}"),
            Err(e) => {
                eprintln!("Rollback failed: {e:#}");
                std::process::exit(1);
            }
        }
        return;
    }

    if cli.run {
        if let Err(e) = run(runtime).await {
            eprintln!("Fatal: {e:#}");
            std::process::exit(1);
        }
        return;
    }

    // Default: point at the help.
    println!("Run \"ouroboros --help\" for usage information.");
    println!("Run \"ouroboros --run\" to start the runtime.");
}
