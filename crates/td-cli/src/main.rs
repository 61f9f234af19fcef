//! `td` entry point: parses arguments, wires the runtime, and dispatches to
//! the command implementations in `commands.rs`. All command logic lives
//! there; this file only owns the CLI surface.

mod commands;
mod fetch;
mod wiring;

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

use commands::PlanRunResult;
use fetch::UniverseEntry;
use wiring::Runtime;

#[derive(Parser)]
#[command(name = "td")]
#[command(about = "Equity trading orchestrator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// State store commands
    Db {
        #[command(subcommand)]
        cmd: DbCmd,
    },

    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base defaults are always applied first)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Run one orchestrator cycle
    Run {
        #[arg(long = "mode", value_enum)]
        mode: RunMode,

        /// Layered config paths in merge order
        #[arg(long = "config")]
        config_paths: Vec<String>,

        /// Universe file (JSON array of {"ticker", "sector"}), required for --mode=plan
        #[arg(long)]
        universe: Option<String>,

        /// Confirmation token for a RED circuit-breaker gate, required for --mode=execute
        #[arg(long)]
        confirm: Option<String>,

        /// Operator override for the daily-execution-limit and plan-freshness gates
        #[arg(long)]
        r#override: bool,

        /// Run a single monitor cycle and exit, instead of looping
        #[arg(long)]
        once: bool,

        /// Hours between monitor cycles when not run with --once
        #[arg(long = "interval-hours")]
        interval_hours: Option<i64>,
    },
}

#[derive(Subcommand)]
enum DbCmd {
    Status,
    Migrate,
}

#[derive(Clone, Copy, ValueEnum)]
enum RunMode {
    Plan,
    Execute,
    Monitor,
    Dashboard,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Db { cmd } => {
            let rt = Runtime::connect(&[]).await?;
            match cmd {
                DbCmd::Status => commands::cmd_db_status(&rt).await?,
                DbCmd::Migrate => commands::cmd_db_migrate(&rt).await?,
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            commands::cmd_config_hash(&path_refs)?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Run { mode, config_paths, universe, confirm, r#override, once, interval_hours } => {
            let path_refs: Vec<&str> = config_paths.iter().map(|s| s.as_str()).collect();
            let rt = Runtime::connect(&path_refs).await?;

            match mode {
                RunMode::Plan => {
                    let universe_path = universe.ok_or_else(|| {
                        anyhow::anyhow!("--mode=plan requires --universe <path>")
                    })?;
                    let raw = std::fs::read_to_string(&universe_path)?;
                    let entries: Vec<UniverseEntry> = serde_json::from_str(&raw)?;
                    match commands::cmd_run_plan(&rt, &entries).await? {
                        PlanRunResult::Planned => Ok(ExitCode::SUCCESS),
                        PlanRunResult::Escalated => Ok(ExitCode::from(2)),
                        PlanRunResult::Failed => Ok(ExitCode::from(3)),
                    }
                }
                RunMode::Execute => {
                    let outcome = commands::cmd_run_execute(&rt, r#override, confirm).await?;
                    println!("{}", serde_json::to_string_pretty(&match &outcome {
                        td_coordinator::execute::ExecuteOutcome::Executed { trades_dispatched } => {
                            serde_json::json!({"executed": true, "trades_dispatched": trades_dispatched})
                        }
                        td_coordinator::execute::ExecuteOutcome::GuardrailBlocked(result) => {
                            serde_json::json!({"executed": false, "guardrail": result})
                        }
                    })?);
                    match outcome {
                        td_coordinator::execute::ExecuteOutcome::Executed { .. } => Ok(ExitCode::SUCCESS),
                        td_coordinator::execute::ExecuteOutcome::GuardrailBlocked(_) => Ok(ExitCode::from(4)),
                    }
                }
                RunMode::Monitor => {
                    commands::cmd_run_monitor(&rt, once, interval_hours).await?;
                    Ok(ExitCode::SUCCESS)
                }
                RunMode::Dashboard => {
                    commands::cmd_run_dashboard(&rt).await?;
                    Ok(ExitCode::SUCCESS)
                }
            }
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}
