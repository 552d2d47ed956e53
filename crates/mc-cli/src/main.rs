//! `mc` -- thin CLI over the mission-control core.

mod init_cmd;
mod mission_cmd;
mod parallel_cmd;
mod report_cmds;
mod setup;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mc", about = "Autonomous-development orchestrator", version)]
struct Cli {
    /// Path to the mission config file.
    #[arg(long, global = true, default_value = "mission.toml")]
    config: PathBuf,

    /// Path to the state database (defaults to the user data dir).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a starter config and create the database.
    Init,
    /// Run a single mission to completion.
    Start,
    /// Run a mission, optionally chaining follow-up missions.
    Mission {
        /// Re-plan and run follow-up missions while the objective is unmet.
        #[arg(long)]
        chain: bool,
        /// Maximum chained missions.
        #[arg(long, default_value_t = 3)]
        max_chain_depth: u32,
    },
    /// Plan once and dispatch the units in parallel, without rounds.
    Parallel {
        /// Override the configured worker count.
        #[arg(long)]
        workers: Option<usize>,
        /// Print the plan without dispatching.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run verification against the target and record a health snapshot.
    Discover,
    /// Show recent missions and their rounds.
    History,
    /// Show discoveries and concerns reported by recent workers.
    Intel,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let db_path = cli.db.clone().unwrap_or_else(setup::default_db_path);

    let outcome = match cli.command {
        Command::Init => init_cmd::run(&cli.config, &db_path).await,
        Command::Start => mission_cmd::run(&cli.config, &db_path, false, 1).await,
        Command::Mission {
            chain,
            max_chain_depth,
        } => mission_cmd::run(&cli.config, &db_path, chain, max_chain_depth).await,
        Command::Parallel { workers, dry_run } => {
            parallel_cmd::run(&cli.config, &db_path, workers, dry_run).await
        }
        Command::Discover => report_cmds::discover(&cli.config, &db_path).await,
        Command::History => report_cmds::history(&db_path).await,
        Command::Intel => report_cmds::intel(&db_path).await,
    };

    match outcome {
        Ok(objective_met) => {
            if objective_met {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
