mod caller;
mod config;
mod run_cmd;
mod status_cmd;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use worldmind_core::mission::model::{InteractionMode, ReasoningLevel};

use run_cmd::{RuntimeOptions, exit_code};

#[derive(Parser)]
#[command(name = "worldmind", about = "Agentic coding mission runner")]
struct Cli {
    /// Checkpoint database URL (overrides WORLDMIND_DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a worldmind config file (no database required)
    Init {
        /// PostgreSQL connection URL for checkpoints
        #[arg(long, default_value = worldmind_db::config::DbConfig::DEFAULT_URL)]
        db_url: String,
        /// Structured caller command
        #[arg(long)]
        caller_cmd: Option<String>,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run a mission from a natural-language request
    Run {
        /// The development request
        request: String,
        /// Project directory to work on
        #[arg(long, default_value = ".")]
        project: PathBuf,
        /// Pause for plan approval instead of running fully autonomously
        #[arg(long)]
        approve_plan: bool,
        /// Plan and run a platform deployment task
        #[arg(long)]
        cf_deploy: bool,
        /// Reasoning effort hint (low|medium|high|max)
        #[arg(long)]
        reasoning: Option<ReasoningLevel>,
        /// Thread id for checkpointing (defaults to the mission id)
        #[arg(long)]
        thread_id: Option<String>,
        /// Keep checkpoints in memory instead of the database
        #[arg(long)]
        memory_checkpoints: bool,
        /// Maximum tasks executed concurrently per wave
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Git URL; when set, tasks run in per-task worktrees
        #[arg(long)]
        git_remote: Option<String>,
        /// Structured caller command (overrides config file)
        #[arg(long)]
        caller_cmd: Option<String>,
    },
    /// Resume a mission from its latest checkpoint
    Resume {
        /// Thread id to resume
        thread_id: String,
        /// Project directory to work on
        #[arg(long, default_value = ".")]
        project: PathBuf,
        /// Maximum tasks executed concurrently per wave
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Git URL; when set, tasks run in per-task worktrees
        #[arg(long)]
        git_remote: Option<String>,
        /// Structured caller command (overrides config file)
        #[arg(long)]
        caller_cmd: Option<String>,
    },
    /// Show the latest known state of a mission thread
    Status {
        /// Thread id to inspect
        thread_id: String,
    },
    /// List every checkpoint recorded for a thread
    Checkpoints {
        /// Thread id to inspect
        thread_id: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            exit_code::INTERNAL_ERROR
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Init {
            db_url,
            caller_cmd,
            force,
        } => {
            let path = config::config_path();
            if path.exists() && !force {
                anyhow::bail!(
                    "config file already exists at {} (use --force to overwrite)",
                    path.display()
                );
            }
            let file = config::ConfigFile {
                database: config::DatabaseSection { url: Some(db_url) },
                caller: config::CallerSection {
                    command: caller_cmd,
                },
                deployer: config::DeployerSection::default(),
            };
            config::save_config(&file)?;
            println!("wrote {}", path.display());
            Ok(exit_code::SUCCESS)
        }
        Commands::Run {
            request,
            project,
            approve_plan,
            cf_deploy,
            reasoning,
            thread_id,
            memory_checkpoints,
            max_parallel,
            git_remote,
            caller_cmd,
        } => {
            let mode = if approve_plan {
                InteractionMode::ApprovePlan
            } else {
                InteractionMode::FullAuto
            };
            let options = RuntimeOptions {
                project,
                database_url: cli.database_url,
                caller_command: caller_cmd,
                memory_checkpoints,
                max_parallel,
                git_remote,
            };
            run_cmd::run_mission(request, mode, cf_deploy, reasoning, thread_id, options).await
        }
        Commands::Resume {
            thread_id,
            project,
            max_parallel,
            git_remote,
            caller_cmd,
        } => {
            let options = RuntimeOptions {
                project,
                database_url: cli.database_url,
                caller_command: caller_cmd,
                memory_checkpoints: false,
                max_parallel,
                git_remote,
            };
            run_cmd::resume_mission(thread_id, options).await
        }
        Commands::Status { thread_id } => {
            status_cmd::show_status(&thread_id, cli.database_url.as_deref()).await?;
            Ok(exit_code::SUCCESS)
        }
        Commands::Checkpoints { thread_id } => {
            status_cmd::list_checkpoints(&thread_id, cli.database_url.as_deref()).await?;
            Ok(exit_code::SUCCESS)
        }
    }
}
