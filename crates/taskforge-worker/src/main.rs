mod config;
mod status_cmd;
mod submit_cmd;
mod worker_cmd;
mod workflow_cmd;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use taskforge_db::pool;

use config::TaskforgeConfig;

#[derive(Parser)]
#[command(name = "taskforge", about = "Distributed task orchestration platform for multi-step LLM agent workflows")]
struct Cli {
    /// Database URL (overrides TASKFORGE_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a taskforge config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/taskforge")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the taskforge database (requires config file or env vars)
    DbInit,
    /// Submit a new task (spec §6.1)
    Submit {
        /// Task kind, e.g. "agent:research", "tool:search", "workflow:research_report"
        #[arg(long)]
        kind: String,
        /// Path to a JSON file with the task input (use "-" for stdin)
        #[arg(long)]
        input: String,
        /// Retry cap for this task (spec §3.1 default: 3)
        #[arg(long, default_value_t = 3)]
        max_tries: i32,
    },
    /// Show a task's status (spec §6.2)
    Status {
        /// Task ID to inspect
        task_id: String,
        /// Also list every subtask the orchestrator spawned for this task
        #[arg(long)]
        plan: bool,
    },
    /// Workflow definition management (spec §6.3)
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
    /// Run a worker process against the task queue (spec §4.5)
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },
}

#[derive(Subcommand)]
enum WorkflowCommands {
    /// Parse and validate a workflow definition file
    Validate {
        /// Path to the workflow TOML file
        file: String,
    },
}

#[derive(Subcommand)]
enum WorkerCommands {
    /// Run the worker main loop until shutdown (Ctrl+C)
    Run {
        /// Directory of `*.toml` workflow definitions to load at startup
        #[arg(long, default_value = "./workflows")]
        workflows_dir: PathBuf,
    },
}

/// Execute the `taskforge init` command: write config file.
fn cmd_init(db_url: &str, force: bool) -> Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection {
            url: db_url.to_string(),
        },
        worker: config::WorkerSection::default(),
    };

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `taskforge db-init` to create and migrate the database.");

    Ok(())
}

/// Execute the `taskforge db-init` command: create database and run migrations.
async fn cmd_db_init(cli_db_url: Option<&str>) -> Result<()> {
    let resolved = TaskforgeConfig::resolve(cli_db_url)?;

    println!("Initializing taskforge database...");

    pool::ensure_database_exists(&resolved.db_config).await?;

    let db_pool = pool::create_pool(&resolved.db_config).await?;

    let migrations_path = pool::default_migrations_path();
    pool::run_migrations(&db_pool, migrations_path).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;

    println!("taskforge db-init complete.");
    Ok(())
}

fn read_input(path: &str) -> Result<serde_json::Value> {
    let raw = if path == "-" {
        std::io::read_to_string(std::io::stdin()).context("failed to read input from stdin")?
    } else {
        std::fs::read_to_string(path).with_context(|| format!("failed to read input file {path}"))?
    };
    serde_json::from_str(&raw).with_context(|| format!("input at {path:?} is not valid JSON"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Submit { kind, input, max_tries } => {
            let resolved = TaskforgeConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let input = read_input(&input)?;
            let result = submit_cmd::run_submit(&db_pool, &kind, input, max_tries).await;
            db_pool.close().await;
            result?;
        }
        Commands::Status { task_id, plan } => {
            let resolved = TaskforgeConfig::resolve(cli.database_url.as_deref())?;
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool, &task_id, plan).await;
            db_pool.close().await;
            result?;
        }
        Commands::Workflow { command } => match command {
            WorkflowCommands::Validate { file } => {
                workflow_cmd::run_validate(&file)?;
            }
        },
        Commands::Worker { command } => match command {
            WorkerCommands::Run { workflows_dir } => {
                let resolved = TaskforgeConfig::resolve(cli.database_url.as_deref())?;
                let db_pool = pool::create_pool(&resolved.db_config).await?;
                worker_cmd::run_worker(db_pool, resolved, &workflows_dir).await?;
            }
        },
    }

    Ok(())
}
