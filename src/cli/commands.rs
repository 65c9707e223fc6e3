//! CLI command definitions for leasehold.
//!
//! Administrative commands (`migrate`, `create`, `get`, `children`, `resume`,
//! `cancel`) operate on the task table directly; `work` runs a scheduler
//! with the built-in handlers until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::Value;
use tracing::info;

use crate::builtin;
use crate::scheduler::{Registry, Scheduler, SchedulerConfig, TaskId};
use crate::storage::config::{ENV_DBNAME, ENV_HOST, ENV_PASSWORD, ENV_PORT, ENV_USER};
use crate::storage::{Channel, MigrationRunner, StorageConfig, TaskStore, DEFAULT_CHANNEL};

/// Durable PostgreSQL-backed task scheduler.
#[derive(Parser)]
#[command(name = "leasehold")]
#[command(about = "Durable PostgreSQL-backed task scheduler")]
#[command(version)]
#[command(
    long_about = "leasehold stores tasks in PostgreSQL and runs them on leased workers.\n\nExample usage:\n  leasehold migrate\n  leasehold create fan_out --state '{\"children\": [{\"n\": 1}, {\"n\": 2}]}'\n  leasehold work --workers 4"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Database connection settings.
    #[command(flatten)]
    pub storage: StorageArgs,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// PostgreSQL connection flags, each with an environment fallback.
#[derive(clap::Args, Debug, Clone)]
pub struct StorageArgs {
    /// Database host.
    #[arg(long = "pg-host", env = ENV_HOST, default_value = "localhost", global = true)]
    pub host: String,

    /// Database port.
    #[arg(long = "pg-port", env = ENV_PORT, default_value = "5432", global = true)]
    pub port: u16,

    /// Database user.
    #[arg(long = "pg-user", env = ENV_USER, default_value = "postgres", global = true)]
    pub user: String,

    /// Database password.
    #[arg(
        long = "pg-password",
        env = ENV_PASSWORD,
        default_value = "",
        hide_env_values = true,
        hide_default_value = true,
        global = true
    )]
    pub password: String,

    /// Database name.
    #[arg(long = "pg-dbname", env = ENV_DBNAME, default_value = "leasehold", global = true)]
    pub dbname: String,
}

impl StorageArgs {
    pub fn to_config(&self) -> StorageConfig {
        StorageConfig::new(&self.host, &self.user, &self.password, &self.dbname)
            .with_port(self.port)
    }
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Create or reset the task schema.
    Migrate(MigrateArgs),

    /// Create a task.
    Create(CreateArgs),

    /// Print a task as JSON.
    Get(TaskArgs),

    /// Print the direct children of a task as JSON.
    Children(TaskArgs),

    /// Move a waiting task back to pending.
    Resume(ResumeArgs),

    /// Fail a task and all of its unfinished descendants.
    Cancel(TaskArgs),

    /// Run workers with the built-in `echo` and `fan_out` handlers.
    Work(WorkArgs),
}

/// Arguments for `leasehold migrate`.
#[derive(Parser, Debug)]
pub struct MigrateArgs {
    /// Drop the task tables before migrating. Destroys all tasks.
    #[arg(long)]
    pub reset: bool,

    /// List applied migrations after running.
    #[arg(long)]
    pub list: bool,
}

/// Arguments for `leasehold create`.
#[derive(Parser, Debug)]
pub struct CreateArgs {
    /// Task type, matched against registered handlers.
    pub task_type: String,

    /// Initial state as JSON (defaults to `{}`).
    #[arg(short, long)]
    pub state: Option<String>,

    /// Create the task as a child of this task.
    #[arg(short, long)]
    pub parent: Option<TaskId>,
}

/// Arguments naming a single task.
#[derive(Parser, Debug)]
pub struct TaskArgs {
    /// Task id.
    pub id: TaskId,
}

/// Arguments for `leasehold resume`.
#[derive(Parser, Debug)]
pub struct ResumeArgs {
    /// Task id.
    pub id: TaskId,

    /// Replace the task's state with this JSON.
    #[arg(short, long)]
    pub state: Option<String>,
}

/// Arguments for `leasehold work`.
#[derive(Parser, Debug)]
pub struct WorkArgs {
    /// Number of workers.
    #[arg(short, long, default_value = "4")]
    pub workers: usize,

    /// Lease length in seconds.
    #[arg(long, default_value = "300")]
    pub lease_secs: u64,

    /// Lease renewal interval in seconds; must be shorter than the lease.
    #[arg(long, default_value = "60")]
    pub heartbeat_secs: u64,

    /// Notification channel to listen on.
    #[arg(long, default_value = DEFAULT_CHANNEL)]
    pub channel: String,

    /// Rescan interval without notifications, in seconds (defaults to the lease).
    #[arg(long)]
    pub fallback_secs: Option<u64>,

    /// How long to wait for running handlers on shutdown, in seconds.
    #[arg(long, default_value = "60")]
    pub shutdown_timeout_secs: u64,

    /// Run migrations before starting.
    #[arg(long)]
    pub migrate: bool,
}

impl WorkArgs {
    fn to_config(&self) -> anyhow::Result<SchedulerConfig> {
        let mut config = SchedulerConfig::new(self.workers)
            .with_lease_duration(Duration::from_secs(self.lease_secs))
            .with_heartbeat_interval(Duration::from_secs(self.heartbeat_secs))
            .with_channel(Channel::new(&self.channel)?)
            .with_shutdown_timeout(Duration::from_secs(self.shutdown_timeout_secs));
        if let Some(secs) = self.fallback_secs {
            config = config.with_fallback_rescan(Some(Duration::from_secs(secs)));
        }
        config.validate()?;
        Ok(config)
    }
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let storage = cli.storage.to_config();
    match cli.command {
        Commands::Migrate(args) => run_migrate_command(&storage, args).await,
        Commands::Create(args) => run_create_command(&storage, args).await,
        Commands::Get(args) => run_get_command(&storage, args).await,
        Commands::Children(args) => run_children_command(&storage, args).await,
        Commands::Resume(args) => run_resume_command(&storage, args).await,
        Commands::Cancel(args) => run_cancel_command(&storage, args).await,
        Commands::Work(args) => run_work_command(&storage, args).await,
    }
}

// ============================================================================
// Task Commands
// ============================================================================

async fn connect(storage: &StorageConfig) -> anyhow::Result<TaskStore> {
    TaskStore::connect(storage)
        .await
        .with_context(|| format!("failed to connect to {}:{}", storage.host, storage.port))
}

async fn run_migrate_command(storage: &StorageConfig, args: MigrateArgs) -> anyhow::Result<()> {
    let store = connect(storage).await?;
    let runner = MigrationRunner::new(store.pool().clone());

    if args.reset {
        runner.reset_database().await?;
        info!("Dropped task tables");
    }
    let applied = runner.run_migrations().await?;
    println!("applied {} migration(s)", applied);

    if args.list {
        for migration in runner.list_applied_migrations().await? {
            println!("{}\t{}", migration.applied_at.to_rfc3339(), migration.name);
        }
    }
    Ok(())
}

async fn run_create_command(storage: &StorageConfig, args: CreateArgs) -> anyhow::Result<()> {
    let state = args.state.as_deref().map(parse_state).transpose()?;
    let store = connect(storage).await?;

    let id = match args.parent {
        Some(parent) => store.create_child(parent, &args.task_type, state).await?,
        None => store.create(&args.task_type, state).await?,
    };
    println!("{}", id);
    Ok(())
}

async fn run_get_command(storage: &StorageConfig, args: TaskArgs) -> anyhow::Result<()> {
    let store = connect(storage).await?;
    let task = store.get(args.id).await?;
    println!("{}", serde_json::to_string_pretty(&task)?);
    Ok(())
}

async fn run_children_command(storage: &StorageConfig, args: TaskArgs) -> anyhow::Result<()> {
    let store = connect(storage).await?;
    let children = store.get_child_tasks(args.id).await?;
    println!("{}", serde_json::to_string_pretty(&children)?);
    Ok(())
}

async fn run_resume_command(storage: &StorageConfig, args: ResumeArgs) -> anyhow::Result<()> {
    let state = args.state.as_deref().map(parse_state).transpose()?;
    let store = connect(storage).await?;

    let resumed = match state {
        Some(state) => store.resume_with_state(args.id, state).await?,
        None => store.resume(args.id).await?,
    };
    if resumed {
        println!("resumed {}", args.id);
    } else {
        println!("task {} is not waiting", args.id);
    }
    Ok(())
}

async fn run_cancel_command(storage: &StorageConfig, args: TaskArgs) -> anyhow::Result<()> {
    let store = connect(storage).await?;
    let cancelled = store.cancel(args.id).await?;
    println!("cancelled {} task(s)", cancelled);
    Ok(())
}

// ============================================================================
// Work Command
// ============================================================================

async fn run_work_command(storage: &StorageConfig, args: WorkArgs) -> anyhow::Result<()> {
    let config = args.to_config()?;
    let storage = storage
        .clone()
        .with_min_connections_for(config.required_connections());
    let store = connect(&storage).await?;
    if args.migrate {
        store.run_migrations().await?;
    }

    let registry = Arc::new(Registry::new());
    builtin::register_all(&registry)?;

    let handle = Scheduler::start(store.pool().clone(), registry, config).await?;
    info!("Press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    let stats = handle.stats();
    handle.shutdown().await?;
    info!(
        completed = stats.tasks_completed,
        failed = stats.tasks_failed,
        errors = stats.execution_errors,
        "Stopped"
    );
    Ok(())
}

fn parse_state(raw: &str) -> anyhow::Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("state is not valid JSON: {}", raw))
}
