//! sparkq CLI: operator interface to the task queue.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use sparkq::config::Config;
use sparkq::db::Db;
use sparkq::engine::{
    Retention, RunMode, Runner, RunnerConfig, Shutdown, Watchdog, WatchdogConfig,
};
use sparkq::invoker::{AnthropicInvoker, DryRunInvoker, Invoker};
use sparkq::lock::{LockFile, runner_lock_path, server_lock_path};
use sparkq::model::{NewTask, SessionId, Task, TaskFilter, TaskId, TaskStatus};
use sparkq::telemetry::{TelemetryConfig, init_telemetry};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sparkq", about = "Local task queue with per-queue runners")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the watchdog and retention until interrupted
    Serve,
    /// Run tasks from one queue
    Run {
        /// Queue ID or name
        queue: String,
        /// Execute at most one task
        #[arg(long, conflicts_with = "drain")]
        once: bool,
        /// Execute until the queue is empty
        #[arg(long)]
        drain: bool,
        /// Seconds between polls of an empty queue
        #[arg(long)]
        poll_interval: Option<u64>,
        /// Echo prompts instead of calling the model
        #[arg(long)]
        dry_run: bool,
    },
    /// Session operations
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Queue operations
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },
    /// Add a task to a queue
    Enqueue {
        /// Queue ID or name
        queue: String,
        /// Tool the runner should use
        tool: String,
        /// Task class (picks the default timeout)
        class: String,
        /// Task payload, usually JSON
        #[arg(long)]
        payload: Option<String>,
        /// Timeout in seconds, overriding the class default
        #[arg(long)]
        timeout: Option<u32>,
    },
    /// Task operations
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// Delete finished tasks older than the retention window
    Purge {
        #[arg(long)]
        older_than_days: Option<u32>,
    },
    /// Run one watchdog scan
    Watchdog,
}

#[derive(Subcommand)]
enum SessionAction {
    /// Start a new session
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// List sessions, newest first
    List,
    /// End a session
    End { id: String },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Create a queue in a session
    Create {
        /// Session ID
        session: String,
        name: String,
        #[arg(long)]
        instructions: Option<String>,
    },
    /// List queues
    List {
        /// Only queues in this session
        #[arg(long)]
        session: Option<String>,
    },
    /// End a queue
    End { queue: String },
    /// Task counts per status
    Stats { queue: String },
}

#[derive(Subcommand)]
enum TaskAction {
    /// List tasks, oldest first
    List {
        /// Queue ID or name
        #[arg(long)]
        queue: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// Show a task
    Show {
        /// Task ID (full UUID or prefix)
        id: String,
    },
    /// Fail a task from any status
    Fail {
        id: String,
        message: String,
        #[arg(long)]
        error_type: Option<String>,
    },
    /// Clone a finished task into a new queued task
    Requeue { id: String },
    /// Rescue a task the watchdog auto-failed
    Reset {
        id: String,
        /// Target status: running or queued
        #[arg(long, default_value = "queued")]
        to: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "sparkq".to_string(),
        default_filter: config.log_level.clone(),
    })?;

    let db = Db::connect(&config.database_path).await?;
    db.migrate().await?;

    match cli.command {
        Command::Serve => cmd_serve(&config, db).await,
        Command::Run {
            queue,
            once,
            drain,
            poll_interval,
            dry_run,
        } => {
            let mode = match (once, drain) {
                (true, _) => RunMode::Once,
                (_, true) => RunMode::Drain,
                _ => RunMode::Watch,
            };
            let poll_interval = poll_interval
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.settings.poll_interval());
            cmd_run(&config, db, &queue, mode, poll_interval, dry_run).await
        }
        Command::Session { action } => cmd_session(&config, &db, action).await,
        Command::Queue { action } => cmd_queue(&db, action).await,
        Command::Enqueue {
            queue,
            tool,
            class,
            payload,
            timeout,
        } => cmd_enqueue(&config, &db, &queue, tool, class, payload, timeout).await,
        Command::Task { action } => cmd_task(&db, action).await,
        Command::Purge { older_than_days } => {
            let days = older_than_days.unwrap_or(config.settings.retention.older_than_days);
            let deleted = db.purge_old_tasks(days).await?;
            println!("Purged {deleted} task(s) finished more than {days} day(s) ago");
            Ok(())
        }
        Command::Watchdog => {
            let watchdog =
                Watchdog::new(db, WatchdogConfig::from(&config.settings.watchdog));
            let report = watchdog.scan_once().await?;
            println!(
                "Warned: {}  Auto-failed: {}",
                report.warned, report.auto_failed
            );
            Ok(())
        }
    }
}

async fn cmd_serve(config: &Config, db: Db) -> anyhow::Result<()> {
    let lock = LockFile::acquire(server_lock_path(&config.lock_dir))?;
    db.health_check().await?;

    let shutdown = Shutdown::new();
    let mut jobs = Vec::new();

    let watchdog = Watchdog::new(db.clone(), WatchdogConfig::from(&config.settings.watchdog));
    jobs.push(tokio::spawn(watchdog.run(shutdown.clone())));

    if config.settings.retention.enabled {
        let retention = Retention::new(db, &config.settings.retention);
        jobs.push(tokio::spawn(retention.run(shutdown.clone())));
    } else {
        info!("retention disabled");
    }

    info!(lock = %lock.path().display(), "server started");
    wait_for_signal().await;
    info!("shutting down");
    shutdown.trigger();

    for job in jobs {
        if let Err(e) = job.await {
            warn!("background job ended abnormally: {e}");
        }
    }
    lock.release()?;
    Ok(())
}

async fn cmd_run(
    config: &Config,
    db: Db,
    queue_ref: &str,
    mode: RunMode,
    poll_interval: Duration,
    dry_run: bool,
) -> anyhow::Result<()> {
    let queue = db.resolve_queue(queue_ref).await?;
    let lock = LockFile::acquire(runner_lock_path(&config.lock_dir, &queue.name))?;

    let invoker: Arc<dyn Invoker> = if dry_run {
        Arc::new(DryRunInvoker::new())
    } else {
        Arc::new(AnthropicInvoker::new(
            config.require_api_key()?,
            &config.settings.runner.model,
        )?)
    };

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal.trigger();
    });

    let runner = Runner::for_queue(
        db,
        invoker,
        &queue.id.to_string(),
        RunnerConfig {
            mode,
            poll_interval,
        },
        shutdown,
    )
    .await?;
    let summary = runner.run().await?;

    if mode != RunMode::Watch {
        println!(
            "Queue {}: {} succeeded, {} failed",
            queue.name, summary.succeeded, summary.failed
        );
    }
    lock.release()?;
    Ok(())
}

async fn cmd_session(config: &Config, db: &Db, action: SessionAction) -> anyhow::Result<()> {
    match action {
        SessionAction::Create { name, description } => {
            let repo = std::env::current_dir()?;
            db.ensure_project(&config.settings.project_name, repo.to_str())
                .await?;
            let session = db.create_session(&name, description.as_deref()).await?;
            println!("Created session: {} ({})", session.id, session.name);
        }
        SessionAction::List => {
            let sessions = db.list_sessions().await?;
            if sessions.is_empty() {
                println!("No sessions found.");
                return Ok(());
            }
            println!("{:<36}  {:<20}  {:<7}  STARTED", "ID", "NAME", "STATUS");
            println!("{}", "-".repeat(90));
            for s in &sessions {
                println!(
                    "{:<36}  {:<20}  {:<7}  {}",
                    s.id,
                    s.name,
                    s.status,
                    s.started_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        SessionAction::End { id } => {
            let session = db.end_session(id.parse::<SessionId>()?).await?;
            println!("Ended session: {}", session.id);
        }
    }
    Ok(())
}

async fn cmd_queue(db: &Db, action: QueueAction) -> anyhow::Result<()> {
    match action {
        QueueAction::Create {
            session,
            name,
            instructions,
        } => {
            let queue = db
                .create_queue(session.parse()?, &name, instructions.as_deref())
                .await?;
            println!("Created queue: {} ({})", queue.id, queue.name);
        }
        QueueAction::List { session } => {
            let session = session.map(|s| s.parse::<SessionId>()).transpose()?;
            let queues = db.list_queues(session).await?;
            if queues.is_empty() {
                println!("No queues found.");
                return Ok(());
            }
            println!("{:<36}  {:<20}  STATUS", "ID", "NAME");
            println!("{}", "-".repeat(70));
            for q in &queues {
                println!("{:<36}  {:<20}  {}", q.id, q.name, q.status);
            }
        }
        QueueAction::End { queue } => {
            let queue = db.resolve_queue(&queue).await?;
            let queue = db.end_queue(queue.id).await?;
            println!("Ended queue: {}", queue.name);
        }
        QueueAction::Stats { queue } => {
            let queue = db.resolve_queue(&queue).await?;
            let stats = db.queue_stats(queue.id).await?;
            println!("Queue:      {}", queue.name);
            println!("Queued:     {}", stats.queued);
            println!("Running:    {}", stats.running);
            println!("Succeeded:  {}", stats.succeeded);
            println!("Failed:     {}", stats.failed);
            println!("Total:      {}", stats.total());
        }
    }
    Ok(())
}

async fn cmd_enqueue(
    config: &Config,
    db: &Db,
    queue_ref: &str,
    tool: String,
    class: String,
    payload: Option<String>,
    timeout: Option<u32>,
) -> anyhow::Result<()> {
    let queue = db.resolve_queue(queue_ref).await?;
    let timeout = config.settings.timeout_for(&class, timeout);

    let mut new = NewTask::new(queue.id, tool, class, timeout);
    if let Some(payload) = payload {
        new = new.raw_payload(payload);
    }

    let task = db.create_task(new).await?;
    println!(
        "Enqueued: {} in {} (timeout {}s)",
        task.id, queue.name, task.timeout
    );
    Ok(())
}

async fn cmd_task(db: &Db, action: TaskAction) -> anyhow::Result<()> {
    match action {
        TaskAction::List {
            queue,
            status,
            limit,
        } => {
            let queue_id = match queue {
                Some(q) => Some(db.resolve_queue(&q).await?.id),
                None => None,
            };
            let tasks = db
                .list_tasks(&TaskFilter {
                    queue_id,
                    status,
                    limit: Some(limit),
                })
                .await?;

            if tasks.is_empty() {
                println!("No tasks found.");
                return Ok(());
            }

            println!(
                "{:<8}  {:<16}  {:<14}  {:<9}  {:<3}  CREATED",
                "ID", "TOOL", "CLASS", "STATUS", "TRY"
            );
            println!("{}", "-".repeat(80));
            for task in &tasks {
                println!(
                    "{:<8}  {:<16}  {:<14}  {:<9}  {:<3}  {}",
                    &task.id.to_string()[..8],
                    task.tool_name,
                    task.task_class,
                    task.status,
                    task.attempts,
                    task.created_at.format("%Y-%m-%d %H:%M")
                );
            }
            println!("\n{} task(s)", tasks.len());
        }
        TaskAction::Show { id } => {
            let task = db.get_task(resolve_task_id(db, &id).await?).await?;
            print_task(&task)?;
        }
        TaskAction::Fail {
            id,
            message,
            error_type,
        } => {
            let id = resolve_task_id(db, &id).await?;
            let task = db.fail_task(id, &message, error_type.as_deref()).await?;
            println!("Failed: {}", task.id);
        }
        TaskAction::Requeue { id } => {
            let id = resolve_task_id(db, &id).await?;
            let task = db.requeue_task(id).await?;
            println!("Requeued {id} as {}", task.id);
        }
        TaskAction::Reset { id, to } => {
            let id = resolve_task_id(db, &id).await?;
            let task = db
                .reset_auto_failed_task(id, to.parse::<TaskStatus>()?)
                .await?;
            println!("Reset {} to {}", task.id, task.status);
        }
    }
    Ok(())
}

/// Accept a full task ID or a unique prefix of one.
async fn resolve_task_id(db: &Db, id_str: &str) -> anyhow::Result<TaskId> {
    if id_str.len() >= 36 {
        return Ok(id_str.parse()?);
    }
    let tasks = db.list_tasks(&TaskFilter::default()).await?;
    let matches: Vec<_> = tasks
        .iter()
        .filter(|task| task.id.to_string().starts_with(id_str))
        .collect();
    match matches.as_slice() {
        [] => anyhow::bail!("no task matching prefix '{id_str}'"),
        [task] => Ok(task.id),
        _ => anyhow::bail!(
            "{} tasks match prefix '{id_str}', be more specific",
            matches.len()
        ),
    }
}

fn print_task(task: &Task) -> anyhow::Result<()> {
    println!("ID:         {}", task.id);
    println!("Queue:      {}", task.queue_id);
    println!("Tool:       {}", task.tool_name);
    println!("Class:      {}", task.task_class);
    println!("Status:     {}", task.status);
    println!("Timeout:    {}s", task.timeout);
    println!("Attempts:   {}", task.attempts);
    println!("Payload:    {}", task.payload);
    println!("Created:    {}", task.created_at);
    if let Some(claimed) = task.claimed_at {
        println!("Claimed:    {claimed}");
    }
    if let Some(warned) = task.stale_warned_at {
        println!("Stale:      {warned}");
    }
    if let Some(finished) = task.finished_at {
        println!("Finished:   {finished}");
    }
    if let Some(source) = task.requeued_from {
        println!("Requeued From: {source}");
    }
    if let Some(ref summary) = task.result_summary {
        println!("---");
        println!("Summary:    {summary}");
    }
    if let Some(ref result) = task.result {
        println!("Result:     {}", serde_json::to_string_pretty(result)?);
    }
    if let Some(ref error) = task.error {
        println!("---");
        println!("Error:      {error}");
    }
    if let Some(ref stdout) = task.stdout {
        println!("Stdout:\n{stdout}");
    }
    if let Some(ref stderr) = task.stderr {
        println!("Stderr:\n{stderr}");
    }
    Ok(())
}

/// Resolve on Ctrl-C, or SIGTERM on unix.
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
