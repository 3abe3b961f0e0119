//! workq CLI: run a dispatcher, or submit and inspect work items.

use chrono::{TimeDelta, Utc};
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;
use workq::config::{Config, QueueConfig};
use workq::db::Db;
use workq::engine::{Dispatcher, Queue};
use workq::model::{NewWorkItem, Status, WorkItemId};
use workq::processor::ProcessorRegistry;
use workq::store::{ItemFilter, QueueStore};
use workq::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "workq", about = "Persistent work queue")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher daemon
    Serve {
        /// Queue tuning TOML file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override the worker pool size
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
    /// Work item operations
    Work {
        #[command(subcommand)]
        action: WorkAction,
    },
}

#[derive(Subcommand)]
enum WorkAction {
    /// Submit a new work item
    Submit {
        /// Work type (selects the processor)
        work_type: String,
        /// JSON payload
        #[arg(long)]
        payload: Option<String>,
        /// Delay before the item becomes eligible
        #[arg(long, default_value_t = 0)]
        delay_secs: i64,
        /// Expire the item this many seconds after submission
        #[arg(long)]
        expires_in_secs: Option<i64>,
        /// Override the type's retry budget
        #[arg(long)]
        max_retries: Option<u32>,
    },
    /// List work items
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        /// Filter by work type
        #[arg(long, name = "type")]
        work_type: Option<String>,
        /// Maximum items to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a work item
    Show {
        /// Work item ID (full UUID or prefix)
        id: String,
    },
    /// Request cancellation of a work item
    Cancel {
        /// Work item ID (full UUID or prefix)
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            max_concurrent,
        } => cmd_serve(config, max_concurrent).await,
        Command::Work { action } => {
            let config = Config::from_env()?;
            let db = Db::connect(config.database_url.expose_secret()).await?;
            db.migrate().await?;
            let queue = Queue::new(Arc::new(db));

            match action {
                WorkAction::Submit {
                    work_type,
                    payload,
                    delay_secs,
                    expires_in_secs,
                    max_retries,
                } => {
                    cmd_work_submit(&queue, work_type, payload, delay_secs, expires_in_secs, max_retries)
                        .await
                }
                WorkAction::List {
                    status,
                    work_type,
                    limit,
                } => cmd_work_list(&queue, status, work_type, limit).await,
                WorkAction::Show { id } => cmd_work_show(&queue, id).await,
                WorkAction::Cancel { id } => cmd_work_cancel(&queue, id).await,
            }
        }
    }
}

async fn cmd_serve(path: Option<PathBuf>, max_concurrent: Option<usize>) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "workq"))?;

    let mut queue_config = match path {
        Some(path) => QueueConfig::load(&path)?,
        None => QueueConfig::default(),
    };
    if let Some(n) = max_concurrent {
        queue_config.dispatcher.max_concurrent = n;
    }

    let db = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
    db.migrate().await?;

    let store: Arc<dyn QueueStore> = db.clone();
    let dispatcher = Dispatcher::new(
        store,
        ProcessorRegistry::with_builtins(),
        queue_config,
        config.worker_id,
    )?;

    let waker = dispatcher.waker();
    let listener_db = Arc::clone(&db);
    tokio::spawn(async move {
        if let Err(e) = listener_db.forward_notifications(waker).await {
            warn!("notification listener stopped: {e}");
        }
    });

    let ctrl = dispatcher.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl.shutdown();
    });

    dispatcher.run().await?;
    Ok(())
}

async fn cmd_work_submit(
    queue: &Queue,
    work_type: String,
    payload: Option<String>,
    delay_secs: i64,
    expires_in_secs: Option<i64>,
    max_retries: Option<u32>,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = match payload {
        Some(json) => serde_json::from_str(&json)?,
        None => serde_json::json!({}),
    };

    let now = Utc::now();
    let mut new = NewWorkItem::new(&work_type)
        .payload(payload)
        .scheduled_at(now + TimeDelta::seconds(delay_secs));
    if let Some(secs) = expires_in_secs {
        new = new.expires_at(now + TimeDelta::seconds(secs));
    }
    if let Some(n) = max_retries {
        new = new.max_retries(n);
    }

    let item = queue.enqueue(new).await?;
    println!(
        "Created: {} (status: {}, scheduled: {})",
        item.id,
        item.status,
        item.scheduled_time.format("%Y-%m-%d %H:%M:%S")
    );
    Ok(())
}

async fn cmd_work_list(
    queue: &Queue,
    status: Option<String>,
    work_type: Option<String>,
    limit: usize,
) -> anyhow::Result<()> {
    let status: Option<Status> = match status {
        Some(s) => Some(
            s.parse()
                .map_err(|_| anyhow::anyhow!("invalid status: {s}"))?,
        ),
        None => None,
    };

    let items = queue
        .list(&ItemFilter {
            status,
            work_type,
            limit: Some(limit),
        })
        .await?;

    if items.is_empty() {
        println!("No work items found.");
        return Ok(());
    }

    // Header
    println!(
        "{:<8}  {:<16}  {:<11}  {:<5}  {:<8}  SCHEDULED",
        "ID", "TYPE", "STATUS", "TRIES", "PROGRESS"
    );
    println!("{}", "-".repeat(80));

    for item in &items {
        println!(
            "{:<8}  {:<16}  {:<11}  {:<5}  {:>7.0}%  {}",
            item.id,
            item.work_type,
            item.status,
            item.retry_count,
            item.progress.percent_complete() * 100.0,
            item.scheduled_time.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} item(s)", items.len());
    Ok(())
}

async fn cmd_work_show(queue: &Queue, id: String) -> anyhow::Result<()> {
    let id = resolve_id(queue, &id).await?;
    let item = queue.get(id).await?;

    println!("ID:         {}", item.id.0);
    println!("Type:       {}", item.work_type);
    println!("Status:     {}", item.status);
    println!("Scheduled:  {}", item.scheduled_time);
    println!(
        "Expires:    {}",
        item.expiration_time
            .map(|t| t.to_string())
            .unwrap_or("-".to_string())
    );
    println!("Payload:    {}", serde_json::to_string_pretty(&item.payload)?);
    println!("Retries:    {}", item.retry_count);
    println!(
        "Max Tries:  {}",
        item.max_retries
            .map(|n| n.to_string())
            .unwrap_or("-".to_string())
    );
    println!("Claimed By: {}", item.claimed_by.as_deref().unwrap_or("-"));
    println!("Cancel Req: {}", item.cancel_requested);
    println!("Created:    {}", item.created_at);
    println!("Updated:    {}", item.updated_at);
    if let Some(completed) = item.completed_at {
        println!("Completed:  {completed}");
    }
    println!("---");
    let progress = &item.progress;
    println!(
        "Progress:   {}/{} processed, {} failed",
        progress.items_processed, progress.total_items, progress.items_failed
    );
    println!("Cancelable: {}", progress.is_cancelable);
    if !progress.status_details.is_empty() {
        println!("Details:    {}", progress.status_details);
    }
    if let Some(ref err) = item.failure_description {
        println!("Last Error: {err}");
    }

    Ok(())
}

async fn cmd_work_cancel(queue: &Queue, id: String) -> anyhow::Result<()> {
    let id = resolve_id(queue, &id).await?;
    let item = queue.cancel(id).await?;
    match item.status {
        Status::Canceled => println!("Canceled: {}", item.id),
        Status::InProgress => println!("Cancel requested: {} (running)", item.id),
        other => println!("Not cancelable: {} is {other}", item.id),
    }
    Ok(())
}

/// Accept a full UUID or an unambiguous prefix of a recent item's ID.
async fn resolve_id(queue: &Queue, id_str: &str) -> anyhow::Result<WorkItemId> {
    if id_str.len() >= 36 {
        return Ok(WorkItemId(uuid::Uuid::parse_str(id_str)?));
    }

    let items = queue
        .list(&ItemFilter {
            limit: Some(500),
            ..Default::default()
        })
        .await?;
    let matches: Vec<_> = items
        .iter()
        .filter(|item| item.id.0.to_string().starts_with(id_str))
        .collect();
    match matches.len() {
        0 => anyhow::bail!("no work item matching prefix '{id_str}'"),
        1 => Ok(matches[0].id),
        n => anyhow::bail!("{n} work items match prefix '{id_str}', be more specific"),
    }
}
