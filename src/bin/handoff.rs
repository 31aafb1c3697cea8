//! handoff CLI: operator interface to the coordination core.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tracing::info;

use handoff_rs::config::Config;
use handoff_rs::config::secrets::redact_url;
use handoff_rs::coordinator::{Assignment, ChannelDispatcher, Coordinator};
use handoff_rs::db::Db;
use handoff_rs::durable::DurableStore;
use handoff_rs::escalation::{EscalationChannel, LogSink};
use handoff_rs::model::{NewFact, NewWorkItem, State, WorkItemId};
use handoff_rs::sweeper::Sweeper;
use handoff_rs::telemetry::{TelemetryConfig, init_telemetry};
use handoff_rs::validation::RequiredFields;

#[derive(Parser)]
#[command(name = "handoff", about = "Delegation and context-cache coordination")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator in-process against simulated workers
    Simulate {
        /// Number of work items to submit
        #[arg(long, default_value_t = 5)]
        items: usize,
        /// Number of simulated workers
        #[arg(long, default_value_t = 3)]
        workers: usize,
        /// Attempts per item that fail before one succeeds
        #[arg(long, default_value_t = 1)]
        fail_first: u32,
        /// Automatic dispatches before escalation (defaults to config)
        #[arg(long)]
        max_attempts: Option<u32>,
        /// Backoff base in milliseconds (defaults to config)
        #[arg(long)]
        backoff_ms: Option<u64>,
    },
    /// Durable fact operations (Postgres)
    Facts {
        #[command(subcommand)]
        action: FactsAction,
    },
}

#[derive(Subcommand)]
enum FactsAction {
    /// Print every retained version as JSON rows
    Export,
    /// Show the current (or a specific) version of a fact
    Read {
        key: String,
        #[arg(long)]
        version: Option<u64>,
    },
    /// Write a fact through the conflict resolver
    Write {
        key: String,
        /// JSON value
        value: String,
        #[arg(long)]
        writer: String,
    },
    /// List archived (losing) writes for a key
    Archive { key: String },
    /// Purge versions older than the retention window
    Sweep,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;
    let _guard = init_telemetry(TelemetryConfig::from_config(&config))?;

    match cli.command {
        Command::Simulate {
            items,
            workers,
            fail_first,
            max_attempts,
            backoff_ms,
        } => cmd_simulate(config, items, workers, fail_first, max_attempts, backoff_ms).await,
        Command::Facts { action } => {
            let url = config.require_database_url()?;
            info!(database = %redact_url(url), "connecting");
            let db = Db::connect(url.expose_secret()).await?;
            db.migrate().await?;
            db.health_check().await?;
            let store = DurableStore::new(Arc::new(db))
                .with_retention(config.coordinator.retention());

            match action {
                FactsAction::Export => cmd_facts_export(&store).await,
                FactsAction::Read { key, version } => cmd_facts_read(&store, key, version).await,
                FactsAction::Write { key, value, writer } => {
                    cmd_facts_write(&store, key, value, writer).await
                }
                FactsAction::Archive { key } => cmd_facts_archive(&store, key).await,
                FactsAction::Sweep => cmd_facts_sweep(&store).await,
            }
        }
    }
}

async fn cmd_simulate(
    config: Config,
    items: usize,
    workers: usize,
    fail_first: u32,
    max_attempts: Option<u32>,
    backoff_ms: Option<u64>,
) -> anyhow::Result<()> {
    let mut settings = config.coordinator.clone();
    if let Some(n) = max_attempts {
        settings.max_attempts = n;
    }
    if let Some(ms) = backoff_ms {
        settings.backoff_base_ms = ms;
        settings.backoff_cap_ms = settings.backoff_cap_ms.max(ms);
    }

    let (dispatcher, mut assignments) =
        ChannelDispatcher::new((1..=workers.max(1)).map(|n| format!("worker-{n}")));
    let coordinator = Coordinator::builder(Arc::new(dispatcher))
        .config(settings.clone())
        .escalation(Arc::new(EscalationChannel::new().with_sink(Arc::new(LogSink))))
        .build()?;

    let sweeper = Sweeper::new(
        Arc::clone(coordinator.cache()),
        Arc::clone(coordinator.durable()),
        &settings,
    );
    let sweeper_task = sweeper.spawn();

    let durable = Arc::clone(coordinator.durable());
    let pool = tokio::spawn(async move {
        while let Some(assignment) = assignments.recv().await {
            let durable = Arc::clone(&durable);
            tokio::spawn(async move {
                if let Err(e) = simulate_worker(&durable, assignment, fail_first).await {
                    tracing::warn!(error = %e, "simulated worker could not signal");
                }
            });
        }
    });

    let ids: Vec<WorkItemId> = (1..=items).map(|n| WorkItemId::new(format!("W{n}"))).collect();
    for id in &ids {
        let new = NewWorkItem::new(id.clone(), "simulator")
            .payload(serde_json::json!({ "task": id.as_str() }))
            .check(Arc::new(RequiredFields::new(["item", "worker"])));
        coordinator.submit(new).await?;
    }
    for id in &ids {
        coordinator.wait_until_settled(id).await?;
    }

    println!(
        "{:<8}  {:<10}  {:<7}  {:<10}  LAST FAILURE",
        "ID", "STATE", "ATTEMPT", "WORKER"
    );
    println!("{}", "-".repeat(80));
    for record in coordinator.records() {
        println!(
            "{:<8}  {:<10}  {:<7}  {:<10}  {}",
            record.work_item_id,
            record.state,
            record.attempt,
            record.worker_id.as_ref().map(|w| w.as_str()).unwrap_or("-"),
            record.last_failure.as_deref().unwrap_or("-")
        );
    }

    let escalated = coordinator
        .records()
        .iter()
        .filter(|r| r.state == State::Escalated)
        .count();
    println!("\n{} item(s), {escalated} escalated", items);

    println!("\nDurable export:");
    for row in coordinator.durable().export().await? {
        println!("{}", serde_json::to_string(&row)?);
    }

    sweeper.shutdown();
    coordinator.shutdown();
    sweeper_task.await.ok();
    pool.abort();
    Ok(())
}

async fn simulate_worker(
    durable: &DurableStore,
    assignment: Assignment,
    fail_first: u32,
) -> handoff_rs::error::Result<()> {
    assignment.acknowledge()?;
    assignment.cache.append(serde_json::json!({
        "note": "started",
        "attempt": assignment.attempt,
    }))?;
    tokio::time::sleep(Duration::from_millis(10)).await;

    if assignment.attempt <= fail_first {
        return assignment.fail(format!("simulated failure on attempt {}", assignment.attempt));
    }

    let receipt = durable
        .write(NewFact::new(
            format!("result/{}", assignment.work_item.id),
            serde_json::json!({
                "item": assignment.work_item.id,
                "worker": assignment.worker_id,
                "attempt": assignment.attempt,
            }),
            assignment.worker_id.clone(),
        ))
        .await?;
    assignment.complete(receipt.fact_ref())
}

async fn cmd_facts_export(store: &DurableStore) -> anyhow::Result<()> {
    for row in store.export().await? {
        println!("{}", serde_json::to_string(&row)?);
    }
    Ok(())
}

async fn cmd_facts_read(store: &DurableStore, key: String, version: Option<u64>) -> anyhow::Result<()> {
    let fact = match version {
        Some(v) => store.read_at(&key, v).await?,
        None => store.read(&key).await?,
    };

    println!("Key:        {}", fact.key);
    println!("Version:    {}", fact.version);
    println!("Writer:     {}", fact.writer_id);
    println!("Written:    {}", fact.written_at);
    println!("Value:      {}", serde_json::to_string_pretty(&fact.value)?);
    Ok(())
}

async fn cmd_facts_write(
    store: &DurableStore,
    key: String,
    value: String,
    writer: String,
) -> anyhow::Result<()> {
    let value: serde_json::Value = serde_json::from_str(&value)?;
    let receipt = store.write(NewFact::new(key, value, writer)).await?;
    println!(
        "{}: {} (current writer {})",
        receipt.fact_ref(),
        receipt.outcome,
        receipt.current_writer
    );
    Ok(())
}

async fn cmd_facts_archive(store: &DurableStore, key: String) -> anyhow::Result<()> {
    let archived = store.archive(&key).await?;
    if archived.is_empty() {
        println!("No archived writes for {key}.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<16}  {:<10}  {:<20}  VALUE",
        "VERSION", "WRITER", "REASON", "WRITTEN"
    );
    println!("{}", "-".repeat(80));
    for a in &archived {
        println!(
            "{:<8}  {:<16}  {:<10}  {:<20}  {}",
            a.version,
            a.writer_id,
            a.reason,
            a.written_at.format("%Y-%m-%d %H:%M:%S"),
            a.value
        );
    }
    Ok(())
}

async fn cmd_facts_sweep(store: &DurableStore) -> anyhow::Result<()> {
    let report = store.sweep_retention().await?;
    println!(
        "Purged {} version(s) and {} archived write(s) older than {:?}",
        report.facts_removed,
        report.archived_removed,
        store.retention()
    );
    Ok(())
}
