use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use entitlement_service::{
    backfill::{
        BackfillOptions, DEFAULT_BATCH_SIZE, DEFAULT_SOURCE_TABLE, PostgresHistoricalSource,
        run_backfill,
    },
    db::EntitlementDb,
    ledger::{EventType, store},
};

/// Source reads and ledger writes run one at a time.
const BACKFILL_POOL_SIZE: usize = 2;

/// Re-derive usage events from historical resource rows.
///
/// Safe to rerun: resources already in the ledger are skipped.
#[derive(Parser, Debug)]
#[command(name = "usage-backfill")]
struct Args {
    /// Rows fetched per batch.
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
    /// Resume strictly after this resource id (printed by a previous run).
    #[arg(long)]
    resume_cursor: Option<String>,
    /// Stop after this many batches.
    #[arg(long)]
    max_batches: Option<usize>,
    /// Table or view with resource_id, actor_id, actor_kind, source_url, created_at.
    #[arg(long, default_value = DEFAULT_SOURCE_TABLE)]
    source_table: String,
    /// Event type recorded for each row.
    #[arg(long, default_value = "artifact_created")]
    event_type: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let event_type = EventType::parse(&args.event_type)
        .ok_or_else(|| anyhow!("unknown event type: {}", args.event_type))?;
    let database_url = std::env::var("DATABASE_URL")
        .or_else(|_| std::env::var("DB_URL"))
        .context("DATABASE_URL is required")?;

    let db = Arc::new(EntitlementDb::connect(database_url.as_str(), BACKFILL_POOL_SIZE).await?);
    db.migrate().await?;
    let source = PostgresHistoricalSource::new(Arc::clone(&db), &args.source_table, event_type)?;
    let ledger = store::postgres(db);

    let report = run_backfill(
        &source,
        ledger.as_ref(),
        BackfillOptions {
            batch_size: args.batch_size,
            resume_cursor: args.resume_cursor,
            max_batches: args.max_batches,
        },
    )
    .await?;

    tracing::info!(
        scanned = report.scanned,
        inserted = report.inserted,
        skipped_existing = report.skipped_existing,
        failed = report.failed,
        exhausted = report.exhausted,
        "backfill finished"
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.exhausted {
        if let Some(cursor) = report.next_cursor.as_deref() {
            eprintln!("resume with --resume-cursor {cursor}");
        }
    }
    Ok(())
}
