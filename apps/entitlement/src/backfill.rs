//! Re-derives usage events from historical resource rows.
//!
//! Inserts share the organic idempotency key, so a rerun or a race with live
//! traffic records each resource at most once.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::PoolError;
use serde::Serialize;

use crate::db::EntitlementDb;
use crate::identity::{ANONYMOUS_ACTOR_PREFIX, ActorKind};
use crate::ledger::{
    ArtifactCreatedMetadata, EventOrigin, EventType, LedgerStore, LedgerStoreError,
    TranscriptRequestedMetadata, UsageEvent, UsageMetadata,
};

pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const MAX_BATCH_SIZE: usize = 10_000;
pub const DEFAULT_SOURCE_TABLE: &str = "summaries";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoricalRecord {
    pub resource_id: String,
    pub actor_id: String,
    pub actor_kind: ActorKind,
    pub event_type: EventType,
    pub source_url: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    #[error("invalid source table: {0}")]
    InvalidSourceTable(String),
    #[error("source read failed: {0}")]
    Source(String),
    #[error("ledger unavailable: {0}")]
    Ledger(String),
}

impl From<tokio_postgres::Error> for BackfillError {
    fn from(error: tokio_postgres::Error) -> Self {
        Self::Source(error.to_string())
    }
}

impl From<PoolError> for BackfillError {
    fn from(error: PoolError) -> Self {
        Self::Source(error.to_string())
    }
}

#[async_trait]
pub trait HistoricalSource: Send + Sync {
    /// Records ordered by `resource_id`, strictly after `after`.
    async fn fetch_batch(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<HistoricalRecord>, BackfillError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillOptions {
    pub batch_size: usize,
    pub resume_cursor: Option<String>,
    pub max_batches: Option<usize>,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            resume_cursor: None,
            max_batches: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub batches: usize,
    pub scanned: u64,
    pub inserted: u64,
    pub skipped_existing: u64,
    pub failed: u64,
    /// Pass back as `resume_cursor` to continue after the last processed record.
    pub next_cursor: Option<String>,
    pub exhausted: bool,
}

enum RecordResult {
    Inserted,
    Existing,
}

pub async fn run_backfill(
    source: &dyn HistoricalSource,
    ledger: &dyn LedgerStore,
    options: BackfillOptions,
) -> Result<BackfillReport, BackfillError> {
    let batch_size = options.batch_size.clamp(1, MAX_BATCH_SIZE);
    let mut report = BackfillReport {
        next_cursor: options.resume_cursor,
        ..BackfillReport::default()
    };

    loop {
        if options
            .max_batches
            .is_some_and(|max_batches| report.batches >= max_batches)
        {
            break;
        }

        let batch = source
            .fetch_batch(report.next_cursor.as_deref(), batch_size)
            .await?;
        if batch.is_empty() {
            report.exhausted = true;
            break;
        }
        let batch_len = batch.len();

        for record in batch {
            report.scanned += 1;
            let resource_id = record.resource_id.clone();
            match backfill_record(ledger, record).await {
                Ok(RecordResult::Inserted) => report.inserted += 1,
                Ok(RecordResult::Existing) => report.skipped_existing += 1,
                Err(RecordFailure::Fatal(message)) => {
                    tracing::error!(
                        cursor = report.next_cursor.as_deref().unwrap_or(""),
                        reason = %message,
                        "backfill aborted; rerun with the reported cursor"
                    );
                    return Err(BackfillError::Ledger(message));
                }
                Err(RecordFailure::Skipped(message)) => {
                    report.failed += 1;
                    tracing::warn!(
                        resource_id = %resource_id,
                        reason = %message,
                        "backfill record skipped"
                    );
                }
            }
            report.next_cursor = Some(resource_id);
        }

        report.batches += 1;
        tracing::info!(
            batch = report.batches,
            scanned = report.scanned,
            inserted = report.inserted,
            skipped_existing = report.skipped_existing,
            failed = report.failed,
            cursor = report.next_cursor.as_deref().unwrap_or(""),
            "backfill batch complete"
        );

        if batch_len < batch_size {
            report.exhausted = true;
            break;
        }
    }

    Ok(report)
}

enum RecordFailure {
    /// The ledger cannot be reached; continuing would only skip more records.
    Fatal(String),
    Skipped(String),
}

async fn backfill_record(
    ledger: &dyn LedgerStore,
    record: HistoricalRecord,
) -> Result<RecordResult, RecordFailure> {
    if record.actor_kind == ActorKind::Registered
        && record.actor_id.starts_with(ANONYMOUS_ACTOR_PREFIX)
    {
        return Err(RecordFailure::Skipped(format!(
            "registered actor id uses reserved prefix: {}",
            record.actor_id
        )));
    }

    let metadata = match record.event_type {
        EventType::ArtifactCreated => UsageMetadata::ArtifactCreated(ArtifactCreatedMetadata {
            source_url: record.source_url,
            origin: EventOrigin::Backfill,
        }),
        EventType::TranscriptRequested => {
            UsageMetadata::TranscriptRequested(TranscriptRequestedMetadata {
                source_url: record.source_url,
                language: None,
                origin: EventOrigin::Backfill,
            })
        }
    };
    let event = UsageEvent::new(
        &record.actor_id,
        Some(&record.resource_id),
        metadata,
        record.created_at,
    )
    .map_err(|error| RecordFailure::Skipped(error.to_string()))?;

    match ledger.insert_if_absent(event).await {
        Ok(true) => Ok(RecordResult::Inserted),
        Ok(false) => Ok(RecordResult::Existing),
        Err(LedgerStoreError::Unavailable(message)) => Err(RecordFailure::Fatal(message)),
        Err(error) => Err(RecordFailure::Skipped(error.to_string())),
    }
}

/// Fixed set of records, used by tests and dry runs.
pub struct MemoryHistoricalSource {
    records: Vec<HistoricalRecord>,
}

impl MemoryHistoricalSource {
    pub fn new(mut records: Vec<HistoricalRecord>) -> Self {
        records.sort_by(|left, right| left.resource_id.cmp(&right.resource_id));
        Self { records }
    }
}

#[async_trait]
impl HistoricalSource for MemoryHistoricalSource {
    async fn fetch_batch(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<HistoricalRecord>, BackfillError> {
        Ok(self
            .records
            .iter()
            .filter(|record| after.is_none_or(|after| record.resource_id.as_str() > after))
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Reads a table or view exposing
/// `resource_id, actor_id, actor_kind, source_url, created_at`.
pub struct PostgresHistoricalSource {
    db: Arc<EntitlementDb>,
    query: String,
    event_type: EventType,
}

impl PostgresHistoricalSource {
    pub fn new(
        db: Arc<EntitlementDb>,
        table: &str,
        event_type: EventType,
    ) -> Result<Self, BackfillError> {
        let table = validate_table_name(table)?;
        let query = format!(
            "SELECT resource_id::TEXT AS resource_id, actor_id::TEXT AS actor_id, \
                    actor_kind::TEXT AS actor_kind, source_url::TEXT AS source_url, created_at \
               FROM {table} \
              WHERE ($1::TEXT IS NULL OR resource_id::TEXT > $1::TEXT) \
              ORDER BY resource_id::TEXT ASC \
              LIMIT $2"
        );
        Ok(Self {
            db,
            query,
            event_type,
        })
    }
}

#[async_trait]
impl HistoricalSource for PostgresHistoricalSource {
    async fn fetch_batch(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<HistoricalRecord>, BackfillError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let client = self.db.client().await?;
        let rows = client.query(self.query.as_str(), &[&after, &limit]).await?;
        rows.iter()
            .map(|row| -> Result<HistoricalRecord, BackfillError> {
                let actor_kind: String = row.try_get("actor_kind")?;
                let actor_kind = ActorKind::parse(&actor_kind).ok_or_else(|| {
                    BackfillError::Source(format!("unknown actor_kind: {actor_kind}"))
                })?;
                Ok(HistoricalRecord {
                    resource_id: row.try_get("resource_id")?,
                    actor_id: row.try_get("actor_id")?,
                    actor_kind,
                    event_type: self.event_type,
                    source_url: row.try_get("source_url")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}

/// Accepts `table` or `schema.table` made of ASCII identifier characters.
pub fn validate_table_name(raw: &str) -> Result<String, BackfillError> {
    let raw = raw.trim();
    let parts: Vec<&str> = raw.split('.').collect();
    let valid = (1..=2).contains(&parts.len())
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            chars
                .next()
                .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
                && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        });
    if !valid {
        return Err(BackfillError::InvalidSourceTable(raw.to_string()));
    }
    Ok(raw.to_string())
}
