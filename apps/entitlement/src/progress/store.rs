use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::PoolError;
use tokio::sync::Mutex;

use crate::db::EntitlementDb;
use crate::progress::{
    ProgressError, ProgressPayload, ProgressRecord, ProgressStage, ProgressUpdate, UpsertOutcome,
    evaluate_transition,
};

impl From<tokio_postgres::Error> for ProgressError {
    fn from(error: tokio_postgres::Error) -> Self {
        Self::StoreUnavailable(error.to_string())
    }
}

impl From<PoolError> for ProgressError {
    fn from(error: PoolError) -> Self {
        Self::StoreUnavailable(error.to_string())
    }
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Evaluates and writes `update` as one step per task.
    async fn apply(
        &self,
        update: ProgressUpdate,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, ProgressError>;

    async fn get_live(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ProgressRecord>, ProgressError>;

    async fn delete(&self, task_id: &str) -> Result<bool, ProgressError>;

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, ProgressError>;

    async fn ping(&self) -> Result<(), ProgressError>;
}

pub fn memory() -> Arc<dyn ProgressStore> {
    Arc::new(MemoryProgressStore::default())
}

pub fn postgres(db: Arc<EntitlementDb>) -> Arc<dyn ProgressStore> {
    Arc::new(PostgresProgressStore { db })
}

fn record_from_update(
    update: ProgressUpdate,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> ProgressRecord {
    ProgressRecord {
        task_id: update.task_id,
        stage: update.stage,
        sequence: update.sequence,
        payload: update.payload,
        updated_at: now,
        expires_at,
    }
}

#[derive(Default)]
struct MemoryProgressStore {
    records: Mutex<HashMap<String, ProgressRecord>>,
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn apply(
        &self,
        update: ProgressUpdate,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, ProgressError> {
        let mut records = self.records.lock().await;
        let current = records
            .get(&update.task_id)
            .filter(|record| record.is_live(now));
        if let Err(reason) = evaluate_transition(current, &update) {
            return Ok(UpsertOutcome::Ignored { reason });
        }
        let record = record_from_update(update, expires_at, now);
        records.insert(record.task_id.clone(), record.clone());
        Ok(UpsertOutcome::Applied { record })
    }

    async fn get_live(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ProgressRecord>, ProgressError> {
        let records = self.records.lock().await;
        Ok(records
            .get(task_id)
            .filter(|record| record.is_live(now))
            .cloned())
    }

    async fn delete(&self, task_id: &str) -> Result<bool, ProgressError> {
        let mut records = self.records.lock().await;
        Ok(records.remove(task_id).is_some())
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, ProgressError> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| record.is_live(now));
        Ok((before - records.len()) as u64)
    }

    async fn ping(&self) -> Result<(), ProgressError> {
        Ok(())
    }
}

struct PostgresProgressStore {
    db: Arc<EntitlementDb>,
}

const SELECT_PROGRESS_SQL: &str = r#"
    SELECT task_id, stage, sequence, payload, updated_at, expires_at
      FROM entitlement.progress
     WHERE task_id = $1 AND expires_at >= $2
"#;

#[async_trait]
impl ProgressStore for PostgresProgressStore {
    async fn apply(
        &self,
        update: ProgressUpdate,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, ProgressError> {
        let mut client = self.db.client().await?;
        let tx = client.transaction().await?;
        tx.execute(
            "SELECT pg_advisory_xact_lock(hashtextextended($1, 1))",
            &[&update.task_id],
        )
        .await?;

        let current = tx
            .query_opt(SELECT_PROGRESS_SQL, &[&update.task_id, &now])
            .await?;
        let current = current.as_ref().map(map_progress_row).transpose()?;
        if let Err(reason) = evaluate_transition(current.as_ref(), &update) {
            tx.commit().await?;
            return Ok(UpsertOutcome::Ignored { reason });
        }

        let record = record_from_update(update, expires_at, now);
        let payload = serde_json::to_value(&record.payload)
            .map_err(|error| ProgressError::InvalidPayload(error.to_string()))?;
        let sequence = i64::try_from(record.sequence)
            .map_err(|_| ProgressError::InvalidPayload("sequence out of range".to_string()))?;
        tx.execute(
            r#"
            INSERT INTO entitlement.progress (task_id, stage, sequence, payload, updated_at, expires_at)
            VALUES ($1,$2,$3,$4,$5,$6)
            ON CONFLICT (task_id) DO UPDATE
               SET stage = EXCLUDED.stage,
                   sequence = EXCLUDED.sequence,
                   payload = EXCLUDED.payload,
                   updated_at = EXCLUDED.updated_at,
                   expires_at = EXCLUDED.expires_at
            "#,
            &[
                &record.task_id,
                &record.stage.as_str(),
                &sequence,
                &payload,
                &record.updated_at,
                &record.expires_at,
            ],
        )
        .await?;
        tx.commit().await?;
        Ok(UpsertOutcome::Applied { record })
    }

    async fn get_live(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ProgressRecord>, ProgressError> {
        let client = self.db.client().await?;
        let row = client.query_opt(SELECT_PROGRESS_SQL, &[&task_id, &now]).await?;
        row.as_ref().map(map_progress_row).transpose()
    }

    async fn delete(&self, task_id: &str) -> Result<bool, ProgressError> {
        let client = self.db.client().await?;
        let deleted = client
            .execute(
                "DELETE FROM entitlement.progress WHERE task_id = $1",
                &[&task_id],
            )
            .await?;
        Ok(deleted > 0)
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, ProgressError> {
        let client = self.db.client().await?;
        let deleted = client
            .execute(
                "DELETE FROM entitlement.progress WHERE expires_at < $1",
                &[&now],
            )
            .await?;
        Ok(deleted)
    }

    async fn ping(&self) -> Result<(), ProgressError> {
        let client = self.db.client().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }
}

fn map_progress_row(row: &tokio_postgres::Row) -> Result<ProgressRecord, ProgressError> {
    let stage: String = row.try_get("stage")?;
    let stage = ProgressStage::parse(&stage)
        .ok_or_else(|| ProgressError::StoreUnavailable(format!("unknown stage: {stage}")))?;
    let payload: ProgressPayload = serde_json::from_value(row.try_get("payload")?)
        .map_err(|error| ProgressError::StoreUnavailable(format!("decode payload: {error}")))?;
    let sequence: i64 = row.try_get("sequence")?;
    Ok(ProgressRecord {
        task_id: row.try_get("task_id")?,
        stage,
        sequence: u64::try_from(sequence).unwrap_or(0),
        payload,
        updated_at: row.try_get("updated_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}
