use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::PoolError;
use tokio::sync::Mutex;

use crate::db::{EntitlementDb, is_unavailable};
use crate::ledger::types::{EventType, UsageEvent, UsageMetadata};

#[derive(Debug, thiserror::Error)]
pub enum LedgerStoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("db error: {0}")]
    Db(String),
}

impl From<tokio_postgres::Error> for LedgerStoreError {
    fn from(error: tokio_postgres::Error) -> Self {
        if is_unavailable(&error) {
            Self::Unavailable(error.to_string())
        } else {
            Self::Db(error.to_string())
        }
    }
}

impl From<PoolError> for LedgerStoreError {
    fn from(error: PoolError) -> Self {
        Self::Unavailable(error.to_string())
    }
}

/// Count-then-insert request evaluated as one unit of work per actor.
#[derive(Debug, Clone)]
pub struct RecordRequest {
    pub event: UsageEvent,
    pub window_start: DateTime<Utc>,
    /// `None` records unconditionally.
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded { count: u64 },
    LimitReached { count: u64 },
    /// The idempotency key was already recorded for this actor.
    AlreadyRecorded { count: u64 },
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    fn driver_name(&self) -> &'static str;

    async fn record_if_under_limit(
        &self,
        request: RecordRequest,
    ) -> Result<RecordOutcome, LedgerStoreError>;

    /// Inserts an event carrying an idempotency key unless one already exists.
    /// Returns `false` when the key was already present.
    async fn insert_if_absent(&self, event: UsageEvent) -> Result<bool, LedgerStoreError>;

    async fn count_since(
        &self,
        actor_id: &str,
        event_type: EventType,
        window_start: DateTime<Utc>,
    ) -> Result<u64, LedgerStoreError>;

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<UsageEvent>, LedgerStoreError>;

    async fn list_for_actor(&self, actor_id: &str) -> Result<Vec<UsageEvent>, LedgerStoreError>;

    async fn ping(&self) -> Result<(), LedgerStoreError>;
}

pub fn memory() -> Arc<dyn LedgerStore> {
    Arc::new(MemoryLedgerStore::default())
}

pub fn postgres(db: Arc<EntitlementDb>) -> Arc<dyn LedgerStore> {
    Arc::new(PostgresLedgerStore { db })
}

type ActorEvents = Arc<Mutex<Vec<UsageEvent>>>;

#[derive(Default)]
struct MemoryLedgerStore {
    actors: Mutex<HashMap<String, ActorEvents>>,
    by_idempotency_key: Mutex<HashMap<String, UsageEvent>>,
}

impl MemoryLedgerStore {
    async fn actor_events(&self, actor_id: &str) -> ActorEvents {
        let mut actors = self.actors.lock().await;
        actors.entry(actor_id.to_string()).or_default().clone()
    }

    /// Read paths never create a shard for an unknown actor.
    async fn existing_actor_events(&self, actor_id: &str) -> Option<ActorEvents> {
        self.actors.lock().await.get(actor_id).cloned()
    }
}

fn count_window(events: &[UsageEvent], event_type: EventType, window_start: DateTime<Utc>) -> u64 {
    events
        .iter()
        .filter(|event| event.event_type() == event_type && event.created_at >= window_start)
        .count() as u64
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    fn driver_name(&self) -> &'static str {
        "memory"
    }

    async fn record_if_under_limit(
        &self,
        request: RecordRequest,
    ) -> Result<RecordOutcome, LedgerStoreError> {
        let RecordRequest {
            event,
            window_start,
            limit,
        } = request;
        let shard = self.actor_events(&event.actor_id).await;
        let mut events = shard.lock().await;
        let count = count_window(&events, event.event_type(), window_start);

        let key = event.idempotency_key();
        let mut keys = self.by_idempotency_key.lock().await;
        if let Some(existing) = key.as_deref().and_then(|key| keys.get(key)) {
            if existing.actor_id != event.actor_id {
                return Err(LedgerStoreError::Conflict(
                    "resource_id already recorded for a different actor".to_string(),
                ));
            }
            return Ok(RecordOutcome::AlreadyRecorded { count });
        }

        if limit.is_some_and(|limit| count >= limit) {
            return Ok(RecordOutcome::LimitReached { count });
        }

        if let Some(key) = key {
            keys.insert(key, event.clone());
        }
        events.push(event);
        Ok(RecordOutcome::Recorded { count: count + 1 })
    }

    async fn insert_if_absent(&self, event: UsageEvent) -> Result<bool, LedgerStoreError> {
        let Some(key) = event.idempotency_key() else {
            return Err(LedgerStoreError::Conflict(
                "idempotent insert requires a resource_id".to_string(),
            ));
        };
        let shard = self.actor_events(&event.actor_id).await;
        let mut events = shard.lock().await;
        let mut keys = self.by_idempotency_key.lock().await;
        if keys.contains_key(&key) {
            return Ok(false);
        }
        keys.insert(key, event.clone());
        events.push(event);
        Ok(true)
    }

    async fn count_since(
        &self,
        actor_id: &str,
        event_type: EventType,
        window_start: DateTime<Utc>,
    ) -> Result<u64, LedgerStoreError> {
        let Some(shard) = self.existing_actor_events(actor_id).await else {
            return Ok(0);
        };
        let events = shard.lock().await;
        Ok(count_window(&events, event_type, window_start))
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<UsageEvent>, LedgerStoreError> {
        let keys = self.by_idempotency_key.lock().await;
        Ok(keys.get(key).cloned())
    }

    async fn list_for_actor(&self, actor_id: &str) -> Result<Vec<UsageEvent>, LedgerStoreError> {
        let Some(shard) = self.existing_actor_events(actor_id).await else {
            return Ok(Vec::new());
        };
        let events = shard.lock().await;
        Ok(events.clone())
    }

    async fn ping(&self) -> Result<(), LedgerStoreError> {
        Ok(())
    }
}

struct PostgresLedgerStore {
    db: Arc<EntitlementDb>,
}

pub(super) const ACTOR_LOCK_SQL: &str = "SELECT pg_advisory_xact_lock(hashtextextended($1, 0))";

const COUNT_WINDOW_SQL: &str = r#"
    SELECT COUNT(*)::BIGINT AS event_count
      FROM entitlement.usage_events
     WHERE actor_id = $1 AND event_type = $2 AND created_at >= $3
"#;

pub(super) const INSERT_EVENT_SQL: &str = r#"
    INSERT INTO entitlement.usage_events (
        event_id, actor_id, event_type, resource_id, idempotency_key, metadata, created_at
    ) VALUES ($1,$2,$3,$4,$5,$6,$7)
    ON CONFLICT (idempotency_key) DO NOTHING
"#;

const SELECT_KEY_OWNER_SQL: &str =
    "SELECT actor_id FROM entitlement.usage_events WHERE idempotency_key = $1";

fn already_recorded(
    owner: &str,
    actor_id: &str,
    count: u64,
) -> Result<RecordOutcome, LedgerStoreError> {
    if owner != actor_id {
        return Err(LedgerStoreError::Conflict(
            "resource_id already recorded for a different actor".to_string(),
        ));
    }
    Ok(RecordOutcome::AlreadyRecorded { count })
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    fn driver_name(&self) -> &'static str {
        "postgres"
    }

    async fn record_if_under_limit(
        &self,
        request: RecordRequest,
    ) -> Result<RecordOutcome, LedgerStoreError> {
        let RecordRequest {
            event,
            window_start,
            limit,
        } = request;
        let metadata = event
            .metadata
            .to_value()
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
        let key = event.idempotency_key();

        let mut client = self.db.client().await?;
        let tx = client.transaction().await?;
        // Serializes every count-then-insert for this actor until commit.
        tx.execute(ACTOR_LOCK_SQL, &[&event.actor_id]).await?;

        let count_row = tx
            .query_one(
                COUNT_WINDOW_SQL,
                &[&event.actor_id, &event.event_type().as_str(), &window_start],
            )
            .await?;
        let count = u64::try_from(count_row.try_get::<_, i64>("event_count")?).unwrap_or(0);

        if let Some(key) = key.as_deref() {
            let existing = tx.query_opt(SELECT_KEY_OWNER_SQL, &[&key]).await?;
            if let Some(row) = existing {
                let owner: String = row.try_get("actor_id")?;
                tx.commit().await?;
                return already_recorded(&owner, &event.actor_id, count);
            }
        }

        if limit.is_some_and(|limit| count >= limit) {
            tx.commit().await?;
            return Ok(RecordOutcome::LimitReached { count });
        }

        let inserted = tx
            .execute(
                INSERT_EVENT_SQL,
                &[
                    &event.event_id,
                    &event.actor_id,
                    &event.event_type().as_str(),
                    &event.resource_id,
                    &key,
                    &metadata,
                    &event.created_at,
                ],
            )
            .await?;

        if inserted == 0 {
            // Lost a race on the idempotency key to a writer holding a different
            // actor lock; its row is committed and visible to this statement.
            let row = tx.query_opt(SELECT_KEY_OWNER_SQL, &[&key]).await?;
            tx.commit().await?;
            let Some(row) = row else {
                return Err(LedgerStoreError::Db(
                    "idempotency key conflict without a visible owner".to_string(),
                ));
            };
            let owner: String = row.try_get("actor_id")?;
            return already_recorded(&owner, &event.actor_id, count);
        }
        tx.commit().await?;
        Ok(RecordOutcome::Recorded { count: count + 1 })
    }

    async fn insert_if_absent(&self, event: UsageEvent) -> Result<bool, LedgerStoreError> {
        let Some(key) = event.idempotency_key() else {
            return Err(LedgerStoreError::Conflict(
                "idempotent insert requires a resource_id".to_string(),
            ));
        };
        let metadata = event
            .metadata
            .to_value()
            .map_err(|error| LedgerStoreError::Db(error.to_string()))?;

        let mut client = self.db.client().await?;
        let tx = client.transaction().await?;
        tx.execute(ACTOR_LOCK_SQL, &[&event.actor_id]).await?;
        let inserted = tx
            .execute(
                INSERT_EVENT_SQL,
                &[
                    &event.event_id,
                    &event.actor_id,
                    &event.event_type().as_str(),
                    &event.resource_id,
                    &Some(key),
                    &metadata,
                    &event.created_at,
                ],
            )
            .await?;
        tx.commit().await?;
        Ok(inserted == 1)
    }

    async fn count_since(
        &self,
        actor_id: &str,
        event_type: EventType,
        window_start: DateTime<Utc>,
    ) -> Result<u64, LedgerStoreError> {
        let client = self.db.client().await?;
        let row = client
            .query_one(
                COUNT_WINDOW_SQL,
                &[&actor_id, &event_type.as_str(), &window_start],
            )
            .await?;
        Ok(u64::try_from(row.try_get::<_, i64>("event_count")?).unwrap_or(0))
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<UsageEvent>, LedgerStoreError> {
        let client = self.db.client().await?;
        let row = client
            .query_opt(
                r#"
                SELECT event_id, actor_id, event_type, resource_id, metadata, created_at
                  FROM entitlement.usage_events
                 WHERE idempotency_key = $1
                "#,
                &[&key],
            )
            .await?;
        row.as_ref().map(map_event_row).transpose()
    }

    async fn list_for_actor(&self, actor_id: &str) -> Result<Vec<UsageEvent>, LedgerStoreError> {
        let client = self.db.client().await?;
        let rows = client
            .query(
                r#"
                SELECT event_id, actor_id, event_type, resource_id, metadata, created_at
                  FROM entitlement.usage_events
                 WHERE actor_id = $1
                 ORDER BY created_at ASC, event_id ASC
                "#,
                &[&actor_id],
            )
            .await?;
        rows.iter().map(map_event_row).collect()
    }

    async fn ping(&self) -> Result<(), LedgerStoreError> {
        let client = self.db.client().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }
}

fn map_event_row(row: &tokio_postgres::Row) -> Result<UsageEvent, LedgerStoreError> {
    let event_type: String = row.try_get("event_type")?;
    let metadata = UsageMetadata::from_parts(&event_type, row.try_get("metadata")?)
        .map_err(|error| LedgerStoreError::Db(error.to_string()))?;
    Ok(UsageEvent {
        event_id: row.try_get("event_id")?,
        actor_id: row.try_get("actor_id")?,
        resource_id: row.try_get("resource_id")?,
        metadata,
        created_at: row.try_get("created_at")?,
    })
}
