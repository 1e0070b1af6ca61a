//! Actor records and the seen-events set consumed by state-change ingest.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::PoolError;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::db::{EntitlementDb, is_unavailable};
use crate::identity::{ActorKey, ActorKind};
use crate::policy::{TIER_ANONYMOUS, TIER_FREE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActorRecord {
    pub actor_id: String,
    pub kind: ActorKind,
    pub tier: String,
    pub tier_effective_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ActorRecord {
    pub fn key(&self) -> ActorKey {
        ActorKey {
            kind: self.kind,
            id: self.actor_id.clone(),
        }
    }
}

pub fn default_tier(kind: ActorKind) -> &'static str {
    match kind {
        ActorKind::Registered => TIER_FREE,
        ActorKind::AnonymousFingerprint => TIER_ANONYMOUS,
    }
}

/// A verified external state change, keyed by `(provider, external_event_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChangeRecord {
    pub provider: String,
    pub external_event_id: String,
    pub actor_id: String,
    pub tier: String,
    pub applied_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChangeResult {
    Applied(ActorRecord),
    Duplicate,
}

#[derive(Debug, thiserror::Error)]
pub enum ActorStoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("db error: {0}")]
    Db(String),
}

impl From<tokio_postgres::Error> for ActorStoreError {
    fn from(error: tokio_postgres::Error) -> Self {
        if is_unavailable(&error) {
            Self::Unavailable(error.to_string())
        } else {
            Self::Db(error.to_string())
        }
    }
}

impl From<PoolError> for ActorStoreError {
    fn from(error: PoolError) -> Self {
        Self::Unavailable(error.to_string())
    }
}

#[async_trait]
pub trait ActorStore: Send + Sync {
    /// Returns the existing actor or creates it with the kind's default tier.
    async fn ensure_actor(
        &self,
        key: &ActorKey,
        now: DateTime<Utc>,
    ) -> Result<ActorRecord, ActorStoreError>;

    async fn get_actor(&self, actor_id: &str) -> Result<Option<ActorRecord>, ActorStoreError>;

    /// Marks the event as seen and applies the tier change in one atomic step.
    /// A repeat of the same `(provider, external_event_id)` has no effect.
    async fn apply_state_change(
        &self,
        change: StateChangeRecord,
    ) -> Result<StateChangeResult, ActorStoreError>;

    async fn get_state_change(
        &self,
        provider: &str,
        external_event_id: &str,
    ) -> Result<Option<StateChangeRecord>, ActorStoreError>;

    async fn ping(&self) -> Result<(), ActorStoreError>;
}

pub fn memory() -> Arc<dyn ActorStore> {
    Arc::new(MemoryActorStore::default())
}

pub fn postgres(db: Arc<EntitlementDb>) -> Arc<dyn ActorStore> {
    Arc::new(PostgresActorStore { db })
}

#[derive(Default)]
struct MemoryActorStore {
    inner: Mutex<MemoryActorStoreInner>,
}

#[derive(Default)]
struct MemoryActorStoreInner {
    actors: HashMap<String, ActorRecord>,
    seen_events: HashMap<(String, String), StateChangeRecord>,
}

#[async_trait]
impl ActorStore for MemoryActorStore {
    async fn ensure_actor(
        &self,
        key: &ActorKey,
        now: DateTime<Utc>,
    ) -> Result<ActorRecord, ActorStoreError> {
        let mut inner = self.inner.lock().await;
        let record = inner
            .actors
            .entry(key.id.clone())
            .or_insert_with(|| ActorRecord {
                actor_id: key.id.clone(),
                kind: key.kind,
                tier: default_tier(key.kind).to_string(),
                tier_effective_at: now,
                created_at: now,
            });
        Ok(record.clone())
    }

    async fn get_actor(&self, actor_id: &str) -> Result<Option<ActorRecord>, ActorStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.actors.get(actor_id).cloned())
    }

    async fn apply_state_change(
        &self,
        change: StateChangeRecord,
    ) -> Result<StateChangeResult, ActorStoreError> {
        let mut inner = self.inner.lock().await;
        let seen_key = (change.provider.clone(), change.external_event_id.clone());
        if inner.seen_events.contains_key(&seen_key) {
            return Ok(StateChangeResult::Duplicate);
        }

        let actor = inner
            .actors
            .entry(change.actor_id.clone())
            .or_insert_with(|| ActorRecord {
                actor_id: change.actor_id.clone(),
                kind: ActorKind::Registered,
                tier: change.tier.clone(),
                tier_effective_at: change.applied_at,
                created_at: change.applied_at,
            });
        actor.tier = change.tier.clone();
        actor.tier_effective_at = change.applied_at;
        let actor = actor.clone();
        inner.seen_events.insert(seen_key, change);
        Ok(StateChangeResult::Applied(actor))
    }

    async fn get_state_change(
        &self,
        provider: &str,
        external_event_id: &str,
    ) -> Result<Option<StateChangeRecord>, ActorStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .seen_events
            .get(&(provider.to_string(), external_event_id.to_string()))
            .cloned())
    }

    async fn ping(&self) -> Result<(), ActorStoreError> {
        Ok(())
    }
}

struct PostgresActorStore {
    db: Arc<EntitlementDb>,
}

#[async_trait]
impl ActorStore for PostgresActorStore {
    async fn ensure_actor(
        &self,
        key: &ActorKey,
        now: DateTime<Utc>,
    ) -> Result<ActorRecord, ActorStoreError> {
        let client = self.db.client().await?;
        client
            .execute(
                r#"
                INSERT INTO entitlement.actors (actor_id, kind, tier, tier_effective_at, created_at)
                VALUES ($1,$2,$3,$4,$4)
                ON CONFLICT (actor_id) DO NOTHING
                "#,
                &[
                    &key.id,
                    &key.kind.as_str(),
                    &default_tier(key.kind),
                    &now,
                ],
            )
            .await?;
        let row = client
            .query_one(
                r#"
                SELECT actor_id, kind, tier, tier_effective_at, created_at
                  FROM entitlement.actors
                 WHERE actor_id = $1
                "#,
                &[&key.id],
            )
            .await?;
        map_actor_row(&row)
    }

    async fn get_actor(&self, actor_id: &str) -> Result<Option<ActorRecord>, ActorStoreError> {
        let client = self.db.client().await?;
        let row = client
            .query_opt(
                r#"
                SELECT actor_id, kind, tier, tier_effective_at, created_at
                  FROM entitlement.actors
                 WHERE actor_id = $1
                "#,
                &[&actor_id],
            )
            .await?;
        row.as_ref().map(map_actor_row).transpose()
    }

    async fn apply_state_change(
        &self,
        change: StateChangeRecord,
    ) -> Result<StateChangeResult, ActorStoreError> {
        let mut client = self.db.client().await?;
        let tx = client.transaction().await?;

        let inserted = tx
            .execute(
                r#"
                INSERT INTO entitlement.state_change_events (
                    provider, external_event_id, actor_id, tier, applied_at
                ) VALUES ($1,$2,$3,$4,$5)
                ON CONFLICT (provider, external_event_id) DO NOTHING
                "#,
                &[
                    &change.provider,
                    &change.external_event_id,
                    &change.actor_id,
                    &change.tier,
                    &change.applied_at,
                ],
            )
            .await?;
        if inserted == 0 {
            tx.rollback().await?;
            return Ok(StateChangeResult::Duplicate);
        }

        let row = tx
            .query_one(
                r#"
                INSERT INTO entitlement.actors (actor_id, kind, tier, tier_effective_at, created_at)
                VALUES ($1,$2,$3,$4,$4)
                ON CONFLICT (actor_id) DO UPDATE
                   SET tier = EXCLUDED.tier,
                       tier_effective_at = EXCLUDED.tier_effective_at
                RETURNING actor_id, kind, tier, tier_effective_at, created_at
                "#,
                &[
                    &change.actor_id,
                    &ActorKind::Registered.as_str(),
                    &change.tier,
                    &change.applied_at,
                ],
            )
            .await?;
        let actor = map_actor_row(&row)?;
        tx.commit().await?;
        Ok(StateChangeResult::Applied(actor))
    }

    async fn get_state_change(
        &self,
        provider: &str,
        external_event_id: &str,
    ) -> Result<Option<StateChangeRecord>, ActorStoreError> {
        let client = self.db.client().await?;
        let row = client
            .query_opt(
                r#"
                SELECT provider, external_event_id, actor_id, tier, applied_at
                  FROM entitlement.state_change_events
                 WHERE provider = $1 AND external_event_id = $2
                "#,
                &[&provider, &external_event_id],
            )
            .await?;
        row.map(|row| -> Result<StateChangeRecord, ActorStoreError> {
            Ok(StateChangeRecord {
                provider: row.try_get("provider")?,
                external_event_id: row.try_get("external_event_id")?,
                actor_id: row.try_get("actor_id")?,
                tier: row.try_get("tier")?,
                applied_at: row.try_get("applied_at")?,
            })
        })
        .transpose()
    }

    async fn ping(&self) -> Result<(), ActorStoreError> {
        let client = self.db.client().await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }
}

fn map_actor_row(row: &tokio_postgres::Row) -> Result<ActorRecord, ActorStoreError> {
    let kind: String = row.try_get("kind")?;
    let kind = ActorKind::parse(&kind)
        .ok_or_else(|| ActorStoreError::Db(format!("unknown actor kind: {kind}")))?;
    Ok(ActorRecord {
        actor_id: row.try_get("actor_id")?,
        kind,
        tier: row.try_get("tier")?,
        tier_effective_at: row.try_get("tier_effective_at")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use chrono::{Duration, Utc};

    use super::{StateChangeRecord, StateChangeResult, memory};
    use crate::identity::{ActorKey, ActorKind};

    #[tokio::test]
    async fn ensure_actor_assigns_default_tier_once() -> Result<()> {
        let store = memory();
        let now = Utc::now();
        let key = ActorKey {
            kind: ActorKind::AnonymousFingerprint,
            id: "anon_abc".to_string(),
        };
        let first = store.ensure_actor(&key, now).await?;
        assert_eq!(first.tier, "anonymous");

        let later = store.ensure_actor(&key, now + Duration::hours(1)).await?;
        assert_eq!(later.created_at, first.created_at);
        Ok(())
    }

    #[tokio::test]
    async fn repeated_state_change_is_a_no_op() -> Result<()> {
        let store = memory();
        let applied_at = Utc::now();
        let change = StateChangeRecord {
            provider: "stripe".to_string(),
            external_event_id: "evt_1".to_string(),
            actor_id: "u1".to_string(),
            tier: "pro".to_string(),
            applied_at,
        };
        let StateChangeResult::Applied(actor) = store.apply_state_change(change.clone()).await?
        else {
            anyhow::bail!("first delivery should apply");
        };
        assert_eq!(actor.tier, "pro");

        let mut replay = change;
        replay.tier = "free".to_string();
        replay.applied_at = applied_at + Duration::minutes(3);
        assert_eq!(
            store.apply_state_change(replay).await?,
            StateChangeResult::Duplicate
        );

        let actor = store.get_actor("u1").await?.expect("actor exists");
        assert_eq!(actor.tier, "pro");
        assert_eq!(actor.tier_effective_at, applied_at);
        Ok(())
    }
}
