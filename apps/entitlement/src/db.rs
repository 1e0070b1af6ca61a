use std::time::Duration;

use anyhow::{Context, Result};
use deadpool_postgres::{
    Manager, ManagerConfig, Object, Pool, PoolError, RecyclingMethod, Runtime,
};
use tokio_postgres::NoTls;

const SCHEMA_SQL: &str = r#"
CREATE SCHEMA IF NOT EXISTS entitlement;

CREATE TABLE IF NOT EXISTS entitlement.actors (
    actor_id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    tier TEXT NOT NULL,
    tier_effective_at TIMESTAMPTZ NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS entitlement.usage_events (
    event_id TEXT PRIMARY KEY,
    actor_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    resource_id TEXT NULL,
    idempotency_key TEXT NULL UNIQUE,
    metadata JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS usage_events_actor_window_idx
    ON entitlement.usage_events (actor_id, event_type, created_at);

CREATE TABLE IF NOT EXISTS entitlement.state_change_events (
    provider TEXT NOT NULL,
    external_event_id TEXT NOT NULL,
    actor_id TEXT NOT NULL,
    tier TEXT NOT NULL,
    applied_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (provider, external_event_id)
);

CREATE TABLE IF NOT EXISTS entitlement.progress (
    task_id TEXT PRIMARY KEY,
    stage TEXT NOT NULL,
    sequence BIGINT NOT NULL,
    payload JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS progress_expires_idx
    ON entitlement.progress (expires_at);
"#;

pub const DEFAULT_POOL_SIZE: usize = 16;

/// Pooled Postgres access. Each unit of work checks out its own connection, so
/// only row and advisory locks serialize writers.
#[derive(Clone)]
pub struct EntitlementDb {
    pool: Pool,
}

impl EntitlementDb {
    pub async fn connect(database_url: &str, pool_size: usize) -> Result<Self> {
        let pg_config: tokio_postgres::Config =
            database_url.parse().context("parse postgres url")?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(pool_size.max(1))
            .wait_timeout(Some(POOL_WAIT_TIMEOUT))
            .runtime(Runtime::Tokio1)
            .build()
            .context("build postgres pool")?;

        // Fail at startup rather than on the first request.
        drop(pool.get().await.context("connect to postgres")?);
        Ok(Self { pool })
    }

    pub async fn client(&self) -> Result<Object, PoolError> {
        self.pool.get().await
    }

    /// Idempotent; safe to run on every boot.
    pub async fn migrate(&self) -> Result<()> {
        let client = self.client().await.context("connect to postgres")?;
        client
            .batch_execute(SCHEMA_SQL)
            .await
            .context("apply entitlement schema")?;
        Ok(())
    }
}

const POOL_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn is_unavailable(error: &tokio_postgres::Error) -> bool {
    error.is_closed() || error.code().is_none()
}
