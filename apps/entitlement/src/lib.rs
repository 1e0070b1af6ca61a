#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    actors::ActorStore,
    config::{Config, LogFormat},
    db::EntitlementDb,
    entitlement::EntitlementService,
    ledger::LedgerStore,
    policy::PolicyTable,
    progress::{ProgressStore, ProgressTracker},
    server::{AppState, build_router},
    webhook::StateChangeIngest,
};

pub mod actors;
pub mod backfill;
pub mod config;
pub mod db;
pub mod entitlement;
pub mod identity;
pub mod ledger;
pub mod policy;
pub mod progress;
pub mod server;
pub mod webhook;

/// Storage backends shared by every service in the process.
#[derive(Clone)]
pub struct Stores {
    pub ledger: Arc<dyn LedgerStore>,
    pub actors: Arc<dyn ActorStore>,
    pub progress: Arc<dyn ProgressStore>,
}

impl Stores {
    pub fn memory() -> Self {
        Self {
            ledger: ledger::store::memory(),
            actors: actors::memory(),
            progress: progress::store::memory(),
        }
    }

    pub fn postgres(db: Arc<EntitlementDb>) -> Self {
        Self {
            ledger: ledger::store::postgres(Arc::clone(&db)),
            actors: actors::postgres(Arc::clone(&db)),
            progress: progress::store::postgres(db),
        }
    }
}

pub fn build_state_with_stores(config: Config, stores: Stores) -> AppState {
    let policy = Arc::new(PolicyTable::from_limits(&config.policy_limits));
    let entitlements = EntitlementService::new(
        stores.ledger,
        Arc::clone(&stores.actors),
        Arc::clone(&policy),
    );
    let ingest = StateChangeIngest::new(
        stores.actors,
        policy,
        config.webhook_secrets.clone(),
        config.webhook_tolerance_seconds,
    );
    let progress = ProgressTracker::new(stores.progress, config.progress_ttl_seconds);
    AppState::new(config, entitlements, ingest, progress)
}

pub async fn build_state(config: Config) -> Result<AppState> {
    let stores = match config.db_url.clone() {
        Some(url) => {
            let db = Arc::new(EntitlementDb::connect(url.as_str(), config.db_pool_size).await?);
            db.migrate().await?;
            Stores::postgres(db)
        }
        None => {
            tracing::warn!("no database configured; usage is kept in memory and lost on restart");
            Stores::memory()
        }
    };
    Ok(build_state_with_stores(config, stores))
}

pub async fn build_app(config: Config) -> Result<axum::Router> {
    Ok(build_router(build_state(config).await?))
}

pub fn init_tracing(format: &LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

pub async fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(
        service = %config.service_name,
        bind_addr = %config.bind_addr,
        "entitlement service listening"
    );
    let sweep_interval = config.progress_sweep_interval_seconds;
    let state = build_state(config).await?;
    let sweeper = (sweep_interval > 0)
        .then(|| state.progress().spawn_sweeper(Duration::from_secs(sweep_interval)));

    let result = axum::serve(listener, build_router(state)).await;
    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    result?;
    Ok(())
}
