//! Ephemeral, TTL-bounded progress for long-running jobs. Independent of the
//! usage ledger.

pub mod store;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub use store::ProgressStore;

pub const DEFAULT_TTL_SECONDS: u64 = 4 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStage {
    Queued,
    Running,
    Completed,
    Errored,
}

impl ProgressStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Errored => "errored",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "errored" => Some(Self::Errored),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Running => 1,
            Self::Completed | Self::Errored => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProgressPayload {
    pub percent: u8,
    #[serde(default)]
    pub message: String,
}

impl ProgressPayload {
    pub fn validate(&self) -> Result<(), ProgressError> {
        if self.percent > 100 {
            return Err(ProgressError::InvalidPayload(format!(
                "percent must be within 0..=100, got {}",
                self.percent
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub task_id: String,
    pub stage: ProgressStage,
    pub sequence: u64,
    pub payload: ProgressPayload,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ProgressRecord {
    /// Absent only once `now` is strictly past `expires_at`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now <= self.expires_at
    }

    pub fn ttl_remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}

/// A writer's report for one task. Applied only if it moves the task forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub task_id: String,
    pub stage: ProgressStage,
    pub sequence: u64,
    pub payload: ProgressPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    StaleSequence,
    TerminalStage,
    StageRegression,
}

impl IgnoreReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StaleSequence => "stale_sequence",
            Self::TerminalStage => "terminal_stage",
            Self::StageRegression => "stage_regression",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpsertOutcome {
    Applied { record: ProgressRecord },
    Ignored { reason: IgnoreReason },
}

#[derive(Debug, thiserror::Error)]
pub enum ProgressError {
    #[error("invalid task id")]
    InvalidTaskId,
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl ProgressError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTaskId => "invalid_task_id",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

/// Decides whether `update` may replace `current`. `current` must already be
/// filtered to live records; an expired record behaves as absent.
pub fn evaluate_transition(
    current: Option<&ProgressRecord>,
    update: &ProgressUpdate,
) -> Result<(), IgnoreReason> {
    let Some(current) = current else {
        return Ok(());
    };
    if update.sequence <= current.sequence {
        return Err(IgnoreReason::StaleSequence);
    }
    if current.stage.is_terminal() {
        return Err(IgnoreReason::TerminalStage);
    }
    if update.stage.rank() < current.stage.rank() {
        return Err(IgnoreReason::StageRegression);
    }
    Ok(())
}

#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn ProgressStore>,
    default_ttl: Duration,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn ProgressStore>, default_ttl_seconds: u64) -> Self {
        Self {
            store,
            default_ttl: ttl_from_seconds(default_ttl_seconds),
        }
    }

    pub async fn upsert(
        &self,
        update: ProgressUpdate,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, ProgressError> {
        if update.task_id.trim().is_empty() {
            return Err(ProgressError::InvalidTaskId);
        }
        update.payload.validate()?;
        let ttl = ttl.unwrap_or(self.default_ttl);
        let task_id = update.task_id.clone();
        let outcome = self.store.apply(update, now + ttl, now).await?;
        if let UpsertOutcome::Ignored { reason } = &outcome {
            tracing::debug!(
                task_id = %task_id,
                reason = reason.as_str(),
                "progress update ignored"
            );
        }
        Ok(outcome)
    }

    /// Live record only; an expired record reads as absent.
    pub async fn read(
        &self,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ProgressRecord>, ProgressError> {
        self.store.get_live(task_id, now).await
    }

    pub async fn delete(&self, task_id: &str) -> Result<bool, ProgressError> {
        self.store.delete(task_id).await
    }

    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, ProgressError> {
        self.store.sweep_expired(now).await
    }

    pub async fn ping(&self) -> Result<(), ProgressError> {
        self.store.ping().await
    }

    /// Periodically reclaims expired records until the task is aborted.
    pub fn spawn_sweeper(&self, interval: StdDuration) -> tokio::task::JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match tracker.sweep_expired(Utc::now()).await {
                    Ok(0) => {}
                    Ok(removed) => tracing::debug!(removed, "expired progress records swept"),
                    Err(error) => {
                        tracing::warn!(reason = %error, "progress sweep failed");
                    }
                }
            }
        })
    }
}

pub const MAX_TTL_SECONDS: u64 = 7 * 24 * 60 * 60;

pub fn ttl_from_seconds(seconds: u64) -> Duration {
    Duration::seconds(seconds.clamp(1, MAX_TTL_SECONDS) as i64)
}
