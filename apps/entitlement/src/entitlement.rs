use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::actors::{ActorStore, ActorStoreError};
use crate::identity::{ActorIdentity, ActorKind, IdentityError, resolve};
use crate::ledger::{
    EventType, LedgerStore, LedgerStoreError, RecordOutcome, RecordRequest, UsageEvent,
    UsageEventError, UsageMetadata,
};
use crate::policy::{PolicyTable, UsageLimit};

#[derive(Debug, thiserror::Error)]
pub enum EntitlementError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unknown tier: {0}")]
    UnknownTier(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl EntitlementError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::UnknownTier(_) => "unknown_tier",
            Self::Conflict(_) => "conflict",
            Self::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

impl From<IdentityError> for EntitlementError {
    fn from(error: IdentityError) -> Self {
        Self::InvalidRequest(error.to_string())
    }
}

impl From<UsageEventError> for EntitlementError {
    fn from(error: UsageEventError) -> Self {
        Self::InvalidRequest(error.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    LimitExceeded,
    StoreUnavailable,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LimitExceeded => "limit_exceeded",
            Self::StoreUnavailable => "store_unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntitlementDecision {
    pub allowed: bool,
    pub current: u64,
    /// `None` for unlimited tiers.
    pub limit: Option<u64>,
    pub reset_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
    /// The resource was already metered; nothing new was recorded.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub replayed: bool,
}

impl EntitlementDecision {
    fn denied(
        reason: DenyReason,
        current: u64,
        limit: Option<u64>,
        reset_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            allowed: false,
            current,
            limit,
            reset_at,
            reason: Some(reason),
            replayed: false,
        }
    }
}

/// The metered action a caller wants to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeteredAction {
    pub metadata: UsageMetadata,
    pub resource_id: Option<String>,
}

impl MeteredAction {
    pub fn event_type(&self) -> EventType {
        self.metadata.event_type()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizedDecision {
    pub actor_id: String,
    pub actor_kind: ActorKind,
    /// Unknown when the actor store could not be read.
    pub tier: Option<String>,
    #[serde(flatten)]
    pub decision: EntitlementDecision,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub actor_id: String,
    pub tier: String,
    pub event_type: EventType,
    pub current: u64,
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct EntitlementService {
    ledger: Arc<dyn LedgerStore>,
    actors: Arc<dyn ActorStore>,
    policy: Arc<PolicyTable>,
}

impl EntitlementService {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        actors: Arc<dyn ActorStore>,
        policy: Arc<PolicyTable>,
    ) -> Self {
        Self {
            ledger,
            actors,
            policy,
        }
    }

    pub fn policy(&self) -> &PolicyTable {
        &self.policy
    }

    /// Resolves the caller, loads (or creates) the actor, and meters the action
    /// against the actor's current tier.
    pub async fn authorize(
        &self,
        identity: &ActorIdentity,
        action: MeteredAction,
        now: DateTime<Utc>,
    ) -> Result<AuthorizedDecision, EntitlementError> {
        let key = resolve(identity)?;
        if let Some(network_hint) = identity.network_hint() {
            tracing::debug!(actor_id = %key.id, network_hint, "anonymous actor network hint");
        }

        let actor = match self.actors.ensure_actor(&key, now).await {
            Ok(actor) => actor,
            Err(error) => {
                tracing::error!(actor_id = %key.id, reason = %error, "actor store unavailable; denying");
                return Ok(AuthorizedDecision {
                    actor_id: key.id,
                    actor_kind: key.kind,
                    tier: None,
                    decision: EntitlementDecision::denied(
                        DenyReason::StoreUnavailable,
                        0,
                        None,
                        None,
                    ),
                });
            }
        };

        let decision = self
            .check_and_record(&actor.actor_id, &actor.tier, action, now)
            .await?;
        Ok(AuthorizedDecision {
            actor_id: actor.actor_id,
            actor_kind: actor.kind,
            tier: Some(actor.tier),
            decision,
        })
    }

    /// Counts the actor's events in the tier's current window and, if the
    /// count is below the limit, records one more. Count and insert are a
    /// single serialized unit per actor. Store failures deny.
    pub async fn check_and_record(
        &self,
        actor_id: &str,
        tier: &str,
        action: MeteredAction,
        now: DateTime<Utc>,
    ) -> Result<EntitlementDecision, EntitlementError> {
        let policy = self
            .policy
            .lookup(tier)
            .ok_or_else(|| EntitlementError::UnknownTier(tier.to_string()))?;
        let event_type = action.event_type();
        let event = UsageEvent::new(actor_id, action.resource_id.as_deref(), action.metadata, now)?;
        let window_start = policy.window.window_start(now);
        let reset_at = policy.window.reset_at(now);

        let UsageLimit::Count(limit) = policy.limit else {
            return Ok(self.record_unlimited(event, window_start).await);
        };

        let outcome = self
            .ledger
            .record_if_under_limit(RecordRequest {
                event,
                window_start,
                limit: Some(limit),
            })
            .await;

        let decision = match outcome {
            Ok(RecordOutcome::Recorded { count }) => EntitlementDecision {
                allowed: true,
                current: count,
                limit: Some(limit),
                reset_at,
                reason: None,
                replayed: false,
            },
            Ok(RecordOutcome::AlreadyRecorded { count }) => EntitlementDecision {
                allowed: true,
                current: count,
                limit: Some(limit),
                reset_at,
                reason: None,
                replayed: true,
            },
            Ok(RecordOutcome::LimitReached { count }) => {
                tracing::info!(
                    actor_id,
                    tier = %policy.tier,
                    event_type = event_type.as_str(),
                    current = count,
                    limit,
                    "usage limit reached"
                );
                EntitlementDecision::denied(DenyReason::LimitExceeded, count, Some(limit), reset_at)
            }
            Err(LedgerStoreError::Conflict(message)) => {
                return Err(EntitlementError::Conflict(message));
            }
            Err(error) => {
                tracing::error!(
                    actor_id,
                    event_type = event_type.as_str(),
                    reason = %error,
                    "ledger unavailable; denying"
                );
                EntitlementDecision::denied(DenyReason::StoreUnavailable, 0, Some(limit), reset_at)
            }
        };
        Ok(decision)
    }

    async fn record_unlimited(
        &self,
        event: UsageEvent,
        window_start: DateTime<Utc>,
    ) -> EntitlementDecision {
        let actor_id = event.actor_id.clone();
        let outcome = self
            .ledger
            .record_if_under_limit(RecordRequest {
                event,
                window_start,
                limit: None,
            })
            .await;
        let (current, replayed) = match outcome {
            Ok(RecordOutcome::Recorded { count }) => (count, false),
            Ok(RecordOutcome::AlreadyRecorded { count } | RecordOutcome::LimitReached { count }) => {
                (count, true)
            }
            Err(error) => {
                // Unlimited tiers record for audit only; a failed write never blocks.
                tracing::warn!(
                    actor_id = %actor_id,
                    reason = %error,
                    "failed to record unlimited-tier usage"
                );
                (0, false)
            }
        };
        EntitlementDecision {
            allowed: true,
            current,
            limit: None,
            reset_at: None,
            reason: None,
            replayed,
        }
    }

    /// Read-only view of the actor's consumption in the current window.
    pub async fn usage(
        &self,
        actor_id: &str,
        tier: &str,
        event_type: EventType,
        now: DateTime<Utc>,
    ) -> Result<UsageSnapshot, EntitlementError> {
        let policy = self
            .policy
            .lookup(tier)
            .ok_or_else(|| EntitlementError::UnknownTier(tier.to_string()))?;
        let current = self
            .ledger
            .count_since(actor_id, event_type, policy.window.window_start(now))
            .await
            .map_err(map_ledger_error)?;
        let limit = policy.limit.as_count();
        Ok(UsageSnapshot {
            actor_id: actor_id.to_string(),
            tier: policy.tier.clone(),
            event_type,
            current,
            limit,
            remaining: limit.map(|limit| limit.saturating_sub(current)),
            reset_at: policy.window.reset_at(now),
        })
    }

    /// Usage for a known actor using the tier currently on record.
    pub async fn usage_for_actor(
        &self,
        actor_id: &str,
        event_type: EventType,
        now: DateTime<Utc>,
    ) -> Result<Option<UsageSnapshot>, EntitlementError> {
        let Some(actor) = self
            .actors
            .get_actor(actor_id)
            .await
            .map_err(map_actor_error)?
        else {
            return Ok(None);
        };
        self.usage(&actor.actor_id, &actor.tier, event_type, now)
            .await
            .map(Some)
    }

    pub async fn ready(&self) -> bool {
        self.ledger.ping().await.is_ok() && self.actors.ping().await.is_ok()
    }

    pub fn ledger_driver(&self) -> &'static str {
        self.ledger.driver_name()
    }
}

fn map_ledger_error(error: LedgerStoreError) -> EntitlementError {
    match error {
        LedgerStoreError::Conflict(message) => EntitlementError::Conflict(message),
        LedgerStoreError::Unavailable(message) | LedgerStoreError::Db(message) => {
            EntitlementError::StoreUnavailable(message)
        }
    }
}

fn map_actor_error(error: ActorStoreError) -> EntitlementError {
    match error {
        ActorStoreError::Unavailable(message) | ActorStoreError::Db(message) => {
            EntitlementError::StoreUnavailable(message)
        }
    }
}
