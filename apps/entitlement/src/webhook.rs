//! Signed tier-change ingest from external billing providers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::actors::{ActorStore, ActorStoreError, StateChangeRecord, StateChangeResult};
use crate::policy::{PolicyTable, normalize_tier};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
pub const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";
pub const DEFAULT_TOLERANCE_SECONDS: u64 = 300;

const SIGNATURE_VERSION_PREFIX: &str = "v1=";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    UnknownProvider,
    InvalidSignature,
    InvalidTimestamp,
    StaleTimestamp,
    MalformedPayload,
    UnknownTier,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnknownProvider => "unknown_provider",
            Self::InvalidSignature => "invalid_signature",
            Self::InvalidTimestamp => "invalid_timestamp",
            Self::StaleTimestamp => "stale_timestamp",
            Self::MalformedPayload => "malformed_payload",
            Self::UnknownTier => "unknown_tier",
        }
    }

    /// Authentication failures, as opposed to a well-signed but unusable body.
    pub fn is_security(self) -> bool {
        matches!(
            self,
            Self::UnknownProvider
                | Self::InvalidSignature
                | Self::InvalidTimestamp
                | Self::StaleTimestamp
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Applied {
        external_event_id: String,
        actor_id: String,
        tier: String,
        tier_effective_at: DateTime<Utc>,
    },
    SkippedDuplicate {
        external_event_id: String,
    },
    Rejected {
        reason: RejectReason,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl IngestError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

impl From<ActorStoreError> for IngestError {
    fn from(error: ActorStoreError) -> Self {
        match error {
            ActorStoreError::Unavailable(message) | ActorStoreError::Db(message) => {
                Self::StoreUnavailable(message)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct StateChangePayload {
    id: String,
    #[serde(rename = "type", default)]
    event_type: String,
    data: StateChangeData,
}

#[derive(Debug, Deserialize)]
struct StateChangeData {
    actor_id: String,
    tier: String,
}

/// One delivery as it arrived on the wire. The payload is kept as raw bytes
/// because the signature covers them exactly.
#[derive(Debug, Clone, Copy)]
pub struct WebhookDelivery<'a> {
    pub provider: &'a str,
    pub raw_payload: &'a [u8],
    pub signature: Option<&'a str>,
    pub timestamp: Option<&'a str>,
}

#[derive(Clone)]
pub struct StateChangeIngest {
    actors: Arc<dyn ActorStore>,
    policy: Arc<PolicyTable>,
    secrets: Arc<HashMap<String, String>>,
    tolerance_seconds: u64,
}

impl StateChangeIngest {
    pub fn new(
        actors: Arc<dyn ActorStore>,
        policy: Arc<PolicyTable>,
        secrets: HashMap<String, String>,
        tolerance_seconds: u64,
    ) -> Self {
        Self {
            actors,
            policy,
            secrets: Arc::new(secrets),
            tolerance_seconds,
        }
    }

    pub fn has_provider(&self, provider: &str) -> bool {
        self.secrets.contains_key(provider)
    }

    pub async fn ingest(
        &self,
        delivery: WebhookDelivery<'_>,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, IngestError> {
        let provider = delivery.provider;
        let payload = match self.verify(delivery, now) {
            Ok(payload) => payload,
            Err(reason) => {
                if reason.is_security() {
                    tracing::warn!(provider, reason = reason.as_str(), "webhook rejected");
                } else {
                    tracing::info!(provider, reason = reason.as_str(), "webhook rejected");
                }
                return Ok(IngestOutcome::Rejected { reason });
            }
        };

        let change = StateChangeRecord {
            provider: provider.to_string(),
            external_event_id: payload.id.clone(),
            actor_id: payload.data.actor_id.clone(),
            tier: normalize_tier(&payload.data.tier),
            applied_at: now,
        };
        match self.actors.apply_state_change(change).await? {
            StateChangeResult::Applied(actor) => {
                tracing::info!(
                    provider,
                    external_event_id = %payload.id,
                    event_type = %payload.event_type,
                    actor_id = %actor.actor_id,
                    tier = %actor.tier,
                    "tier change applied"
                );
                Ok(IngestOutcome::Applied {
                    external_event_id: payload.id,
                    actor_id: actor.actor_id,
                    tier: actor.tier,
                    tier_effective_at: actor.tier_effective_at,
                })
            }
            StateChangeResult::Duplicate => {
                tracing::info!(
                    provider,
                    external_event_id = %payload.id,
                    "duplicate webhook delivery skipped"
                );
                Ok(IngestOutcome::SkippedDuplicate {
                    external_event_id: payload.id,
                })
            }
        }
    }

    fn verify(
        &self,
        delivery: WebhookDelivery<'_>,
        now: DateTime<Utc>,
    ) -> Result<StateChangePayload, RejectReason> {
        let secret = self
            .secrets
            .get(delivery.provider)
            .ok_or(RejectReason::UnknownProvider)?;

        let timestamp = delivery.timestamp.map(str::trim).unwrap_or_default();
        let signature = delivery.signature.map(str::trim).unwrap_or_default();
        if !signature_matches(secret, timestamp, delivery.raw_payload, signature) {
            return Err(RejectReason::InvalidSignature);
        }

        let sent_at = timestamp
            .parse::<i64>()
            .map_err(|_| RejectReason::InvalidTimestamp)?;
        if now.timestamp().abs_diff(sent_at) > self.tolerance_seconds {
            return Err(RejectReason::StaleTimestamp);
        }

        let mut payload: StateChangePayload = serde_json::from_slice(delivery.raw_payload)
            .map_err(|_| RejectReason::MalformedPayload)?;
        payload.id = payload.id.trim().to_string();
        payload.data.actor_id = payload.data.actor_id.trim().to_string();
        if payload.id.is_empty() || payload.data.actor_id.is_empty() {
            return Err(RejectReason::MalformedPayload);
        }
        if !self.policy.contains(&payload.data.tier) {
            return Err(RejectReason::UnknownTier);
        }
        Ok(payload)
    }
}

/// Hex HMAC-SHA256 over `"{timestamp}.{payload}"`, as providers are expected
/// to send it (without the `v1=` prefix).
pub fn sign_payload(secret: &str, timestamp: &str, raw_payload: &[u8]) -> Option<String> {
    let mac = signing_mac(secret, timestamp, raw_payload)?;
    Some(hex::encode(mac.finalize().into_bytes()))
}

fn signing_mac(secret: &str, timestamp: &str, raw_payload: &[u8]) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(raw_payload);
    Some(mac)
}

fn signature_matches(secret: &str, timestamp: &str, raw_payload: &[u8], header: &str) -> bool {
    if timestamp.is_empty() || header.is_empty() {
        return false;
    }
    let encoded = header
        .strip_prefix(SIGNATURE_VERSION_PREFIX)
        .unwrap_or(header);
    let Ok(provided) = hex::decode(encoded) else {
        return false;
    };
    signing_mac(secret, timestamp, raw_payload)
        .is_some_and(|mac| mac.verify_slice(&provided).is_ok())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use anyhow::Result;
    use chrono::{Duration, Utc};

    use super::{IngestOutcome, RejectReason, StateChangeIngest, WebhookDelivery, sign_payload};
    use crate::actors::{self, ActorStore};
    use crate::policy::PolicyTable;

    const SECRET: &str = "whsec_test";

    fn ingest_with(actor_store: Arc<dyn ActorStore>) -> StateChangeIngest {
        StateChangeIngest::new(
            actor_store,
            Arc::new(PolicyTable::default()),
            HashMap::from([("stripe".to_string(), SECRET.to_string())]),
            300,
        )
    }

    fn upgrade_payload(event_id: &str, tier: &str) -> Vec<u8> {
        serde_json::json!({
            "id": event_id,
            "type": "subscription.updated",
            "data": { "actor_id": "u1", "tier": tier }
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn replayed_delivery_is_skipped() -> Result<()> {
        let actor_store = actors::memory();
        let ingest = ingest_with(Arc::clone(&actor_store));
        let now = Utc::now();
        let timestamp = now.timestamp().to_string();
        let payload = upgrade_payload("evt_1", "pro");
        let signature = format!(
            "v1={}",
            sign_payload(SECRET, &timestamp, &payload).expect("signature")
        );
        let delivery = WebhookDelivery {
            provider: "stripe",
            raw_payload: &payload,
            signature: Some(&signature),
            timestamp: Some(&timestamp),
        };

        let first = ingest.ingest(delivery, now).await?;
        assert!(matches!(first, IngestOutcome::Applied { ref tier, .. } if tier == "pro"));

        let replay = ingest.ingest(delivery, now + Duration::seconds(30)).await?;
        assert_eq!(
            replay,
            IngestOutcome::SkippedDuplicate {
                external_event_id: "evt_1".to_string()
            }
        );

        let actor = actor_store.get_actor("u1").await?.expect("actor created");
        assert_eq!(actor.tier, "pro");
        assert_eq!(actor.tier_effective_at, now);
        Ok(())
    }

    #[tokio::test]
    async fn padded_event_id_is_the_same_delivery() -> Result<()> {
        let ingest = ingest_with(actors::memory());
        let now = Utc::now();
        let timestamp = now.timestamp().to_string();

        let mut outcomes = Vec::new();
        for event_id in ["evt_7", "  evt_7 "] {
            let payload = upgrade_payload(event_id, "pro");
            let signature = format!(
                "v1={}",
                sign_payload(SECRET, &timestamp, &payload).expect("signature")
            );
            let delivery = WebhookDelivery {
                provider: "stripe",
                raw_payload: &payload,
                signature: Some(&signature),
                timestamp: Some(&timestamp),
            };
            outcomes.push(ingest.ingest(delivery, now).await?);
        }

        assert!(matches!(
            &outcomes[0],
            IngestOutcome::Applied { external_event_id, .. } if external_event_id == "evt_7"
        ));
        assert_eq!(
            outcomes[1],
            IngestOutcome::SkippedDuplicate {
                external_event_id: "evt_7".to_string()
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn tampered_payload_is_rejected_without_side_effects() -> Result<()> {
        let actor_store = actors::memory();
        let ingest = ingest_with(Arc::clone(&actor_store));
        let now = Utc::now();
        let timestamp = now.timestamp().to_string();
        let signature = sign_payload(SECRET, &timestamp, &upgrade_payload("evt_2", "free"))
            .expect("signature");
        let tampered = upgrade_payload("evt_2", "pro");

        let outcome = ingest
            .ingest(
                WebhookDelivery {
                    provider: "stripe",
                    raw_payload: &tampered,
                    signature: Some(&signature),
                    timestamp: Some(&timestamp),
                },
                now,
            )
            .await?;
        assert_eq!(
            outcome,
            IngestOutcome::Rejected {
                reason: RejectReason::InvalidSignature
            }
        );
        assert!(actor_store.get_actor("u1").await?.is_none());
        assert!(actor_store.get_state_change("stripe", "evt_2").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn stale_timestamp_is_rejected() -> Result<()> {
        let ingest = ingest_with(actors::memory());
        let now = Utc::now();
        let timestamp = (now - Duration::seconds(301)).timestamp().to_string();
        let payload = upgrade_payload("evt_3", "pro");
        let signature = sign_payload(SECRET, &timestamp, &payload).expect("signature");

        let outcome = ingest
            .ingest(
                WebhookDelivery {
                    provider: "stripe",
                    raw_payload: &payload,
                    signature: Some(&signature),
                    timestamp: Some(&timestamp),
                },
                now,
            )
            .await?;
        assert_eq!(
            outcome,
            IngestOutcome::Rejected {
                reason: RejectReason::StaleTimestamp
            }
        );
        Ok(())
    }

    #[tokio::test]
    async fn unusable_deliveries_are_rejected() -> Result<()> {
        let ingest = ingest_with(actors::memory());
        let now = Utc::now();
        let timestamp = now.timestamp().to_string();

        let unknown_tier = upgrade_payload("evt_4", "platinum");
        let malformed = br#"{"id":"evt_5"}"#.to_vec();
        let cases = [
            ("paypal", unknown_tier.clone(), RejectReason::UnknownProvider),
            ("stripe", unknown_tier, RejectReason::UnknownTier),
            ("stripe", malformed, RejectReason::MalformedPayload),
        ];
        for (provider, payload, expected) in cases {
            let signature = sign_payload(SECRET, &timestamp, &payload).expect("signature");
            let outcome = ingest
                .ingest(
                    WebhookDelivery {
                        provider,
                        raw_payload: &payload,
                        signature: Some(&signature),
                        timestamp: Some(&timestamp),
                    },
                    now,
                )
                .await?;
            assert_eq!(outcome, IngestOutcome::Rejected { reason: expected });
        }

        let payload = upgrade_payload("evt_6", "pro");
        let signature = sign_payload(SECRET, "soon", &payload).expect("signature");
        let outcome = ingest
            .ingest(
                WebhookDelivery {
                    provider: "stripe",
                    raw_payload: &payload,
                    signature: Some(&signature),
                    timestamp: Some("soon"),
                },
                now,
            )
            .await?;
        assert_eq!(
            outcome,
            IngestOutcome::Rejected {
                reason: RejectReason::InvalidTimestamp
            }
        );
        Ok(())
    }
}
