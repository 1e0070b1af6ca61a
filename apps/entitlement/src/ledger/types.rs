use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ArtifactCreated,
    TranscriptRequested,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ArtifactCreated => "artifact_created",
            Self::TranscriptRequested => "transcript_requested",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "artifact_created" => Some(Self::ArtifactCreated),
            "transcript_requested" => Some(Self::TranscriptRequested),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    #[default]
    Organic,
    Backfill,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactCreatedMetadata {
    pub source_url: String,
    #[serde(default)]
    pub origin: EventOrigin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptRequestedMetadata {
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub origin: EventOrigin,
}

/// Event payload, typed per event type. The tag doubles as the stored
/// `event_type` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "metadata", rename_all = "snake_case")]
pub enum UsageMetadata {
    ArtifactCreated(ArtifactCreatedMetadata),
    TranscriptRequested(TranscriptRequestedMetadata),
}

impl UsageMetadata {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::ArtifactCreated(_) => EventType::ArtifactCreated,
            Self::TranscriptRequested(_) => EventType::TranscriptRequested,
        }
    }

    pub fn origin(&self) -> EventOrigin {
        match self {
            Self::ArtifactCreated(metadata) => metadata.origin,
            Self::TranscriptRequested(metadata) => metadata.origin,
        }
    }

    pub fn validate(&self) -> Result<(), UsageEventError> {
        match self {
            Self::ArtifactCreated(metadata) => validate_source_url(&metadata.source_url),
            Self::TranscriptRequested(metadata) => {
                validate_source_url(&metadata.source_url)?;
                if metadata
                    .language
                    .as_deref()
                    .is_some_and(|language| language.trim().is_empty())
                {
                    return Err(UsageEventError::InvalidMetadata(
                        "language must not be blank".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Payload without the event-type tag, as persisted in the metadata column.
    pub fn to_value(&self) -> Result<Value, UsageEventError> {
        let tagged = serde_json::to_value(self)
            .map_err(|error| UsageEventError::InvalidMetadata(error.to_string()))?;
        tagged
            .get("metadata")
            .cloned()
            .ok_or_else(|| UsageEventError::InvalidMetadata("missing metadata".to_string()))
    }

    pub fn from_parts(event_type: &str, metadata: Value) -> Result<Self, UsageEventError> {
        let event_type = EventType::parse(event_type)
            .ok_or_else(|| UsageEventError::UnknownEventType(event_type.to_string()))?;
        serde_json::from_value(serde_json::json!({
            "event_type": event_type.as_str(),
            "metadata": metadata,
        }))
        .map_err(|error| UsageEventError::InvalidMetadata(error.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UsageEventError {
    #[error("unknown event type: {0}")]
    UnknownEventType(String),
    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),
    #[error("actor_id is required")]
    MissingActor,
    #[error("resource_id must not be blank")]
    BlankResource,
}

/// One metered action. Append-only: no code path updates or deletes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub event_id: String,
    pub actor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(flatten)]
    pub metadata: UsageMetadata,
    pub created_at: DateTime<Utc>,
}

impl UsageEvent {
    pub fn new(
        actor_id: &str,
        resource_id: Option<&str>,
        metadata: UsageMetadata,
        created_at: DateTime<Utc>,
    ) -> Result<Self, UsageEventError> {
        let actor_id = actor_id.trim();
        if actor_id.is_empty() {
            return Err(UsageEventError::MissingActor);
        }
        let resource_id = match resource_id.map(str::trim) {
            Some("") => return Err(UsageEventError::BlankResource),
            other => other.map(ToString::to_string),
        };
        metadata.validate()?;
        Ok(Self {
            event_id: Uuid::now_v7().to_string(),
            actor_id: actor_id.to_string(),
            resource_id,
            metadata,
            created_at,
        })
    }

    pub fn event_type(&self) -> EventType {
        self.metadata.event_type()
    }

    pub fn idempotency_key(&self) -> Option<String> {
        self.resource_id
            .as_deref()
            .map(|resource_id| idempotency_key(resource_id, self.event_type()))
    }
}

/// Shared by organic writes and backfill so either may win a race on the same
/// resource and the other becomes a no-op.
pub fn idempotency_key(resource_id: &str, event_type: EventType) -> String {
    format!("{}:{}", resource_id.trim(), event_type.as_str())
}

fn validate_source_url(raw: &str) -> Result<(), UsageEventError> {
    let url = Url::parse(raw.trim())
        .map_err(|error| UsageEventError::InvalidMetadata(format!("source_url: {error}")))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(UsageEventError::InvalidMetadata(
            "source_url must be an absolute http(s) URL".to_string(),
        ));
    }
    Ok(())
}
