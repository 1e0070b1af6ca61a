//! Stable actor keys for registered principals and anonymous clients.
//!
//! Anonymous actors are keyed by a pure hash of client-observable signals so
//! that clearing local state cannot mint a fresh actor.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const ANONYMOUS_ACTOR_PREFIX: &str = "anon_";

const SIGNALS_DOMAIN: &[u8] = b"entitlement.fingerprint.signals.v1";
const RAW_FINGERPRINT_DOMAIN: &[u8] = b"entitlement.fingerprint.raw.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    Registered,
    AnonymousFingerprint,
}

impl ActorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::AnonymousFingerprint => "anonymous_fingerprint",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "registered" => Some(Self::Registered),
            "anonymous_fingerprint" => Some(Self::AnonymousFingerprint),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorKey {
    pub kind: ActorKind,
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintSignals {
    #[serde(default)]
    pub user_agent: String,
    /// Screen geometry as reported by the client, e.g. `1920x1080x24`.
    #[serde(default)]
    pub screen: String,
    #[serde(default)]
    pub timezone: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub canvas_hash: String,
}

impl FingerprintSignals {
    fn normalized_fields(&self) -> [(&'static str, String); 5] {
        [
            ("user_agent", self.user_agent.trim().to_string()),
            ("screen", self.screen.trim().to_ascii_lowercase()),
            ("timezone", self.timezone.trim().to_string()),
            ("language", self.language.trim().to_ascii_lowercase()),
            ("canvas_hash", self.canvas_hash.trim().to_ascii_lowercase()),
        ]
    }

    fn is_empty(&self) -> bool {
        self.normalized_fields()
            .iter()
            .all(|(_, value)| value.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActorIdentity {
    Registered {
        principal_id: String,
    },
    Anonymous {
        #[serde(default)]
        signals: Option<FingerprintSignals>,
        /// Opaque fingerprint computed client-side; used when no signals are sent.
        #[serde(default)]
        fingerprint: Option<String>,
        #[serde(default)]
        network_hint: Option<String>,
    },
}

impl ActorIdentity {
    pub fn network_hint(&self) -> Option<&str> {
        match self {
            Self::Registered { .. } => None,
            Self::Anonymous { network_hint, .. } => network_hint.as_deref(),
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("principal_id is required")]
    EmptyPrincipal,
    #[error("principal_id must not use the reserved `anon_` prefix")]
    ReservedPrincipalPrefix,
    #[error("anonymous identity requires fingerprint signals or a fingerprint")]
    EmptyFingerprint,
}

pub fn resolve(identity: &ActorIdentity) -> Result<ActorKey, IdentityError> {
    match identity {
        ActorIdentity::Registered { principal_id } => {
            let principal_id = principal_id.trim();
            if principal_id.is_empty() {
                return Err(IdentityError::EmptyPrincipal);
            }
            if principal_id.starts_with(ANONYMOUS_ACTOR_PREFIX) {
                return Err(IdentityError::ReservedPrincipalPrefix);
            }
            Ok(ActorKey {
                kind: ActorKind::Registered,
                id: principal_id.to_string(),
            })
        }
        ActorIdentity::Anonymous {
            signals,
            fingerprint,
            ..
        } => {
            let id = match (signals, fingerprint) {
                (Some(signals), _) if !signals.is_empty() => fingerprint_actor_id(signals),
                (_, Some(raw)) if !raw.trim().is_empty() => raw_fingerprint_actor_id(raw),
                _ => return Err(IdentityError::EmptyFingerprint),
            };
            Ok(ActorKey {
                kind: ActorKind::AnonymousFingerprint,
                id,
            })
        }
    }
}

pub fn fingerprint_actor_id(signals: &FingerprintSignals) -> String {
    let mut hasher = Sha256::new();
    hasher.update(SIGNALS_DOMAIN);
    for (label, value) in signals.normalized_fields() {
        update_length_prefixed(&mut hasher, label.as_bytes());
        update_length_prefixed(&mut hasher, value.as_bytes());
    }
    format!("{ANONYMOUS_ACTOR_PREFIX}{}", hex::encode(hasher.finalize()))
}

pub fn raw_fingerprint_actor_id(fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(RAW_FINGERPRINT_DOMAIN);
    update_length_prefixed(&mut hasher, fingerprint.trim().as_bytes());
    format!("{ANONYMOUS_ACTOR_PREFIX}{}", hex::encode(hasher.finalize()))
}

fn update_length_prefixed(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}
