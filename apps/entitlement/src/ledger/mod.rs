//! Append-only usage ledger. The ledger is the only source of truth for
//! consumed quota; nothing in this crate keeps a mutable usage counter.

pub mod store;
pub mod types;



pub use store::{LedgerStore, LedgerStoreError, RecordOutcome, RecordRequest};
pub use types::{
    ArtifactCreatedMetadata, EventOrigin, EventType, TranscriptRequestedMetadata, UsageEvent,
    UsageEventError, UsageMetadata, idempotency_key,
};
