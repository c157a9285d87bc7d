//! Hash-chained, strictly monotonic, gap-free audit log (R11).
//!
//! Grounded on the append-only hash chain in the teacher's ledger module: every
//! event's hash commits to the previous event's hash, so the whole chain can be
//! walked and re-verified independently of the storage layer's own guarantees.

use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The genesis hash anchoring the chain before any event has been recorded.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub audit_seq: i64,
    pub event_id: Uuid,
    pub stage: String,
    pub payload: Value,
    pub recorded_at: DateTime<Utc>,
    pub payload_hash: String,
    pub prev_hash: String,
    pub event_hash: String,
}

/// Canonicalizes a JSON value into a deterministic byte string: object keys are
/// sorted recursively so the same logical payload always hashes identically
/// regardless of construction order.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    fn canonicalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sorted = serde_json::Map::new();
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for k in keys {
                    sorted.insert(k.clone(), canonicalize(&map[k]));
                }
                Value::Object(sorted)
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
            other => other.clone(),
        }
    }
    serde_json::to_vec(&canonicalize(value)).expect("canonicalized JSON always serializes")
}

pub fn hash_payload(value: &Value) -> String {
    blake3::hash(&canonical_bytes(value)).to_hex().to_string()
}

fn chain_hash(payload_hash: &str, prev_hash: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(payload_hash.as_bytes());
    hasher.update(prev_hash.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// In-process view over the durable `audit_events` table. Construction and chain
/// verification are pure; persistence is delegated to [`crate::storage`].
#[derive(Debug, Default)]
pub struct AuditLog;

impl AuditLog {
    pub fn new() -> Self {
        Self
    }

    /// Builds the next [`AuditEvent`] given the last recorded event's hash (or
    /// [`GENESIS_HASH`] if the chain is empty). Callers persist this within the same
    /// transaction as the state change it describes.
    pub fn build_next(
        &self,
        audit_seq: i64,
        event_id: Uuid,
        stage: impl Into<String>,
        payload: Value,
        prev_hash: &str,
        recorded_at: DateTime<Utc>,
    ) -> AuditEvent {
        let payload_hash = hash_payload(&payload);
        let event_hash = chain_hash(&payload_hash, prev_hash);
        AuditEvent {
            audit_seq,
            event_id,
            stage: stage.into(),
            payload,
            recorded_at,
            payload_hash,
            prev_hash: prev_hash.to_string(),
            event_hash,
        }
    }

    /// Walks a contiguous slice of the chain (ordered by `audit_seq`) and verifies
    /// that each event's `prev_hash` matches its predecessor's `event_hash`, each
    /// `payload_hash` matches the recomputed hash of its payload, and sequence
    /// numbers are strictly monotonic with no gaps (R11).
    pub fn verify_chain(&self, events: &[AuditEvent], genesis_prev: &str) -> Result<(), Error> {
        let mut expected_prev = genesis_prev.to_string();
        let mut expected_seq: Option<i64> = None;

        for event in events {
            if let Some(prev_seq) = expected_seq {
                if event.audit_seq != prev_seq + 1 {
                    return Err(Error::InvariantViolation(format!(
                        "audit chain gap: expected seq {}, found {}",
                        prev_seq + 1,
                        event.audit_seq
                    )));
                }
            }
            expected_seq = Some(event.audit_seq);

            if event.prev_hash != expected_prev {
                return Err(Error::InvariantViolation(format!(
                    "audit chain broken at seq {}: prev_hash mismatch",
                    event.audit_seq
                )));
            }

            let recomputed_payload_hash = hash_payload(&event.payload);
            if recomputed_payload_hash != event.payload_hash {
                return Err(Error::InvariantViolation(format!(
                    "audit chain tampered at seq {}: payload_hash mismatch",
                    event.audit_seq
                )));
            }

            let recomputed_event_hash = chain_hash(&event.payload_hash, &event.prev_hash);
            if recomputed_event_hash != event.event_hash {
                return Err(Error::InvariantViolation(format!(
                    "audit chain tampered at seq {}: event_hash mismatch",
                    event.audit_seq
                )));
            }

            expected_prev = event.event_hash.clone();
        }

        Ok(())
    }
}
