//! Reference snapshot and replay (R6, R21, R24).
//!
//! A [`ReferenceSnapshot`] captures the component versions in effect at
//! interpretation time. The coordinator compares a stored intent's snapshot
//! against the current one before committing a posting; a mismatch means the
//! chart of accounts, role bindings, policy pack, or engine registry changed
//! underneath the pending posting, and the posting is aborted rather than
//! silently applied against state it was never evaluated against (R21).

use crate::types::JournalEntry;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceSnapshot {
    pub chart_of_accounts_hash: String,
    pub role_binding_map_hash: String,
    pub policy_pack_fingerprint: String,
    pub engine_registry_version: String,
}

impl ReferenceSnapshot {
    pub fn new(
        chart_of_accounts_hash: impl Into<String>,
        role_binding_map_hash: impl Into<String>,
        policy_pack_fingerprint: impl Into<String>,
        engine_registry_version: impl Into<String>,
    ) -> Self {
        Self {
            chart_of_accounts_hash: chart_of_accounts_hash.into(),
            role_binding_map_hash: role_binding_map_hash.into(),
            policy_pack_fingerprint: policy_pack_fingerprint.into(),
            engine_registry_version: engine_registry_version.into(),
        }
    }

    /// A single string identifying this exact combination of component versions,
    /// used in `StaleSnapshot` error messages.
    pub fn fingerprint(&self) -> String {
        let joined = format!(
            "{}\0{}\0{}\0{}",
            self.chart_of_accounts_hash,
            self.role_binding_map_hash,
            self.policy_pack_fingerprint,
            self.engine_registry_version
        );
        blake3::hash(joined.as_bytes()).to_hex().to_string()
    }
}

/// Computes a canonical hash over a set of posted entries for cross-replica
/// comparison (R24). Entries are sorted by `(ledger_id, sequence)` first so two
/// replicas that received entries in different wall-clock order still agree.
pub fn canonical_ledger_hash(entries: &[JournalEntry]) -> String {
    let mut sorted: Vec<&JournalEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| (a.ledger_id.as_str(), a.sequence).cmp(&(b.ledger_id.as_str(), b.sequence)));

    let mut hasher = blake3::Hasher::new();
    for entry in sorted {
        let canonical = crate::audit::canonical_bytes(
            &serde_json::to_value(entry).expect("JournalEntry always serializes"),
        );
        hasher.update(&canonical);
    }
    hasher.finalize().to_hex().to_string()
}

/// Outcome of replaying a sequence of events against a policy pack, used by
/// integration tests to assert byte-identical journal content under a
/// deterministic clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayReport {
    pub events_replayed: usize,
    pub entries_posted: usize,
    pub canonical_hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_changes_when_any_component_changes() {
        let a = ReferenceSnapshot::new("coa1", "roles1", "policy1", "engines1");
        let b = ReferenceSnapshot::new("coa2", "roles1", "policy1", "engines1");
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn identical_snapshots_have_identical_fingerprints() {
        let a = ReferenceSnapshot::new("coa1", "roles1", "policy1", "engines1");
        let b = ReferenceSnapshot::new("coa1", "roles1", "policy1", "engines1");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a, b);
    }
}
