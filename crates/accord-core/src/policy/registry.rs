//! The compiled, frozen policy pack: event-type-indexed policies, role bindings,
//! and the canonical fingerprint used for reference-snapshot staleness checks
//! (R6, R21).

use super::guard::GuardRule;
use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Maps a role name (e.g. `"cash_account"`, `"revenue_account"`) to a concrete
/// `(account_id, ledger_id)` pair, scoped per policy (L1). A role resolves to a
/// specific ledger as well as a specific account because a single policy's
/// ledger effects can span more than one ledger (spec §4.7).
pub type RoleBindingMap = BTreeMap<String, (crate::types::AccountId, String)>;

/// One leg of a policy's intended posting: which ledger it targets and which
/// roles play debit/credit on it, prior to role resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEffect {
    pub ledger_id: String,
    pub debit_role: String,
    pub credit_role: String,
}

/// What happens to a residual that falls outside the rounding tolerance when a
/// policy's computed quantities don't cleanly balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceDisposition {
    PostToVarianceAccount,
    Reject,
    Suspense,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompiledPolicy {
    pub policy_id: String,
    pub event_type: String,
    pub economic_type: String,
    pub quantity_path: String,
    pub dimension_paths: BTreeMap<String, String>,
    pub effective_from: DateTime<Utc>,
    pub effective_to: Option<DateTime<Utc>>,
    pub capability_tags: Vec<String>,
    pub where_predicate: Option<super::guard::GuardExpr>,
    pub guards: Vec<GuardRule>,
    pub role_bindings: RoleBindingMap,
    /// Ledger effects this policy produces: one entry per `(ledger, debit role,
    /// credit role)` triple, in the order ledger intents should be built.
    pub ledger_effects: Vec<LedgerEffect>,
    /// Engine ids that must all succeed for this policy's dispatch to count as
    /// complete (spec §4.6's "N required engines => N success traces").
    pub required_engines: Vec<String>,
    /// Parameters passed to each required engine, keyed by engine id.
    pub engine_parameters: BTreeMap<String, serde_json::Value>,
    pub variance_disposition: VarianceDisposition,
    pub specificity: u32,
    pub priority: i32,
    pub scope_depth: u32,
    pub compilation_receipt: Option<String>,
}

/// A fully parsed, startup-loaded policy pack. Policies are indexed by event type
/// in a `HashMap` populated once at load time (the REDESIGN FLAG resolution:
/// dynamic dispatch replaced by a compile-time-known table populated at startup),
/// so lookup is O(1) rather than a linear scan of every policy on every event.
#[derive(Debug, Clone)]
pub struct CompiledPolicyPack {
    by_event_type: HashMap<String, Vec<CompiledPolicy>>,
    pub fingerprint: String,
}

impl CompiledPolicyPack {
    pub fn load(policies: Vec<CompiledPolicy>) -> Result<Self, Error> {
        for policy in &policies {
            if policy.compilation_receipt.is_none() {
                return Err(Error::UncompiledPolicy(policy.policy_id.clone()));
            }
        }

        let fingerprint = Self::compute_fingerprint(&policies);

        let mut by_event_type: HashMap<String, Vec<CompiledPolicy>> = HashMap::new();
        for policy in policies {
            by_event_type
                .entry(policy.event_type.clone())
                .or_default()
                .push(policy);
        }

        Ok(Self {
            by_event_type,
            fingerprint,
        })
    }

    pub fn find_for(&self, event_type: &str) -> &[CompiledPolicy] {
        self.by_event_type
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn compute_fingerprint(policies: &[CompiledPolicy]) -> String {
        let mut ids: Vec<&str> = policies.iter().map(|p| p.policy_id.as_str()).collect();
        ids.sort_unstable();
        let joined = ids.join("\0");
        blake3::hash(joined.as_bytes()).to_hex().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(id: &str, event_type: &str) -> CompiledPolicy {
        CompiledPolicy {
            policy_id: id.into(),
            event_type: event_type.into(),
            economic_type: "sale".into(),
            quantity_path: "/amount".into(),
            dimension_paths: BTreeMap::new(),
            effective_from: DateTime::parse_from_rfc3339("2020-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            effective_to: None,
            capability_tags: vec![],
            where_predicate: None,
            guards: vec![],
            role_bindings: BTreeMap::new(),
            ledger_effects: vec![],
            required_engines: vec![],
            engine_parameters: BTreeMap::new(),
            variance_disposition: VarianceDisposition::Reject,
            specificity: 0,
            priority: 0,
            scope_depth: 0,
            compilation_receipt: Some("receipt".into()),
        }
    }

    #[test]
    fn uncompiled_policy_is_rejected_at_load() {
        let mut p = policy("p1", "invoice.issued");
        p.compilation_receipt = None;
        assert!(CompiledPolicyPack::load(vec![p]).is_err());
    }

    #[test]
    fn indexes_by_event_type() {
        let pack = CompiledPolicyPack::load(vec![
            policy("p1", "invoice.issued"),
            policy("p2", "invoice.issued"),
            policy("p3", "payment.received"),
        ])
        .unwrap();
        assert_eq!(pack.find_for("invoice.issued").len(), 2);
        assert_eq!(pack.find_for("payment.received").len(), 1);
        assert_eq!(pack.find_for("unknown.type").len(), 0);
    }

    #[test]
    fn fingerprint_is_order_independent() {
        let a = CompiledPolicyPack::load(vec![policy("p1", "t"), policy("p2", "t")]).unwrap();
        let b = CompiledPolicyPack::load(vec![policy("p2", "t"), policy("p1", "t")]).unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
    }
}
