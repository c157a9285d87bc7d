//! Policy selection: admissibility, where-predicate filtering, and precedence
//! (P1).

use super::guard::GuardEvaluator;
use super::registry::{CompiledPolicy, CompiledPolicyPack};
use crate::error::Error;
use chrono::{DateTime, Utc};
use serde_json::Value;

pub struct PolicySelector<'a> {
    pack: &'a CompiledPolicyPack,
}

impl<'a> PolicySelector<'a> {
    pub fn new(pack: &'a CompiledPolicyPack) -> Self {
        Self { pack }
    }

    /// Selects exactly one policy for `event_type`/`payload` at `now`, applying:
    /// 1. admissibility (effective range, capability tags, compilation receipt),
    /// 2. the where-predicate filter,
    /// 3. precedence (specificity, then priority, then scope depth) to break ties.
    ///
    /// Returns [`Error::ProfileNotFound`] if nothing is admissible, or
    /// [`Error::AmbiguousDispatch`] if more than one policy remains equally
    /// precedent after every tiebreaker (P1).
    pub fn select(
        &self,
        event_type: &str,
        payload: &Value,
        now: DateTime<Utc>,
    ) -> Result<&'a CompiledPolicy, Error> {
        let candidates = self.pack.find_for(event_type);

        let admissible: Vec<&CompiledPolicy> = candidates
            .iter()
            .filter(|p| Self::is_admissible(p, now))
            .collect();

        if admissible.is_empty() {
            return Err(Error::ProfileNotFound(event_type.to_string()));
        }

        let evaluator = GuardEvaluator::new();
        let mut matching: Vec<&CompiledPolicy> = Vec::new();
        for policy in admissible {
            let passes = match &policy.where_predicate {
                None => true,
                Some(expr) => Self::eval_predicate(&evaluator, expr, payload)?,
            };
            if passes {
                matching.push(policy);
            }
        }

        if matching.is_empty() {
            return Err(Error::ProfileNotFound(event_type.to_string()));
        }

        let max_specificity = matching.iter().map(|p| p.specificity).max().unwrap();
        matching.retain(|p| p.specificity == max_specificity);
        if matching.len() == 1 {
            return Ok(matching[0]);
        }

        let max_priority = matching.iter().map(|p| p.priority).max().unwrap();
        matching.retain(|p| p.priority == max_priority);
        if matching.len() == 1 {
            return Ok(matching[0]);
        }

        let max_scope_depth = matching.iter().map(|p| p.scope_depth).max().unwrap();
        matching.retain(|p| p.scope_depth == max_scope_depth);
        if matching.len() == 1 {
            return Ok(matching[0]);
        }

        Err(Error::AmbiguousDispatch(event_type.to_string(), matching.len()))
    }

    fn is_admissible(policy: &CompiledPolicy, now: DateTime<Utc>) -> bool {
        if policy.compilation_receipt.is_none() {
            return false;
        }
        if now < policy.effective_from {
            return false;
        }
        if let Some(to) = policy.effective_to {
            if now >= to {
                return false;
            }
        }
        true
    }

    fn eval_predicate(
        evaluator: &GuardEvaluator,
        expr: &super::guard::GuardExpr,
        payload: &Value,
    ) -> Result<bool, Error> {
        use super::guard::{GuardRule, GuardSeverity};
        let synthetic = GuardRule {
            reason_code: "WHERE_PREDICATE".into(),
            message: String::new(),
            severity: GuardSeverity::Reject,
            expr: expr.clone(),
        };
        // The where-predicate passes the policy when the expression is truthy; a
        // guard "fires" (i.e. blocks) when its expression is falsy, so a passing
        // predicate maps to `GuardOutcome::Pass`.
        Ok(matches!(
            evaluator.evaluate(&synthetic, payload)?,
            super::guard::GuardOutcome::Pass
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::guard::GuardExpr;
    use crate::policy::registry::RoleBindingMap;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn base_policy(id: &str, specificity: u32, priority: i32) -> CompiledPolicy {
        CompiledPolicy {
            policy_id: id.into(),
            event_type: "invoice.issued".into(),
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
            role_bindings: RoleBindingMap::new(),
            ledger_effects: vec![],
            required_engines: vec![],
            engine_parameters: BTreeMap::new(),
            variance_disposition: super::registry::VarianceDisposition::Reject,
            specificity,
            priority,
            scope_depth: 0,
            compilation_receipt: Some("r".into()),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn no_admissible_policy_is_profile_not_found() {
        let pack = CompiledPolicyPack::load(vec![]).unwrap();
        let selector = PolicySelector::new(&pack);
        assert!(matches!(
            selector.select("invoice.issued", &json!({}), now()),
            Err(Error::ProfileNotFound(_))
        ));
    }

    #[test]
    fn higher_specificity_wins() {
        let pack = CompiledPolicyPack::load(vec![base_policy("a", 1, 0), base_policy("b", 2, 0)]).unwrap();
        let selector = PolicySelector::new(&pack);
        let selected = selector.select("invoice.issued", &json!({}), now()).unwrap();
        assert_eq!(selected.policy_id, "b");
    }

    #[test]
    fn equal_precedence_is_ambiguous() {
        let pack = CompiledPolicyPack::load(vec![base_policy("a", 1, 0), base_policy("b", 1, 0)]).unwrap();
        let selector = PolicySelector::new(&pack);
        assert!(matches!(
            selector.select("invoice.issued", &json!({}), now()),
            Err(Error::AmbiguousDispatch(_, 2))
        ));
    }

    #[test]
    fn where_predicate_filters_candidates() {
        let mut restricted = base_policy("a", 5, 0);
        restricted.where_predicate = Some(GuardExpr::Gt {
            left: Box::new(GuardExpr::Field { path: "amount".into() }),
            right: Box::new(GuardExpr::Literal { value: json!(1000) }),
        });
        let fallback = base_policy("b", 1, 0);
        let pack = CompiledPolicyPack::load(vec![restricted, fallback]).unwrap();
        let selector = PolicySelector::new(&pack);

        let selected = selector
            .select("invoice.issued", &json!({"amount": 50}), now())
            .unwrap();
        assert_eq!(selected.policy_id, "b");

        let selected = selector
            .select("invoice.issued", &json!({"amount": 5000}), now())
            .unwrap();
        assert_eq!(selected.policy_id, "a");
    }
}
