//! Compiled policy pack, guard evaluation, and policy selection (spec §4.5).

pub(crate) mod guard;
pub(crate) mod registry;
mod selector;

pub use guard::{GuardEvaluator, GuardExpr, GuardOutcome, GuardRule, GuardSeverity};
pub use registry::{CompiledPolicy, CompiledPolicyPack, LedgerEffect, RoleBindingMap, VarianceDisposition};
pub use selector::PolicySelector;

use crate::error::Error;
use serde_json::Value;
use std::collections::BTreeMap;

/// The meaning extracted from a payload under a selected policy: an economic type,
/// a quantity, and a set of dimension tags, plus the guard trace produced while
/// building it.
#[derive(Debug, Clone)]
pub struct Meaning {
    pub economic_type: String,
    pub quantity: rust_decimal::Decimal,
    pub dimensions: BTreeMap<String, Value>,
    pub guard_trace: Vec<GuardOutcome>,
}

pub struct MeaningBuilder;

impl MeaningBuilder {
    /// Evaluates every guard attached to `policy` against `payload`, then extracts
    /// the economic meaning. A `Reject` guard short-circuits with an error; a
    /// `Block` guard short-circuits requesting approval; a `Warn` guard is recorded
    /// in the trace but never blocks (resolved Open Question: WARN is audit-only).
    pub fn build(policy: &CompiledPolicy, payload: &Value) -> Result<Meaning, Error> {
        let evaluator = GuardEvaluator::new();
        let mut trace = Vec::with_capacity(policy.guards.len());

        for guard in &policy.guards {
            let outcome = evaluator.evaluate(guard, payload)?;
            match &outcome {
                GuardOutcome::Reject { reason_code, message } => {
                    return Err(Error::GuardRejected {
                        reason_code: reason_code.clone(),
                        message: message.clone(),
                    });
                }
                GuardOutcome::Block { reason_code, message } => {
                    trace.push(outcome.clone());
                    return Err(Error::GuardBlocked {
                        reason_code: reason_code.clone(),
                        message: message.clone(),
                    });
                }
                GuardOutcome::Warn { .. } | GuardOutcome::Pass => {
                    trace.push(outcome);
                }
            }
        }

        let economic_type = policy.economic_type.clone();
        let quantity = extract_decimal(payload, &policy.quantity_path)?;
        let dimensions = policy
            .dimension_paths
            .iter()
            .filter_map(|(name, path)| {
                pointer(payload, path).map(|v| (name.clone(), v.clone()))
            })
            .collect();

        Ok(Meaning {
            economic_type,
            quantity,
            dimensions,
            guard_trace: trace,
        })
    }
}

fn extract_decimal(payload: &Value, path: &str) -> Result<rust_decimal::Decimal, Error> {
    use std::str::FromStr;
    let value = pointer(payload, path)
        .ok_or_else(|| Error::InvalidQuantity(format!("quantity path '{path}' not found in payload")))?;
    let raw = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(Error::InvalidQuantity(format!(
                "quantity at '{path}' is not numeric: {other}"
            )))
        }
    };
    rust_decimal::Decimal::from_str(&raw)
        .map_err(|e| Error::InvalidQuantity(format!("quantity at '{path}' is not a valid decimal: {e}")))
}

fn pointer<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(stripped) = path.strip_prefix('/') {
        payload.pointer(&format!("/{stripped}"))
    } else {
        payload.pointer(&format!("/{path}"))
    }
}
