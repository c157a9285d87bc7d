//! Reconciliation engine: compares two named balance sets line by line and
//! reports residuals beyond tolerance. Distinct from
//! [`accord_core::subledger::SubledgerReconciler`], which is the storage-facing
//! post-time/close-time gate; this engine is the pure comparison step it can
//! invoke, and is also reusable for bank-statement-style reconciliations.

use crate::common::{decimal_to_value, field};
use accord_core::engine::{EngineError, EngineInvoker, EngineOutput};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub struct ReconciliationEngine;

impl EngineInvoker for ReconciliationEngine {
    fn name(&self) -> &str {
        "reconciliation"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn invoke(&self, payload: &Value, params: &Value) -> Result<EngineOutput, EngineError> {
        let left = as_balance_map(field(payload, "left")?)?;
        let right = as_balance_map(field(payload, "right")?)?;
        let tolerance = params
            .get("tolerance")
            .map(crate::common::to_decimal)
            .transpose()?
            .unwrap_or(Decimal::ZERO);

        let mut keys: Vec<&String> = left.keys().chain(right.keys()).collect();
        keys.sort();
        keys.dedup();

        let mut discrepancies = Vec::new();
        for key in keys {
            let l = *left.get(key).unwrap_or(&Decimal::ZERO);
            let r = *right.get(key).unwrap_or(&Decimal::ZERO);
            let residual = l - r;
            if residual.abs() > tolerance {
                discrepancies.push(json!({
                    "key": key,
                    "left": decimal_to_value(l),
                    "right": decimal_to_value(r),
                    "residual": decimal_to_value(residual),
                }));
            }
        }

        Ok(EngineOutput {
            summary: json!({
                "reconciled": discrepancies.is_empty(),
                "discrepancies": discrepancies,
            }),
        })
    }
}

fn as_balance_map(value: &Value) -> Result<BTreeMap<String, Decimal>, EngineError> {
    let object = value
        .as_object()
        .ok_or_else(|| EngineError::InvalidParams("expected an object of key -> amount".into()))?;
    object
        .iter()
        .map(|(k, v)| Ok((k.clone(), crate::common::to_decimal(v)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_balances_reconcile() {
        let engine = ReconciliationEngine;
        let payload = json!({"left": {"a": "100.00"}, "right": {"a": "100.00"}});
        let output = engine.invoke(&payload, &json!({})).unwrap();
        assert_eq!(output.summary["reconciled"], json!(true));
    }

    #[test]
    fn mismatched_balances_are_reported() {
        let engine = ReconciliationEngine;
        let payload = json!({"left": {"a": "100.00"}, "right": {"a": "90.00"}});
        let output = engine.invoke(&payload, &json!({})).unwrap();
        assert_eq!(output.summary["reconciled"], json!(false));
        assert_eq!(output.summary["discrepancies"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn missing_key_on_one_side_is_a_discrepancy() {
        let engine = ReconciliationEngine;
        let payload = json!({"left": {"a": "100.00", "b": "5.00"}, "right": {"a": "100.00"}});
        let output = engine.invoke(&payload, &json!({})).unwrap();
        assert_eq!(output.summary["discrepancies"].as_array().unwrap().len(), 1);
    }
}
