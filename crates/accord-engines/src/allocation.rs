//! Allocation engine: distributes a pool amount across targets by weight, then
//! runs a multi-step cascade when targets themselves feed further targets
//! (e.g. cost-center-to-cost-center step-down allocation).

use crate::common::{array_field, decimal_field, decimal_to_value, string_field};
use accord_core::engine::{EngineError, EngineInvoker, EngineOutput};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub struct AllocationEngine;

impl EngineInvoker for AllocationEngine {
    fn name(&self) -> &str {
        "allocation"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn invoke(&self, payload: &Value, params: &Value) -> Result<EngineOutput, EngineError> {
        let steps = array_field(params, "steps")?;
        if steps.is_empty() {
            return Err(EngineError::InvalidParams("allocation requires at least one step".into()));
        }

        let mut pools: BTreeMap<String, Decimal> = BTreeMap::new();
        let source_pool = string_field(payload, "source_pool")?.to_string();
        pools.insert(source_pool, decimal_field(payload, "pool_amount")?);

        let mut allocations: Vec<Value> = Vec::new();

        for step in steps {
            let from = string_field(step, "from")?;
            let targets = array_field(step, "targets")?;
            let available = *pools.get(from).unwrap_or(&Decimal::ZERO);
            if available.is_zero() {
                continue;
            }

            let total_weight: Decimal = targets
                .iter()
                .map(|t| decimal_field(t, "weight"))
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .sum();
            if total_weight.is_zero() {
                return Err(EngineError::InvalidParams(format!(
                    "step from '{from}' has zero total weight"
                )));
            }

            let mut allocated_so_far = Decimal::ZERO;
            for (idx, target) in targets.iter().enumerate() {
                let target_name = string_field(target, "name")?.to_string();
                let weight = decimal_field(target, "weight")?;
                // Last target absorbs the rounding remainder so the cascade never
                // loses or manufactures value (R5).
                let share = if idx + 1 == targets.len() {
                    available - allocated_so_far
                } else {
                    let raw = (available * weight / total_weight).round_dp(2);
                    allocated_so_far += raw;
                    raw
                };

                *pools.entry(target_name.clone()).or_insert(Decimal::ZERO) += share;
                allocations.push(json!({
                    "from": from,
                    "to": target_name,
                    "amount": decimal_to_value(share),
                }));
            }
        }

        Ok(EngineOutput {
            summary: json!({
                "allocations": allocations,
                "final_pools": pools
                    .into_iter()
                    .map(|(k, v)| (k, decimal_to_value(v)))
                    .collect::<serde_json::Map<_, _>>(),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn single_step_allocation_sums_to_pool() {
        let engine = AllocationEngine;
        let payload = json!({"source_pool": "overhead", "pool_amount": "100.00"});
        let params = json!({
            "steps": [
                {"from": "overhead", "targets": [
                    {"name": "dept_a", "weight": "1"},
                    {"name": "dept_b", "weight": "1"},
                    {"name": "dept_c", "weight": "1"},
                ]}
            ]
        });
        let output = engine.invoke(&payload, &params).unwrap();
        let final_pools = output.summary["final_pools"].as_object().unwrap();
        let total: Decimal = final_pools
            .values()
            .map(|v| crate::common::to_decimal(v).unwrap())
            .sum();
        assert_eq!(total, dec!(100.00));
    }

    #[test]
    fn cascading_step_redistributes_intermediate_pool() {
        let engine = AllocationEngine;
        let payload = json!({"source_pool": "overhead", "pool_amount": "90.00"});
        let params = json!({
            "steps": [
                {"from": "overhead", "targets": [{"name": "it", "weight": "1"}]},
                {"from": "it", "targets": [{"name": "sales", "weight": "1"}, {"name": "ops", "weight": "2"}]},
            ]
        });
        let output = engine.invoke(&payload, &params).unwrap();
        let final_pools = output.summary["final_pools"].as_object().unwrap();
        let sales = crate::common::to_decimal(&final_pools["sales"]).unwrap();
        let ops = crate::common::to_decimal(&final_pools["ops"]).unwrap();
        assert_eq!(sales + ops, dec!(90.00));
        assert!(ops > sales);
    }

    #[test]
    fn zero_weight_step_is_rejected() {
        let engine = AllocationEngine;
        let payload = json!({"source_pool": "overhead", "pool_amount": "10.00"});
        let params = json!({"steps": [{"from": "overhead", "targets": [{"name": "a", "weight": "0"}]}]});
        assert!(engine.invoke(&payload, &params).is_err());
    }
}
