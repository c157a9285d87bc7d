//! Billing engine: prices metered usage against a tiered rate schedule.

use crate::common::{array_field, decimal_field, decimal_to_value};
use accord_core::engine::{EngineError, EngineInvoker, EngineOutput};
use rust_decimal::Decimal;
use serde_json::{json, Value};

pub struct BillingEngine;

impl EngineInvoker for BillingEngine {
    fn name(&self) -> &str {
        "billing"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn invoke(&self, payload: &Value, params: &Value) -> Result<EngineOutput, EngineError> {
        let usage = decimal_field(payload, "usage_quantity")?;
        let tiers = array_field(params, "tiers")?;
        if tiers.is_empty() {
            return Err(EngineError::InvalidParams("billing requires at least one tier".into()));
        }

        let mut remaining = usage;
        let mut total = Decimal::ZERO;
        let mut breakdown = Vec::new();

        for tier in tiers {
            if remaining.is_zero() {
                break;
            }
            let capacity = match tier.get("up_to") {
                Some(v) => crate::common::to_decimal(v)?,
                None => remaining,
            };
            let rate = decimal_field(tier, "rate")?;
            let consumed = remaining.min(capacity);
            let tier_cost = (consumed * rate).round_dp(2);
            total += tier_cost;
            breakdown.push(json!({
                "consumed": decimal_to_value(consumed),
                "rate": decimal_to_value(rate),
                "cost": decimal_to_value(tier_cost),
            }));
            remaining -= consumed;
        }

        if !remaining.is_zero() {
            return Err(EngineError::ComputationFailed(format!(
                "{remaining} units of usage exceed the declared tier schedule"
            )));
        }

        Ok(EngineOutput {
            summary: json!({
                "total_charge": decimal_to_value(total),
                "breakdown": breakdown,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn usage_within_first_tier() {
        let engine = BillingEngine;
        let payload = json!({"usage_quantity": "50"});
        let params = json!({"tiers": [{"up_to": "100", "rate": "0.10"}]});
        let output = engine.invoke(&payload, &params).unwrap();
        assert_eq!(
            crate::common::to_decimal(&output.summary["total_charge"]).unwrap(),
            dec!(5.00)
        );
    }

    #[test]
    fn usage_spans_multiple_tiers() {
        let engine = BillingEngine;
        let payload = json!({"usage_quantity": "150"});
        let params = json!({"tiers": [
            {"up_to": "100", "rate": "0.10"},
            {"rate": "0.05"},
        ]});
        let output = engine.invoke(&payload, &params).unwrap();
        assert_eq!(
            crate::common::to_decimal(&output.summary["total_charge"]).unwrap(),
            dec!(12.50)
        );
    }

    #[test]
    fn usage_exceeding_bounded_tiers_fails() {
        let engine = BillingEngine;
        let payload = json!({"usage_quantity": "150"});
        let params = json!({"tiers": [{"up_to": "100", "rate": "0.10"}]});
        assert!(engine.invoke(&payload, &params).is_err());
    }
}
