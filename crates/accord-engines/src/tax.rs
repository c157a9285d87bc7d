//! Tax engine: computes tax due on a taxable base at a frozen rate.

use crate::common::{decimal_field, decimal_to_value};
use accord_core::engine::{EngineError, EngineInvoker, EngineOutput};
use serde_json::{json, Value};

pub struct TaxEngine;

impl EngineInvoker for TaxEngine {
    fn name(&self) -> &str {
        "tax"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn invoke(&self, payload: &Value, params: &Value) -> Result<EngineOutput, EngineError> {
        let taxable_base = decimal_field(payload, "taxable_base")?;
        let rate = decimal_field(params, "rate")?;
        if rate.is_sign_negative() {
            return Err(EngineError::InvalidParams("tax rate must not be negative".into()));
        }
        let tax_due = (taxable_base * rate).round_dp(2);

        Ok(EngineOutput {
            summary: json!({
                "tax_due": decimal_to_value(tax_due),
                "rate": decimal_to_value(rate),
                "taxable_base": decimal_to_value(taxable_base),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn computes_tax_due_at_rate() {
        let engine = TaxEngine;
        let output = engine
            .invoke(&json!({"taxable_base": "200.00"}), &json!({"rate": "0.0825"}))
            .unwrap();
        assert_eq!(crate::common::to_decimal(&output.summary["tax_due"]).unwrap(), dec!(16.50));
    }

    #[test]
    fn negative_rate_is_rejected() {
        let engine = TaxEngine;
        let result = engine.invoke(&json!({"taxable_base": "200.00"}), &json!({"rate": "-0.05"}));
        assert!(result.is_err());
    }
}
