//! Variance engine: compares an actual amount against an expected/standard
//! amount and reports the absolute and percentage variance.

use crate::common::{decimal_field, decimal_to_value};
use accord_core::engine::{EngineError, EngineInvoker, EngineOutput};
use rust_decimal::Decimal;
use serde_json::{json, Value};

pub struct VarianceEngine;

impl EngineInvoker for VarianceEngine {
    fn name(&self) -> &str {
        "variance"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn invoke(&self, payload: &Value, _params: &Value) -> Result<EngineOutput, EngineError> {
        let actual = decimal_field(payload, "actual_amount")?;
        let expected = decimal_field(payload, "expected_amount")?;
        let variance = actual - expected;
        let percentage = if expected.is_zero() {
            Decimal::ZERO
        } else {
            (variance / expected) * Decimal::from(100)
        };

        Ok(EngineOutput {
            summary: json!({
                "variance": decimal_to_value(variance),
                "variance_percentage": decimal_to_value(percentage),
                "is_favorable": variance.is_sign_negative(),
            }),
        })
    }
}
