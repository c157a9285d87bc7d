//! Correction engine: given an original posted entry's lines, produces the
//! mirror-image lines for a full reversal, or a delta set for a partial
//! correction to a new amount.

use crate::common::{array_field, decimal_field, decimal_to_value, string_field};
use accord_core::engine::{EngineError, EngineInvoker, EngineOutput};
use rust_decimal::Decimal;
use serde_json::{json, Value};

pub struct CorrectionEngine;

impl EngineInvoker for CorrectionEngine {
    fn name(&self) -> &str {
        "correction"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn invoke(&self, payload: &Value, params: &Value) -> Result<EngineOutput, EngineError> {
        let mode = string_field(params, "mode")?;
        let original_lines = array_field(payload, "original_lines")?;

        let corrected_lines: Vec<Value> = match mode {
            "full_reversal" => original_lines
                .iter()
                .map(|line| {
                    let role = string_field(line, "role")?.to_string();
                    let side = string_field(line, "side")?;
                    let amount = decimal_field(line, "amount")?;
                    Ok(json!({
                        "role": role,
                        "side": opposite_side(side)?,
                        "amount": decimal_to_value(amount),
                    }))
                })
                .collect::<Result<_, EngineError>>()?,
            "adjust_to_amount" => {
                let new_total = decimal_field(payload, "new_total_amount")?;
                let original_total = total_of(original_lines, "debit")?;
                let delta = new_total - original_total;
                let adjustment_role = string_field(payload, "adjustment_role")?.to_string();
                vec![json!({
                    "role": adjustment_role,
                    "side": if delta.is_sign_negative() { "credit" } else { "debit" },
                    "amount": decimal_to_value(delta.abs()),
                })]
            }
            other => return Err(EngineError::InvalidParams(format!("unknown correction mode '{other}'"))),
        };

        Ok(EngineOutput {
            summary: json!({ "mode": mode, "lines": corrected_lines }),
        })
    }
}

fn opposite_side(side: &str) -> Result<&'static str, EngineError> {
    match side.to_ascii_lowercase().as_str() {
        "debit" => Ok("credit"),
        "credit" => Ok("debit"),
        other => Err(EngineError::InvalidParams(format!("unknown side '{other}'"))),
    }
}

fn total_of(lines: &[Value], side_filter: &str) -> Result<Decimal, EngineError> {
    let mut total = Decimal::ZERO;
    for line in lines {
        if string_field(line, "side")?.eq_ignore_ascii_case(side_filter) {
            total += decimal_field(line, "amount")?;
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn full_reversal_flips_every_side() {
        let engine = CorrectionEngine;
        let payload = json!({
            "original_lines": [
                {"role": "cash", "side": "debit", "amount": "100.00"},
                {"role": "revenue", "side": "credit", "amount": "100.00"},
            ]
        });
        let output = engine.invoke(&payload, &json!({"mode": "full_reversal"})).unwrap();
        let lines = output.summary["lines"].as_array().unwrap();
        assert_eq!(lines[0]["side"], json!("credit"));
        assert_eq!(lines[1]["side"], json!("debit"));
    }

    #[test]
    fn adjust_to_amount_produces_a_delta_line() {
        let engine = CorrectionEngine;
        let payload = json!({
            "original_lines": [
                {"role": "cash", "side": "debit", "amount": "100.00"},
            ],
            "new_total_amount": "120.00",
            "adjustment_role": "cash",
        });
        let output = engine.invoke(&payload, &json!({"mode": "adjust_to_amount"})).unwrap();
        let lines = output.summary["lines"].as_array().unwrap();
        assert_eq!(
            crate::common::to_decimal(&lines[0]["amount"]).unwrap(),
            dec!(20.00)
        );
        assert_eq!(lines[0]["side"], json!("debit"));
    }
}
