//! Approval rule engine: evaluates a posting's amount and dimensions against
//! an ordered rule set to determine the required approval level and the
//! eligible approver group, for use ahead of `accord_core::approval`.

use crate::common::{array_field, decimal_field, string_field};
use accord_core::engine::{EngineError, EngineInvoker, EngineOutput};
use rust_decimal::Decimal;
use serde_json::{json, Value};

pub struct ApprovalRuleEngine;

impl EngineInvoker for ApprovalRuleEngine {
    fn name(&self) -> &str {
        "approval_rule"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn invoke(&self, payload: &Value, params: &Value) -> Result<EngineOutput, EngineError> {
        let amount = decimal_field(payload, "amount")?;
        let dimension = payload.get("dimension").and_then(Value::as_str);
        let rules = array_field(params, "rules")?;

        let mut matched = None;
        for rule in rules {
            let threshold = decimal_field(rule, "threshold")?;
            let scope = rule.get("dimension").and_then(Value::as_str);
            if amount < threshold {
                continue;
            }
            if let Some(scope) = scope {
                if Some(scope) != dimension {
                    continue;
                }
            }
            let level = string_field(rule, "level")?.to_string();
            let approvers = string_field(rule, "approver_group")?.to_string();
            matched = Some((threshold, level, approvers));
        }

        let (threshold, level, approvers) = match matched {
            Some(m) => m,
            None => (
                Decimal::ZERO,
                "none".to_string(),
                "none".to_string(),
            ),
        };

        Ok(EngineOutput {
            summary: json!({
                "requires_approval": level != "none",
                "level": level,
                "approver_group": approvers,
                "matched_threshold": crate::common::decimal_to_value(threshold),
            }),
        })
    }
}
