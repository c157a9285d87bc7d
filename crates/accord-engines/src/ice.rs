//! Intercompany elimination engine: nets paired intercompany balances
//! between two entities down to a single residual, for consolidation
//! close steps.

use crate::common::{array_field, decimal_field, decimal_to_value, string_field};
use accord_core::engine::{EngineError, EngineInvoker, EngineOutput};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::BTreeMap;

pub struct IntercompanyEliminationEngine;

impl EngineInvoker for IntercompanyEliminationEngine {
    fn name(&self) -> &str {
        "ice"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn invoke(&self, payload: &Value, _params: &Value) -> Result<EngineOutput, EngineError> {
        let balances = array_field(payload, "balances")?;

        let mut pairs: BTreeMap<(String, String), Decimal> = BTreeMap::new();
        for balance in balances {
            let holder = string_field(balance, "entity")?.to_string();
            let counterparty = string_field(balance, "counterparty")?.to_string();
            let amount = decimal_field(balance, "amount")?;
            if holder == counterparty {
                return Err(EngineError::InvalidParams(
                    "an entity cannot hold an intercompany balance against itself".into(),
                ));
            }
            let key = if holder < counterparty {
                (holder, counterparty)
            } else {
                (counterparty, holder)
            };
            let is_ascending = key.0 == balance["entity"].as_str().unwrap_or_default();
            let signed = if is_ascending { amount } else { -amount };
            *pairs.entry(key).or_insert(Decimal::ZERO) += signed;
        }

        let mut eliminations = Vec::new();
        for ((entity_a, entity_b), residual) in pairs {
            eliminations.push(json!({
                "entity_a": entity_a,
                "entity_b": entity_b,
                "residual": decimal_to_value(residual),
                "balanced": residual.is_zero(),
            }));
        }

        Ok(EngineOutput {
            summary: json!({ "eliminations": eliminations }),
        })
    }
}
