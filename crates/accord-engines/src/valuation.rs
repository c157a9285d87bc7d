//! Valuation engine: costs a withdrawal quantity against a set of inventory
//! lots using FIFO, LIFO, weighted-average, or standard-cost strategies.

use crate::common::{array_field, decimal_field, decimal_to_value, field, string_field};
use accord_core::engine::{EngineError, EngineInvoker, EngineOutput};
use accord_core::money::{Currency, Money};
use accord_core::types::{CostLot, CostMethod};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::str::FromStr;
use uuid::Uuid;

pub struct ValuationEngine;

impl EngineInvoker for ValuationEngine {
    fn name(&self) -> &str {
        "valuation"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn invoke(&self, payload: &Value, params: &Value) -> Result<EngineOutput, EngineError> {
        let strategy = string_field(params, "strategy")?;
        let withdrawal_qty = decimal_field(payload, "quantity")?;

        let cost = match strategy {
            "standard" => {
                let standard_cost = decimal_field(params, "standard_cost")?;
                withdrawal_qty * standard_cost
            }
            "weighted_average" => {
                let lots = parse_lots(payload)?;
                let (total_qty, total_cost) = lot_totals(&lots);
                if total_qty.is_zero() {
                    return Err(EngineError::InvalidParams("no lots available for valuation".into()));
                }
                let unit_cost = total_cost / total_qty;
                withdrawal_qty * unit_cost
            }
            "fifo" => consume_lots(&parse_lots(payload)?, withdrawal_qty, false)?,
            "lifo" => consume_lots(&parse_lots(payload)?, withdrawal_qty, true)?,
            other => {
                return Err(EngineError::InvalidParams(format!(
                    "unknown valuation strategy '{other}'"
                )))
            }
        };

        Ok(EngineOutput {
            summary: json!({
                "strategy": strategy,
                "total_cost": decimal_to_value(cost.round_dp(2)),
            }),
        })
    }
}

/// Parses `payload.lots` into [`CostLot`]s, validating each through
/// [`CostLot::new`] (C1-C3) rather than trusting the raw JSON shape.
fn parse_lots(payload: &Value) -> Result<Vec<CostLot>, EngineError> {
    array_field(payload, "lots")?.iter().map(parse_lot).collect()
}

fn parse_lot(lot: &Value) -> Result<CostLot, EngineError> {
    let item_id = string_field(lot, "item_id")?;
    let location_id = string_field(lot, "location_id")?;
    let lot_date_raw = string_field(lot, "lot_date")?;
    let lot_date = DateTime::parse_from_rfc3339(lot_date_raw)
        .map_err(|e| EngineError::InvalidParams(format!("invalid lot_date '{lot_date_raw}': {e}")))?
        .with_timezone(&Utc);
    let quantity = decimal_field(lot, "quantity")?;
    let unit_cost = decimal_field(lot, "unit_cost")?;
    let currency_code = string_field(lot, "currency")?;
    let currency = Currency::new(currency_code).map_err(core_err)?;
    let cost_method_raw = string_field(lot, "cost_method")?;
    let cost_method = CostMethod::from_str(cost_method_raw)
        .map_err(|e| EngineError::InvalidParams(format!("invalid cost_method: {e}")))?;
    let source_event_id_raw = string_field(lot, "source_event_id")?;
    let source_event_id = Uuid::parse_str(source_event_id_raw)
        .map_err(|e| EngineError::InvalidParams(format!("invalid source_event_id '{source_event_id_raw}': {e}")))?;
    let lot_id = field(lot, "lot_id")
        .ok()
        .and_then(Value::as_str)
        .map(Uuid::parse_str)
        .transpose()
        .map_err(|e| EngineError::InvalidParams(format!("invalid lot_id: {e}")))?
        .unwrap_or_else(Uuid::new_v4);

    let original_cost = Money::new(quantity * unit_cost, currency.clone()).map_err(core_err)?;

    CostLot::new(
        lot_id,
        item_id,
        location_id,
        lot_date,
        quantity,
        original_cost,
        currency,
        cost_method,
        source_event_id,
    )
    .map_err(core_err)
}

fn core_err(e: accord_core::error::Error) -> EngineError {
    EngineError::InvalidParams(e.to_string())
}

fn lot_totals(lots: &[CostLot]) -> (Decimal, Decimal) {
    let mut total_qty = Decimal::ZERO;
    let mut total_cost = Decimal::ZERO;
    for lot in lots {
        total_qty += lot.original_quantity;
        total_cost += lot.original_cost.amount();
    }
    (total_qty, total_cost)
}

/// Consumes lots in FIFO (oldest first, as given) or LIFO (newest first) order
/// to cost a withdrawal quantity.
fn consume_lots(lots: &[CostLot], mut remaining: Decimal, reverse: bool) -> Result<Decimal, EngineError> {
    let mut ordered: Vec<&CostLot> = lots.iter().collect();
    if reverse {
        ordered.reverse();
    }

    let mut total_cost = Decimal::ZERO;
    for lot in ordered {
        if remaining.is_zero() {
            break;
        }
        let consumed = remaining.min(lot.original_quantity);
        total_cost += consumed * lot.unit_cost();
        remaining -= consumed;
    }

    if !remaining.is_zero() {
        return Err(EngineError::ComputationFailed(format!(
            "insufficient lot quantity to cost withdrawal; {remaining} units unaccounted for"
        )));
    }

    Ok(total_cost)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn lots() -> Value {
        json!({
            "quantity": "15",
            "lots": [
                {
                    "item_id": "sku-1", "location_id": "wh-1", "lot_date": "2026-01-01T00:00:00Z",
                    "quantity": "10", "unit_cost": "2.00", "currency": "USD", "cost_method": "fifo",
                    "source_event_id": "00000000-0000-0000-0000-000000000001"
                },
                {
                    "item_id": "sku-1", "location_id": "wh-1", "lot_date": "2026-01-05T00:00:00Z",
                    "quantity": "10", "unit_cost": "3.00", "currency": "USD", "cost_method": "fifo",
                    "source_event_id": "00000000-0000-0000-0000-000000000002"
                },
            ]
        })
    }

    #[test]
    fn fifo_consumes_oldest_lots_first() {
        let engine = ValuationEngine;
        let output = engine.invoke(&lots(), &json!({"strategy": "fifo"})).unwrap();
        assert_eq!(
            crate::common::to_decimal(&output.summary["total_cost"]).unwrap(),
            dec!(35.00)
        );
    }

    #[test]
    fn lifo_consumes_newest_lots_first() {
        let engine = ValuationEngine;
        let output = engine.invoke(&lots(), &json!({"strategy": "lifo"})).unwrap();
        assert_eq!(
            crate::common::to_decimal(&output.summary["total_cost"]).unwrap(),
            dec!(40.00)
        );
    }

    #[test]
    fn weighted_average_blends_unit_costs() {
        let engine = ValuationEngine;
        let output = engine.invoke(&lots(), &json!({"strategy": "weighted_average"})).unwrap();
        assert_eq!(
            crate::common::to_decimal(&output.summary["total_cost"]).unwrap(),
            dec!(37.50)
        );
    }

    #[test]
    fn standard_cost_ignores_lots() {
        let engine = ValuationEngine;
        let payload = json!({"quantity": "15"});
        let output = engine
            .invoke(&payload, &json!({"strategy": "standard", "standard_cost": "2.50"}))
            .unwrap();
        assert_eq!(
            crate::common::to_decimal(&output.summary["total_cost"]).unwrap(),
            dec!(37.50)
        );
    }

    #[test]
    fn insufficient_lots_fails() {
        let engine = ValuationEngine;
        let payload = json!({
            "quantity": "100",
            "lots": [{
                "item_id": "sku-1", "location_id": "wh-1", "lot_date": "2026-01-01T00:00:00Z",
                "quantity": "10", "unit_cost": "2.00", "currency": "USD", "cost_method": "fifo",
                "source_event_id": "00000000-0000-0000-0000-000000000001"
            }]
        });
        let result = engine.invoke(&payload, &json!({"strategy": "fifo"}));
        assert!(result.is_err());
    }

    #[test]
    fn malformed_lot_missing_required_field_is_rejected() {
        let engine = ValuationEngine;
        let payload = json!({
            "quantity": "10",
            "lots": [{"quantity": "10", "unit_cost": "2.00"}]
        });
        let result = engine.invoke(&payload, &json!({"strategy": "fifo"}));
        assert!(result.is_err());
    }
}
