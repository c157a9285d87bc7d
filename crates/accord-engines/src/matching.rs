//! Matching engine: three-way matches a purchase order, receipt, and invoice
//! line, reporting per-field discrepancies beyond a tolerance.

use crate::common::{decimal_field, decimal_to_value, field};
use accord_core::engine::{EngineError, EngineInvoker, EngineOutput};
use rust_decimal::Decimal;
use serde_json::{json, Value};

pub struct MatchingEngine;

impl EngineInvoker for MatchingEngine {
    fn name(&self) -> &str {
        "matching"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn invoke(&self, payload: &Value, params: &Value) -> Result<EngineOutput, EngineError> {
        let tolerance = params
            .get("tolerance")
            .map(crate::common::to_decimal)
            .transpose()?
            .unwrap_or(Decimal::ZERO);

        let po = field(payload, "purchase_order")?;
        let receipt = field(payload, "receipt")?;
        let invoice = field(payload, "invoice")?;

        let po_qty = decimal_field(po, "quantity")?;
        let receipt_qty = decimal_field(receipt, "quantity")?;
        let invoice_qty = decimal_field(invoice, "quantity")?;

        let po_price = decimal_field(po, "unit_price")?;
        let invoice_price = decimal_field(invoice, "unit_price")?;

        let qty_discrepancy = (receipt_qty - invoice_qty).abs() > tolerance
            || (po_qty - invoice_qty).abs() > tolerance;
        let price_discrepancy = (po_price - invoice_price).abs() > tolerance;

        let matched = !qty_discrepancy && !price_discrepancy;

        Ok(EngineOutput {
            summary: json!({
                "matched": matched,
                "quantity_discrepancy": qty_discrepancy,
                "price_discrepancy": price_discrepancy,
                "po_quantity": decimal_to_value(po_qty),
                "receipt_quantity": decimal_to_value(receipt_qty),
                "invoice_quantity": decimal_to_value(invoice_qty),
            }),
        })
    }
}
