//! Aging engine: buckets an open-item balance by days-past-due, using the
//! caller-supplied "as of" date and the item's due date.

use crate::common::{decimal_field, decimal_to_value, string_field};
use accord_core::engine::{EngineError, EngineInvoker, EngineOutput};
use chrono::NaiveDate;
use serde_json::{json, Value};

const BUCKET_LABELS: [&str; 5] = ["current", "1_30", "31_60", "61_90", "over_90"];

pub struct AgingEngine;

impl EngineInvoker for AgingEngine {
    fn name(&self) -> &str {
        "aging"
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn invoke(&self, payload: &Value, params: &Value) -> Result<EngineOutput, EngineError> {
        let as_of = parse_date(string_field(params, "as_of")?)?;
        let due_date = parse_date(string_field(payload, "due_date")?)?;
        let amount = decimal_field(payload, "amount")?;

        let days_past_due = (as_of - due_date).num_days();
        let bucket = bucket_for(days_past_due);

        Ok(EngineOutput {
            summary: json!({
                "bucket": bucket,
                "days_past_due": days_past_due,
                "amount": decimal_to_value(amount),
            }),
        })
    }
}

fn bucket_for(days_past_due: i64) -> &'static str {
    match days_past_due {
        d if d <= 0 => BUCKET_LABELS[0],
        1..=30 => BUCKET_LABELS[1],
        31..=60 => BUCKET_LABELS[2],
        61..=90 => BUCKET_LABELS[3],
        _ => BUCKET_LABELS[4],
    }
}

fn parse_date(raw: &str) -> Result<NaiveDate, EngineError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| EngineError::InvalidParams(format!("invalid date '{raw}': {e}")))
}
