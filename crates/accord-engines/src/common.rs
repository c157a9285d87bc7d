//! Shared helpers for reading decimal/string fields out of engine payloads.

use accord_core::engine::EngineError;
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;

pub fn field<'a>(value: &'a Value, key: &str) -> Result<&'a Value, EngineError> {
    value
        .get(key)
        .ok_or_else(|| EngineError::InvalidParams(format!("missing field '{key}'")))
}

pub fn decimal_field(value: &Value, key: &str) -> Result<Decimal, EngineError> {
    to_decimal(field(value, key)?)
}

pub fn to_decimal(value: &Value) -> Result<Decimal, EngineError> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string())
            .map_err(|e| EngineError::InvalidParams(format!("not a valid decimal: {e}"))),
        Value::String(s) => {
            Decimal::from_str(s).map_err(|e| EngineError::InvalidParams(format!("not a valid decimal: {e}")))
        }
        other => Err(EngineError::InvalidParams(format!("expected a number, got {other}"))),
    }
}

pub fn string_field<'a>(value: &'a Value, key: &str) -> Result<&'a str, EngineError> {
    field(value, key)?
        .as_str()
        .ok_or_else(|| EngineError::InvalidParams(format!("field '{key}' is not a string")))
}

pub fn array_field<'a>(value: &'a Value, key: &str) -> Result<&'a Vec<Value>, EngineError> {
    field(value, key)?
        .as_array()
        .ok_or_else(|| EngineError::InvalidParams(format!("field '{key}' is not an array")))
}

pub fn decimal_to_value(d: Decimal) -> Value {
    serde_json::Number::from_str(&d.to_string())
        .map(Value::Number)
        .unwrap_or_else(|_| Value::String(d.to_string()))
}
