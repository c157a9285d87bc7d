//! Restricted-expression-AST guard evaluator.
//!
//! `GuardExpr` is a closed tagged enum: the set of node kinds is fixed and
//! validated when the compiled pack is parsed (compile time), so evaluation never
//! encounters an unrecognized node and is total over any well-formed `GuardExpr`
//! value — there is no "unknown function" failure mode at runtime.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardSeverity {
    Reject,
    Block,
    Warn,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardRule {
    pub reason_code: String,
    pub message: String,
    pub severity: GuardSeverity,
    /// Expression evaluating to truthy-fails-the-guard: the guard fires when
    /// `expr` evaluates to `false`.
    pub expr: GuardExpr,
}

/// Closed set of guard expression node kinds. A policy pack containing any other
/// shape fails to parse into this type at load time, never at evaluation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GuardExpr {
    Literal { value: Value },
    Field { path: String },
    Eq { left: Box<GuardExpr>, right: Box<GuardExpr> },
    Ne { left: Box<GuardExpr>, right: Box<GuardExpr> },
    Lt { left: Box<GuardExpr>, right: Box<GuardExpr> },
    Lte { left: Box<GuardExpr>, right: Box<GuardExpr> },
    Gt { left: Box<GuardExpr>, right: Box<GuardExpr> },
    Gte { left: Box<GuardExpr>, right: Box<GuardExpr> },
    And { terms: Vec<GuardExpr> },
    Or { terms: Vec<GuardExpr> },
    Not { term: Box<GuardExpr> },
    In { needle: Box<GuardExpr>, haystack: Vec<GuardExpr> },
    Add { left: Box<GuardExpr>, right: Box<GuardExpr> },
    Sub { left: Box<GuardExpr>, right: Box<GuardExpr> },
    Ternary {
        cond: Box<GuardExpr>,
        if_true: Box<GuardExpr>,
        if_false: Box<GuardExpr>,
    },
    /// Call into the closed function allowlist: `abs`, `len`, `check_credit_limit`.
    Call { func: GuardFunc, args: Vec<GuardExpr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardFunc {
    Abs,
    Len,
    CheckCreditLimit,
}

#[derive(Debug, Clone)]
pub enum GuardOutcome {
    Pass,
    Warn { reason_code: String, message: String },
    Block { reason_code: String, message: String },
    Reject { reason_code: String, message: String },
}

/// Evaluates `GuardExpr` trees against a JSON payload. Stateless and total: every
/// well-formed expression evaluates to a `Value` or an [`Error::InvalidQuantity`]
/// for a type mismatch (e.g. comparing a string to a number), never a panic.
pub struct GuardEvaluator;

impl GuardEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(&self, rule: &GuardRule, payload: &Value) -> Result<GuardOutcome, Error> {
        let result = self.eval_expr(&rule.expr, payload)?;
        let fires = !truthy(&result);
        if !fires {
            return Ok(GuardOutcome::Pass);
        }
        Ok(match rule.severity {
            GuardSeverity::Reject => GuardOutcome::Reject {
                reason_code: rule.reason_code.clone(),
                message: rule.message.clone(),
            },
            GuardSeverity::Block => GuardOutcome::Block {
                reason_code: rule.reason_code.clone(),
                message: rule.message.clone(),
            },
            GuardSeverity::Warn => GuardOutcome::Warn {
                reason_code: rule.reason_code.clone(),
                message: rule.message.clone(),
            },
        })
    }

    fn eval_expr(&self, expr: &GuardExpr, payload: &Value) -> Result<Value, Error> {
        match expr {
            GuardExpr::Literal { value } => Ok(value.clone()),
            GuardExpr::Field { path } => Ok(pointer(payload, path).cloned().unwrap_or(Value::Null)),
            GuardExpr::Eq { left, right } => {
                Ok(Value::Bool(self.eval_expr(left, payload)? == self.eval_expr(right, payload)?))
            }
            GuardExpr::Ne { left, right } => {
                Ok(Value::Bool(self.eval_expr(left, payload)? != self.eval_expr(right, payload)?))
            }
            GuardExpr::Lt { left, right } => self.compare(left, right, payload, |o| o.is_lt()),
            GuardExpr::Lte { left, right } => self.compare(left, right, payload, |o| o.is_le()),
            GuardExpr::Gt { left, right } => self.compare(left, right, payload, |o| o.is_gt()),
            GuardExpr::Gte { left, right } => self.compare(left, right, payload, |o| o.is_ge()),
            GuardExpr::And { terms } => {
                for term in terms {
                    if !truthy(&self.eval_expr(term, payload)?) {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            GuardExpr::Or { terms } => {
                for term in terms {
                    if truthy(&self.eval_expr(term, payload)?) {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            GuardExpr::Not { term } => Ok(Value::Bool(!truthy(&self.eval_expr(term, payload)?))),
            GuardExpr::In { needle, haystack } => {
                let needle_val = self.eval_expr(needle, payload)?;
                for candidate in haystack {
                    if self.eval_expr(candidate, payload)? == needle_val {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            GuardExpr::Add { left, right } => {
                let l = as_decimal(&self.eval_expr(left, payload)?)?;
                let r = as_decimal(&self.eval_expr(right, payload)?)?;
                Ok(decimal_to_value(l + r))
            }
            GuardExpr::Sub { left, right } => {
                let l = as_decimal(&self.eval_expr(left, payload)?)?;
                let r = as_decimal(&self.eval_expr(right, payload)?)?;
                Ok(decimal_to_value(l - r))
            }
            GuardExpr::Ternary { cond, if_true, if_false } => {
                if truthy(&self.eval_expr(cond, payload)?) {
                    self.eval_expr(if_true, payload)
                } else {
                    self.eval_expr(if_false, payload)
                }
            }
            GuardExpr::Call { func, args } => self.eval_call(*func, args, payload),
        }
    }

    fn compare(
        &self,
        left: &GuardExpr,
        right: &GuardExpr,
        payload: &Value,
        pred: impl Fn(std::cmp::Ordering) -> bool,
    ) -> Result<Value, Error> {
        let l = as_decimal(&self.eval_expr(left, payload)?)?;
        let r = as_decimal(&self.eval_expr(right, payload)?)?;
        Ok(Value::Bool(pred(l.cmp(&r))))
    }

    fn eval_call(&self, func: GuardFunc, args: &[GuardExpr], payload: &Value) -> Result<Value, Error> {
        match func {
            GuardFunc::Abs => {
                let arg = args
                    .first()
                    .ok_or_else(|| Error::InvalidQuantity("abs() requires one argument".into()))?;
                let d = as_decimal(&self.eval_expr(arg, payload)?)?;
                Ok(decimal_to_value(d.abs()))
            }
            GuardFunc::Len => {
                let arg = args
                    .first()
                    .ok_or_else(|| Error::InvalidQuantity("len() requires one argument".into()))?;
                let value = self.eval_expr(arg, payload)?;
                let len = match &value {
                    Value::Array(items) => items.len(),
                    Value::String(s) => s.chars().count(),
                    Value::Object(map) => map.len(),
                    _ => {
                        return Err(Error::InvalidQuantity(
                            "len() requires an array, string, or object".into(),
                        ))
                    }
                };
                Ok(Value::Number(len.into()))
            }
            GuardFunc::CheckCreditLimit => {
                if args.len() != 2 {
                    return Err(Error::InvalidQuantity(
                        "check_credit_limit() requires (balance, limit) arguments".into(),
                    ));
                }
                let balance = as_decimal(&self.eval_expr(&args[0], payload)?)?;
                let limit = as_decimal(&self.eval_expr(&args[1], payload)?)?;
                Ok(Value::Bool(balance <= limit))
            }
        }
    }
}

impl Default for GuardEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn pointer<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(stripped) = path.strip_prefix('/') {
        payload.pointer(&format!("/{stripped}"))
    } else {
        payload.pointer(&format!("/{path}"))
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn as_decimal(value: &Value) -> Result<rust_decimal::Decimal, Error> {
    use std::str::FromStr;
    match value {
        Value::Number(n) => rust_decimal::Decimal::from_str(&n.to_string())
            .map_err(|e| Error::InvalidQuantity(format!("not a valid decimal: {e}"))),
        Value::String(s) => rust_decimal::Decimal::from_str(s)
            .map_err(|e| Error::InvalidQuantity(format!("not a valid decimal: {e}"))),
        other => Err(Error::InvalidQuantity(format!(
            "expected a numeric value, got {other}"
        ))),
    }
}

fn decimal_to_value(d: rust_decimal::Decimal) -> Value {
    serde_json::Number::from_str(&d.to_string())
        .map(Value::Number)
        .unwrap_or_else(|_| Value::String(d.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(severity: GuardSeverity, expr: GuardExpr) -> GuardRule {
        GuardRule {
            reason_code: "TEST_GUARD".into(),
            message: "test guard fired".into(),
            severity,
            expr,
        }
    }

    #[test]
    fn guard_passes_when_predicate_true() {
        let evaluator = GuardEvaluator::new();
        let r = rule(
            GuardSeverity::Reject,
            GuardExpr::Lte {
                left: Box::new(GuardExpr::Field { path: "amount".into() }),
                right: Box::new(GuardExpr::Literal { value: json!(1000) }),
            },
        );
        let outcome = evaluator.evaluate(&r, &json!({"amount": 500})).unwrap();
        assert!(matches!(outcome, GuardOutcome::Pass));
    }

    #[test]
    fn guard_rejects_when_predicate_false() {
        let evaluator = GuardEvaluator::new();
        let r = rule(
            GuardSeverity::Reject,
            GuardExpr::Lte {
                left: Box::new(GuardExpr::Field { path: "amount".into() }),
                right: Box::new(GuardExpr::Literal { value: json!(1000) }),
            },
        );
        let outcome = evaluator.evaluate(&r, &json!({"amount": 5000})).unwrap();
        assert!(matches!(outcome, GuardOutcome::Reject { .. }));
    }

    #[test]
    fn warn_severity_never_blocks() {
        let evaluator = GuardEvaluator::new();
        let r = rule(GuardSeverity::Warn, GuardExpr::Literal { value: json!(false) });
        let outcome = evaluator.evaluate(&r, &json!({})).unwrap();
        assert!(matches!(outcome, GuardOutcome::Warn { .. }));
    }

    #[test]
    fn check_credit_limit_allowlisted_function() {
        let evaluator = GuardEvaluator::new();
        let r = rule(
            GuardSeverity::Block,
            GuardExpr::Call {
                func: GuardFunc::CheckCreditLimit,
                args: vec![
                    GuardExpr::Field { path: "balance".into() },
                    GuardExpr::Field { path: "limit".into() },
                ],
            },
        );
        let outcome = evaluator
            .evaluate(&r, &json!({"balance": 1500, "limit": 1000}))
            .unwrap();
        assert!(matches!(outcome, GuardOutcome::Block { .. }));
    }

    #[test]
    fn abs_and_ternary_compose() {
        let evaluator = GuardEvaluator::new();
        let expr = GuardExpr::Lte {
            left: Box::new(GuardExpr::Call {
                func: GuardFunc::Abs,
                args: vec![GuardExpr::Field { path: "variance".into() }],
            }),
            right: Box::new(GuardExpr::Literal { value: json!(10) }),
        };
        let r = rule(GuardSeverity::Reject, expr);
        let outcome = evaluator.evaluate(&r, &json!({"variance": -5})).unwrap();
        assert!(matches!(outcome, GuardOutcome::Pass));
    }
}
