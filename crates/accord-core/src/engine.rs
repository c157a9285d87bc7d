//! Engine dispatcher: the pluggable registry of pure calculation engines
//! (spec §4.6). Mirrors the teacher's connector-registry pattern — a `dyn`-safe,
//! `Send + Sync` trait object per engine, resolved by name out of a `HashMap`.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub type EngineId = String;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("computation failed: {0}")]
    ComputationFailed(String),
}

/// The result of one engine invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineOutput {
    pub summary: Value,
}

/// A pure, deterministic calculation engine: a function of `(payload,
/// frozen_params)` only. No I/O, clock, or RNG access — the same inputs always
/// produce the same output, which is what makes replay (R24) sound.
pub trait EngineInvoker: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn invoke(&self, payload: &Value, params: &Value) -> Result<EngineOutput, EngineError>;

    /// An optional JSON Schema contract for this engine's `params`. When
    /// present, the dispatcher validates incoming parameters against it
    /// before `invoke` is ever called.
    fn params_schema(&self) -> Option<Value> {
        None
    }
}

/// One record of an engine invocation, captured for the posting's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineTrace {
    pub engine: String,
    pub version: String,
    pub input_fingerprint: String,
    pub output: Value,
    pub duration_micros: u128,
    pub params: Value,
}

#[derive(Default)]
pub struct EngineRegistry {
    engines: HashMap<EngineId, Arc<dyn EngineInvoker>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: impl Into<EngineId>, engine: Arc<dyn EngineInvoker>) {
        self.engines.insert(id.into(), engine);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn EngineInvoker>> {
        self.engines.get(id).cloned()
    }
}

/// Validates invocation parameters against a JSON Schema contract before the
/// engine ever sees them, so a malformed engine parameter never reaches pure
/// calculation code.
pub fn validate_params(schema: &Value, params: &Value) -> Result<(), EngineError> {
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| EngineError::InvalidParams(format!("invalid schema: {e}")))?;
    if let Err(errors) = compiled.validate(params) {
        let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(EngineError::InvalidParams(messages.join("; ")));
    }
    Ok(())
}

pub struct EngineDispatcher<'a> {
    registry: &'a EngineRegistry,
}

impl<'a> EngineDispatcher<'a> {
    pub fn new(registry: &'a EngineRegistry) -> Self {
        Self { registry }
    }

    /// Invokes `engine_ids` in order against `payload`/`params`, recording an
    /// [`EngineTrace`] for each and converting [`EngineError`] into the crate-wide
    /// [`Error`] with the engine's name attached.
    #[tracing::instrument(level = "debug", skip(self, payload, params))]
    pub fn dispatch_all(
        &self,
        engine_ids: &[(EngineId, Value)],
        payload: &Value,
    ) -> Result<Vec<EngineTrace>, Error>
    where
    {
        let mut traces = Vec::with_capacity(engine_ids.len());
        for (engine_id, params) in engine_ids {
            let engine = self
                .registry
                .get(engine_id)
                .ok_or_else(|| Error::EngineNotRegistered(engine_id.clone()))?;

            if let Some(schema) = engine.params_schema() {
                validate_params(&schema, params).map_err(|e| match e {
                    EngineError::InvalidParams(message) => Error::EngineParamInvalid {
                        engine: engine_id.clone(),
                        message,
                    },
                    EngineError::ComputationFailed(message) => Error::EngineFailed {
                        engine: engine_id.clone(),
                        message,
                    },
                })?;
            }

            let fingerprint = crate::audit::hash_payload(payload);
            let started = Instant::now();
            let output = engine.invoke(payload, params).map_err(|e| match e {
                EngineError::InvalidParams(message) => Error::EngineParamInvalid {
                    engine: engine_id.clone(),
                    message,
                },
                EngineError::ComputationFailed(message) => Error::EngineFailed {
                    engine: engine_id.clone(),
                    message,
                },
            })?;
            let duration: Duration = started.elapsed();

            tracing::debug!(engine = %engine_id, duration_micros = duration.as_micros(), "engine dispatched");

            traces.push(EngineTrace {
                engine: engine.name().to_string(),
                version: engine.version().to_string(),
                input_fingerprint: fingerprint,
                output: output.summary,
                duration_micros: duration.as_micros(),
                params: params.clone(),
            });
        }
        Ok(traces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoEngine;

    impl EngineInvoker for EchoEngine {
        fn name(&self) -> &str {
            "echo"
        }
        fn version(&self) -> &str {
            "1.0.0"
        }
        fn invoke(&self, payload: &Value, _params: &Value) -> Result<EngineOutput, EngineError> {
            Ok(EngineOutput {
                summary: payload.clone(),
            })
        }
    }

    struct FailingEngine;

    impl EngineInvoker for FailingEngine {
        fn name(&self) -> &str {
            "failing"
        }
        fn version(&self) -> &str {
            "1.0.0"
        }
        fn invoke(&self, _payload: &Value, _params: &Value) -> Result<EngineOutput, EngineError> {
            Err(EngineError::ComputationFailed("boom".into()))
        }
    }

    #[test]
    fn dispatches_registered_engine() {
        let mut registry = EngineRegistry::new();
        registry.register("echo", Arc::new(EchoEngine));
        let dispatcher = EngineDispatcher::new(&registry);
        let payload = json!({"a": 1});
        let traces = dispatcher
            .dispatch_all(&[("echo".to_string(), json!({}))], &payload)
            .unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].output, payload);
    }

    #[test]
    fn unregistered_engine_is_an_error() {
        let registry = EngineRegistry::new();
        let dispatcher = EngineDispatcher::new(&registry);
        let result = dispatcher.dispatch_all(&[("missing".to_string(), json!({}))], &json!({}));
        assert!(matches!(result, Err(Error::EngineNotRegistered(_))));
    }

    #[test]
    fn engine_failure_is_propagated() {
        let mut registry = EngineRegistry::new();
        registry.register("failing", Arc::new(FailingEngine));
        let dispatcher = EngineDispatcher::new(&registry);
        let result = dispatcher.dispatch_all(&[("failing".to_string(), json!({}))], &json!({}));
        assert!(matches!(result, Err(Error::EngineFailed { .. })));
    }

    #[test]
    fn param_schema_validation_rejects_bad_params() {
        let schema = json!({"type": "object", "required": ["rate"]});
        assert!(validate_params(&schema, &json!({})).is_err());
        assert!(validate_params(&schema, &json!({"rate": 0.1})).is_ok());
    }

    struct SchemaEngine;

    impl EngineInvoker for SchemaEngine {
        fn name(&self) -> &str {
            "schema"
        }
        fn version(&self) -> &str {
            "1.0.0"
        }
        fn invoke(&self, payload: &Value, _params: &Value) -> Result<EngineOutput, EngineError> {
            Ok(EngineOutput { summary: payload.clone() })
        }
        fn params_schema(&self) -> Option<Value> {
            Some(json!({"type": "object", "required": ["rate"]}))
        }
    }

    #[test]
    fn dispatch_all_rejects_params_failing_the_engines_schema() {
        let mut registry = EngineRegistry::new();
        registry.register("schema", Arc::new(SchemaEngine));
        let dispatcher = EngineDispatcher::new(&registry);
        let result = dispatcher.dispatch_all(&[("schema".to_string(), json!({}))], &json!({}));
        assert!(matches!(result, Err(Error::EngineParamInvalid { .. })));
    }

    #[test]
    fn dispatch_all_accepts_params_passing_the_engines_schema() {
        let mut registry = EngineRegistry::new();
        registry.register("schema", Arc::new(SchemaEngine));
        let dispatcher = EngineDispatcher::new(&registry);
        let result = dispatcher.dispatch_all(&[("schema".to_string(), json!({"rate": 0.1}))], &json!({}));
        assert!(result.is_ok());
    }
}
