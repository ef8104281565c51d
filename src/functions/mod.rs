//! Holds tool schemas, validates LLM-produced arguments, and routes to executors, per
//! SPEC_FULL §4.6. Generalizes the shape of `cloudllm::tool_protocol::ToolRegistry`
//! (disjoint schema sets, a structured error on unknown names, builder-style schema
//! construction) to the spec's validation rules (required/type/enum, numeric-string
//! coercion, unknown-parameter tolerance).

use crate::errors::{ReverieError, Result};
use crate::model::Stream;
use crate::provider::retry::RetryConfig;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub param_type: ParamType,
    pub required: bool,
    pub enum_values: Option<Vec<Value>>,
}

#[derive(Debug, Clone)]
pub struct FunctionSchema {
    pub name: String,
    pub description: String,
    pub parameters: HashMap<String, ParamSpec>,
}

impl FunctionSchema {
    pub fn parameters_json(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for (name, spec) in &self.parameters {
            let mut prop = json!({ "type": param_type_str(spec.param_type) });
            if let Some(values) = &spec.enum_values {
                prop["enum"] = json!(values);
            }
            properties.insert(name.clone(), prop);
            if spec.required {
                required.push(name.clone());
            }
        }
        json!({ "type": "object", "properties": properties, "required": required })
    }
}

fn param_type_str(t: ParamType) -> &'static str {
    match t {
        ParamType::String => "string",
        ParamType::Integer => "integer",
        ParamType::Number => "number",
        ParamType::Boolean => "boolean",
        ParamType::Array => "array",
        ParamType::Object => "object",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaCategory {
    DataQuery,
    Template,
    Analytics,
}

/// Executes a validated call. Template executors never receive `streams`; data/analytics
/// executors require a non-empty slice.
#[async_trait]
pub trait FunctionExecutor: Send + Sync {
    async fn execute(&self, args: &Value, streams: Option<&[Stream]>) -> Result<Value>;
}

struct RegisteredFunction {
    schema: FunctionSchema,
    category: SchemaCategory,
    executor: Arc<dyn FunctionExecutor>,
}

/// Validates `args` against `schema`: missing required parameters, type mismatches, and
/// enum violations are rejected; unknown parameters are tolerated (forward-compatible).
pub fn validate_arguments(schema: &FunctionSchema, args: &Value) -> Result<()> {
    let obj = args
        .as_object()
        .ok_or_else(|| ReverieError::validation("arguments must be a JSON object"))?;

    let mut missing = Vec::new();
    for (name, spec) in &schema.parameters {
        if spec.required && !obj.contains_key(name) {
            missing.push(name.clone());
        }
    }
    if !missing.is_empty() {
        return Err(ReverieError::validation(format!(
            "missing required parameter(s): {}",
            missing.join(", ")
        )));
    }

    let mut type_errors = Vec::new();
    for (name, value) in obj {
        let Some(spec) = schema.parameters.get(name) else {
            continue; // unknown parameters are a warning, not an error
        };
        if !type_matches(spec.param_type, value) {
            type_errors.push(name.clone());
            continue;
        }
        if let Some(allowed) = &spec.enum_values {
            let coerced = coerce(spec.param_type, value);
            if !allowed.iter().any(|v| values_equal(v, &coerced)) {
                return Err(ReverieError::validation(format!(
                    "parameter '{name}' must be one of {allowed:?}"
                )));
            }
        }
    }
    if !type_errors.is_empty() {
        return Err(ReverieError::validation(format!(
            "type mismatch for parameter(s): {}",
            type_errors.join(", ")
        )));
    }
    Ok(())
}

fn values_equal(a: &Value, b: &Value) -> bool {
    a == b || a.to_string() == b.to_string()
}

/// Controlled coercions: integer accepted as number; numeric string accepted for number
/// or integer.
fn type_matches(expected: ParamType, value: &Value) -> bool {
    match expected {
        ParamType::String => value.is_string(),
        ParamType::Integer => value.is_i64() || value.is_u64() || (value.is_string() && value.as_str().unwrap().parse::<i64>().is_ok()),
        ParamType::Number => value.is_number() || (value.is_string() && value.as_str().unwrap().parse::<f64>().is_ok()),
        ParamType::Boolean => value.is_boolean(),
        ParamType::Array => value.is_array(),
        ParamType::Object => value.is_object(),
    }
}

fn coerce(expected: ParamType, value: &Value) -> Value {
    match expected {
        ParamType::Integer if value.is_string() => value
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .map(Value::from)
            .unwrap_or_else(|| value.clone()),
        ParamType::Number if value.is_string() => value
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| value.clone()),
        _ => value.clone(),
    }
}

pub struct FunctionRegistry {
    functions: HashMap<String, RegisteredFunction>,
    enabled: Option<HashSet<String>>,
    retry_config: RetryConfig,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        FunctionRegistry {
            functions: HashMap::new(),
            enabled: None,
            retry_config: RetryConfig::default(),
        }
    }

    pub fn register(&mut self, schema: FunctionSchema, category: SchemaCategory, executor: Arc<dyn FunctionExecutor>) {
        self.functions.insert(
            schema.name.clone(),
            RegisteredFunction {
                schema,
                category,
                executor,
            },
        );
    }

    /// Restricts enablement to a user-controlled subset; `None` leaves it unconstrained.
    pub fn set_enabled(&mut self, names: Option<HashSet<String>>) {
        self.enabled = names;
    }

    /// Intersects registered schemas with the enablement list; returns all schemas when
    /// enablement is unconstrained.
    pub fn get_enabled_schemas(&self) -> Vec<FunctionSchema> {
        self.functions
            .values()
            .filter(|f| self.enabled.as_ref().is_none_or(|set| set.contains(&f.schema.name)))
            .map(|f| f.schema.clone())
            .collect()
    }

    pub async fn execute(&self, name: &str, args: &Value, streams: Option<&[Stream]>) -> Result<Value> {
        let registered = self
            .functions
            .get(name)
            .ok_or_else(|| ReverieError::validation(format!("unknown function '{name}'")))?;

        validate_arguments(&registered.schema, args)?;

        if registered.category != SchemaCategory::Template {
            let has_streams = streams.map(|s| !s.is_empty()).unwrap_or(false);
            if !has_streams {
                return Err(ReverieError::validation(format!(
                    "function '{name}' requires a non-empty stream set"
                )));
            }
        }

        let mut last_err = None;
        for attempt in 0..=self.retry_config.max_attempts {
            match registered.executor.execute(args, streams).await {
                Ok(value) => return Ok(value),
                Err(err) if err.recoverable() && attempt < self.retry_config.max_attempts => {
                    last_err = Some(err);
                    tokio::time::sleep(self.retry_config.calculate_delay(attempt)).await;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| ReverieError::validation("executor exhausted retries")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoExecutor;

    #[async_trait]
    impl FunctionExecutor for EchoExecutor {
        async fn execute(&self, args: &Value, _streams: Option<&[Stream]>) -> Result<Value> {
            Ok(args.clone())
        }
    }

    fn top_artists_schema() -> FunctionSchema {
        let mut parameters = HashMap::new();
        parameters.insert(
            "limit".to_string(),
            ParamSpec {
                param_type: ParamType::Integer,
                required: true,
                enum_values: None,
            },
        );
        FunctionSchema {
            name: "getTopArtists".to_string(),
            description: "top artists".to_string(),
            parameters,
        }
    }

    fn registry_with_top_artists() -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        registry.register(top_artists_schema(), SchemaCategory::Analytics, Arc::new(EchoExecutor));
        registry
    }

    fn one_stream() -> Vec<Stream> {
        vec![Stream {
            timestamp: chrono::Utc::now(),
            track_name: "T".to_string(),
            artist_name: Some("A".to_string()),
            album_name: None,
            ms_played: 1,
            completion_ratio: None,
            play_type: crate::model::PlayType::Full,
            source_platform: None,
            shuffle: false,
            skipped: false,
            offline: false,
            start_reason: None,
            end_reason: None,
        }]
    }

    #[tokio::test]
    async fn numeric_string_limit_is_coerced_and_accepted() {
        let registry = registry_with_top_artists();
        let streams = one_stream();
        let result = registry
            .execute("getTopArtists", &json!({ "limit": "5" }), Some(&streams))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn non_numeric_limit_is_rejected_naming_the_parameter() {
        let registry = registry_with_top_artists();
        let streams = one_stream();
        let err = registry
            .execute("getTopArtists", &json!({ "limit": "five" }), Some(&streams))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("limit"));
    }

    #[tokio::test]
    async fn missing_streams_for_analytics_function_is_an_error() {
        let registry = registry_with_top_artists();
        let err = registry
            .execute("getTopArtists", &json!({ "limit": 5 }), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ReverieError::Validation { .. }));
    }

    #[tokio::test]
    async fn unknown_function_name_is_rejected() {
        let registry = registry_with_top_artists();
        let err = registry.execute("doesNotExist", &json!({}), None).await.unwrap_err();
        assert!(matches!(err, ReverieError::Validation { .. }));
    }

    #[tokio::test]
    async fn unknown_parameters_are_tolerated() {
        let registry = registry_with_top_artists();
        let streams = one_stream();
        let result = registry
            .execute("getTopArtists", &json!({ "limit": 5, "extra": true }), Some(&streams))
            .await;
        assert!(result.is_ok());
    }

    #[test]
    fn get_enabled_schemas_respects_enablement_list() {
        let mut registry = registry_with_top_artists();
        let mut enabled = HashSet::new();
        enabled.insert("other".to_string());
        registry.set_enabled(Some(enabled));
        assert!(registry.get_enabled_schemas().is_empty());
    }
}
