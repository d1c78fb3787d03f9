//! Restricted JSON Schema draft-07 subset compile/validate, with
//! prototype-pollution key guards per `SPEC_FULL.md` §4.2 stage 5.
//!
//! Every tool's `arguments_schema` is compiled once and cached per tool
//! name (`SchemaCache`); validation walks the prototype-pollution guard
//! before the schema check so a hostile `__proto__`/`constructor`/
//! `prototype` key is rejected even if it would otherwise satisfy the
//! schema (`additionalProperties: false` alone would not catch a key that
//! happens to match a declared property name).

use std::sync::Arc;

use dashmap::DashMap;
use jsonschema::JSONSchema;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
    #[error("{path}: {message}")]
    ValidationFailed { path: String, message: String },
    #[error("{path}: key '{key}' is not permitted")]
    ProtoPollution { path: String, key: String },
}

const POLLUTION_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

/// Reject documents containing `__proto__`/`constructor`/`prototype` keys
/// at any depth. Harmless in Rust's own object model, but still required:
/// downstream tooling may deserialize the result into a hostile shape.
pub fn check_prototype_pollution(value: &serde_json::Value, path: &str) -> Result<(), SchemaError> {
    match value {
        serde_json::Value::Object(map) => {
            for (key, v) in map {
                if POLLUTION_KEYS.contains(&key.as_str()) {
                    return Err(SchemaError::ProtoPollution {
                        path: format!("{path}.{key}"),
                        key: key.clone(),
                    });
                }
                check_prototype_pollution(v, &format!("{path}.{key}"))?;
            }
            Ok(())
        }
        serde_json::Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                check_prototype_pollution(v, &format!("{path}[{i}]"))?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

pub struct CompiledSchema {
    compiled: JSONSchema,
}

impl CompiledSchema {
    pub fn compile(schema: &serde_json::Value) -> Result<Self, SchemaError> {
        let compiled = JSONSchema::options()
            .with_draft(jsonschema::Draft::Draft7)
            .compile(schema)
            .map_err(|e| SchemaError::InvalidSchema(e.to_string()))?;
        Ok(Self { compiled })
    }

    /// Validate an instance. Prototype-pollution guard runs first; schema
    /// validation reports the JSON path of the first failure only, per
    /// `SPEC_FULL.md` §4.2 stage 5.
    pub fn validate(&self, instance: &serde_json::Value) -> Result<(), SchemaError> {
        check_prototype_pollution(instance, "$")?;

        if let Err(mut errors) = self.compiled.validate(instance) {
            if let Some(first) = errors.next() {
                return Err(SchemaError::ValidationFailed {
                    path: first.instance_path.to_string(),
                    message: first.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Per-tool compile cache: schemas compile on first use and are reused for
/// every subsequent invocation of that tool.
pub struct SchemaCache {
    compiled: DashMap<String, Arc<CompiledSchema>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self { compiled: DashMap::new() }
    }

    pub fn get_or_compile(&self, tool_name: &str, schema: &serde_json::Value) -> Result<Arc<CompiledSchema>, SchemaError> {
        if let Some(existing) = self.compiled.get(tool_name) {
            return Ok(existing.clone());
        }
        let compiled = Arc::new(CompiledSchema::compile(schema)?);
        self.compiled.insert(tool_name.to_string(), compiled.clone());
        Ok(compiled)
    }

    pub fn invalidate(&self, tool_name: &str) {
        self.compiled.remove(tool_name);
    }
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"],
            "additionalProperties": false,
        })
    }

    #[test]
    fn valid_instance_passes() {
        let schema = CompiledSchema::compile(&echo_schema()).unwrap();
        assert!(schema.validate(&json!({"text": "hi"})).is_ok());
    }

    #[test]
    fn additional_properties_rejected() {
        let schema = CompiledSchema::compile(&echo_schema()).unwrap();
        let err = schema.validate(&json!({"text": "hi", "extra": 1})).unwrap_err();
        assert!(matches!(err, SchemaError::ValidationFailed { .. }));
    }

    #[test]
    fn proto_pollution_key_rejected_even_if_schema_allows_it() {
        let permissive = json!({"type": "object"});
        let schema = CompiledSchema::compile(&permissive).unwrap();
        let err = schema.validate(&json!({"__proto__": {"polluted": true}})).unwrap_err();
        match err {
            SchemaError::ProtoPollution { key, .. } => assert_eq!(key, "__proto__"),
            other => panic!("expected ProtoPollution, got {other:?}"),
        }
    }

    #[test]
    fn proto_pollution_checked_at_any_depth() {
        let permissive = json!({"type": "object"});
        let schema = CompiledSchema::compile(&permissive).unwrap();
        let err = schema
            .validate(&json!({"a": {"b": {"constructor": "x"}}}))
            .unwrap_err();
        assert!(matches!(err, SchemaError::ProtoPollution { .. }));
    }

    #[test]
    fn cache_compiles_once_per_tool() {
        let cache = SchemaCache::new();
        let a = cache.get_or_compile("echo", &echo_schema()).unwrap();
        let b = cache.get_or_compile("echo", &echo_schema()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
