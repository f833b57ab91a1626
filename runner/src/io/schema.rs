//! JSON Schema checks for documents crossing the process boundary.

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde_json::Value;

pub const ALGORITHM_SPEC_SCHEMA: &str = include_str!("../../schemas/algorithm_spec.schema.json");
pub const GENERATED_PROJECT_SCHEMA: &str =
    include_str!("../../schemas/generated_project.schema.json");
pub const REPAIR_PATCH_SCHEMA: &str = include_str!("../../schemas/repair_patch.schema.json");

/// Validate `instance` against `schema`, returning every violation message.
///
/// An empty vector means the instance conforms. Errors are reserved for an
/// unusable schema.
pub fn schema_violations(schema: &str, instance: &Value) -> Result<Vec<String>> {
    let schema_value: Value = serde_json::from_str(schema).context("parse schema")?;
    let compiled =
        validator_for(&schema_value).map_err(|err| anyhow!("invalid schema: {}", err))?;
    Ok(compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn embedded_schemas_compile() {
        for schema in [
            ALGORITHM_SPEC_SCHEMA,
            GENERATED_PROJECT_SCHEMA,
            REPAIR_PATCH_SCHEMA,
        ] {
            schema_violations(schema, &json!({})).expect("schema compiles");
        }
    }

    #[test]
    fn reports_patch_violations() {
        let instance = json!({
            "revision": 0,
            "changes": [{ "path": "main.py" }],
            "confidence": 2.0
        });
        let violations = schema_violations(REPAIR_PATCH_SCHEMA, &instance).expect("validate");
        assert_eq!(violations.len(), 2, "{violations:?}");
        assert!(violations.iter().any(|v| v.contains("\"content\"")));
        assert!(violations.iter().any(|v| v.contains("maximum")));
    }

    #[test]
    fn accepts_minimal_spec() {
        let violations =
            schema_violations(ALGORITHM_SPEC_SCHEMA, &json!({ "name": "kmeans" })).expect("validate");
        assert!(violations.is_empty());
    }
}
