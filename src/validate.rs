use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::error;

use crate::error::UploadError;

const SARIF_SCHEMA: &str = include_str!("assets/sarif-2.1.0.json");

/// One schema violation found in a SARIF document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Violation {
    /// JSON pointer into the document, `/` for the root.
    pub(crate) instance_path: String,
    /// JSON pointer to the violated keyword in the schema.
    pub(crate) schema_path: String,
    pub(crate) message: String,
}

/// Checks a JSON document against a JSON Schema.
pub(crate) trait SchemaValidator {
    /// Returns every violation, or an empty list for a conforming document.
    fn violations(&self, document: &Value) -> Vec<Violation>;
}

/// `SchemaValidator` backed by a compiled `jsonschema` validator.
pub(crate) struct JsonSchemaValidator {
    compiled: jsonschema::Validator,
}

impl JsonSchemaValidator {
    /// Validator for the OASIS SARIF 2.1.0 schema shipped with the binary.
    pub(crate) fn sarif_2_1_0() -> Result<Self> {
        let schema = serde_json::from_str(SARIF_SCHEMA).context("load SARIF schema")?;
        Self::from_schema(&schema)
    }

    /// Validator for a schema document on disk, e.g. the full OASIS schema.
    pub(crate) fn from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read SARIF schema {}", path.display()))?;
        let schema = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse SARIF schema {}", path.display()))?;
        Self::from_schema(&schema)
    }

    pub(crate) fn from_schema(schema: &Value) -> Result<Self> {
        let compiled = jsonschema::validator_for(schema)
            .map_err(|err| anyhow::anyhow!("compile SARIF schema: {err}"))?;
        Ok(Self { compiled })
    }
}

impl SchemaValidator for JsonSchemaValidator {
    fn violations(&self, document: &Value) -> Vec<Violation> {
        self.compiled
            .iter_errors(document)
            .map(|error| Violation {
                instance_path: pointer_or_root(error.instance_path().to_string()),
                schema_path: pointer_or_root(error.schema_path().to_string()),
                message: error.to_string(),
            })
            .collect()
    }
}

fn pointer_or_root(pointer: String) -> String {
    if pointer.is_empty() {
        return "/".to_string();
    }
    pointer
}

/// Validates one parsed SARIF file.
///
/// All violations are logged individually and returned together in a single
/// `UploadError::SchemaViolation`.
pub(crate) fn validate(
    validator: &dyn SchemaValidator,
    path: &Path,
    document: &Value,
) -> Result<()> {
    let violations = validator.violations(document);
    if violations.is_empty() {
        return Ok(());
    }
    for violation in &violations {
        error!(
            file = %path.display(),
            instance_path = %violation.instance_path,
            schema_path = %violation.schema_path,
            "{}",
            violation.message
        );
    }
    Err(UploadError::SchemaViolation {
        path: path.to_path_buf(),
        violations,
    }
    .into())
}
