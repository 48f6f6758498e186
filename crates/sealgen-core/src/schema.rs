//! Structural validation of emitted artifacts.
//!
//! Every structured artifact is checked against a JSON Schema (Draft 2020-12)
//! before it is accepted for publishing. The registry is an explicit object
//! handed to stages; callers may replace the embedded schemas with their own.

use crate::error::{CoreError, CoreResult};
use jsonschema::Draft;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Artifact kinds with a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArtifactKind {
    GateReceipt,
    SealedInputs,
    AliasIndex,
    RngEvent,
    RngTrace,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 5] = [
        ArtifactKind::GateReceipt,
        ArtifactKind::SealedInputs,
        ArtifactKind::AliasIndex,
        ArtifactKind::RngEvent,
        ArtifactKind::RngTrace,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::GateReceipt => "gate_receipt",
            Self::SealedInputs => "sealed_inputs",
            Self::AliasIndex => "alias_index",
            Self::RngEvent => "rng_event",
            Self::RngTrace => "rng_trace",
        }
    }

    fn embedded_schema(self) -> &'static str {
        match self {
            Self::GateReceipt => GATE_RECEIPT_SCHEMA_JSON,
            Self::SealedInputs => SEALED_INPUTS_SCHEMA_JSON,
            Self::AliasIndex => ALIAS_INDEX_SCHEMA_JSON,
            Self::RngEvent => RNG_EVENT_SCHEMA_JSON,
            Self::RngTrace => RNG_TRACE_SCHEMA_JSON,
        }
    }
}

const GATE_RECEIPT_SCHEMA_JSON: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../../schemas/gate_receipt.schema.json"
));
const SEALED_INPUTS_SCHEMA_JSON: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../../schemas/sealed_inputs.schema.json"
));
const ALIAS_INDEX_SCHEMA_JSON: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../../schemas/alias_index.schema.json"
));
const RNG_EVENT_SCHEMA_JSON: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../../schemas/rng_event.schema.json"
));
const RNG_TRACE_SCHEMA_JSON: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../../schemas/rng_trace.schema.json"
));

/// Compiled validators keyed by artifact kind.
pub struct SchemaRegistry {
    validators: BTreeMap<ArtifactKind, jsonschema::Validator>,
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("kinds", &self.validators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SchemaRegistry {
    /// Registry with the schemas shipped in `schemas/`.
    pub fn builtin() -> CoreResult<Self> {
        let mut validators = BTreeMap::new();
        for kind in ArtifactKind::ALL {
            let schema: Value = serde_json::from_str(kind.embedded_schema()).map_err(|e| {
                CoreError::config(format!(
                    "embedded {} schema is not valid JSON: {}",
                    kind.name(),
                    e
                ))
            })?;
            validators.insert(kind, compile(kind, &schema)?);
        }
        Ok(Self { validators })
    }

    /// Replace the schema for one kind with an externally supplied one.
    pub fn with_schema(mut self, kind: ArtifactKind, schema: &Value) -> CoreResult<Self> {
        self.validators.insert(kind, compile(kind, schema)?);
        Ok(self)
    }

    /// Validate a JSON value. Fails with `E_SCHEMA` carrying the first violation.
    pub fn validate_value(&self, kind: ArtifactKind, instance: &Value) -> CoreResult<()> {
        let validator = self.validators.get(&kind).ok_or_else(|| {
            CoreError::config(format!("no schema registered for {}", kind.name()))
        })?;
        if let Some(first) = validator.iter_errors(instance).next() {
            return Err(CoreError::schema(format!(
                "{} failed schema validation: {}",
                kind.name(),
                first
            ))
            .with_subject(kind.name()));
        }
        Ok(())
    }

    /// Validate any serializable artifact.
    pub fn validate<T: Serialize>(&self, kind: ArtifactKind, artifact: &T) -> CoreResult<()> {
        let value = serde_json::to_value(artifact)?;
        self.validate_value(kind, &value)
    }
}

fn compile(kind: ArtifactKind, schema: &Value) -> CoreResult<jsonschema::Validator> {
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .map_err(|e| CoreError::config(format!("failed to compile {} schema: {}", kind.name(), e)))
}
