//! Schema registry: the catalogue of step implementations.
//!
//! A schema describes a step implementation's configurable field table and
//! its input/output connection templates. The registry trait is the seam
//! between resolution and wherever schemas live; tests and embedders use
//! [`MemoryRegistry`], the CLI loads a [`FileRegistry`] from YAML.

use std::collections::BTreeMap;
use std::path::Path;

use quiver_types::{QuiverError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Scalar shape a configuration field accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Bool,
    Int,
    Float,
    Str,
    List,
    Map,
}

impl FieldType {
    pub fn name(self) -> &'static str {
        match self {
            FieldType::Bool => "bool",
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Str => "str",
            FieldType::List => "list",
            FieldType::Map => "map",
        }
    }

    /// Whether a value is acceptable for this field. `null` always is; it
    /// means the field is unset. Integers are acceptable floats.
    pub fn admits(self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (FieldType::Bool, Value::Bool(_)) => true,
            (FieldType::Int, Value::Number(n)) => n.as_i64().is_some(),
            (FieldType::Float, Value::Number(_)) => true,
            (FieldType::Str, Value::String(_)) => true,
            (FieldType::List, Value::Array(_)) => true,
            (FieldType::Map, Value::Object(_)) => true,
            _ => false,
        }
    }
}

/// One entry of a step's field table, keyed by dotted path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub default: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
}

/// A declared input or output of a step implementation.
///
/// `name_template` may contain `{field}` placeholders resolved against the
/// step's resolved configuration, so one implementation can be wired into
/// different data-product names per label. `external` marks an input that is
/// provided from outside the pipeline and needs no producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTemplate {
    pub name_template: String,
    #[serde(default)]
    pub dimensions: Vec<String>,
    #[serde(default)]
    pub external: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepSchema {
    /// Dotted field path -> field spec.
    #[serde(default)]
    pub fields: BTreeMap<String, FieldSpec>,
    #[serde(default)]
    pub inputs: Vec<ConnectionTemplate>,
    #[serde(default)]
    pub outputs: Vec<ConnectionTemplate>,
}

/// Lookup seam from implementation reference to schema.
pub trait SchemaRegistry {
    fn schema_for(&self, class: &str) -> Result<&StepSchema>;
}

/// In-memory registry, also the backing store for [`FileRegistry`].
#[derive(Debug, Clone, Default)]
pub struct MemoryRegistry {
    schemas: BTreeMap<String, StepSchema>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, class: impl Into<String>, schema: StepSchema) {
        self.schemas.insert(class.into(), schema);
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

impl SchemaRegistry for MemoryRegistry {
    fn schema_for(&self, class: &str) -> Result<&StepSchema> {
        self.schemas
            .get(class)
            .ok_or_else(|| QuiverError::UnknownImplementation {
                reference: class.to_string(),
            })
    }
}

/// Registry loaded from a YAML file mapping implementation reference to
/// schema.
#[derive(Debug, Clone)]
pub struct FileRegistry {
    inner: MemoryRegistry,
}

impl FileRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        let schemas: BTreeMap<String, StepSchema> = serde_yaml::from_str(&source)?;
        debug!(
            path = %path.display(),
            classes = schemas.len(),
            "loaded schema registry"
        );
        Ok(Self {
            inner: MemoryRegistry { schemas },
        })
    }
}

impl SchemaRegistry for FileRegistry {
    fn schema_for(&self, class: &str) -> Result<&StepSchema> {
        self.inner.schema_for(class)
    }
}
