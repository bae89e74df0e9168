//! Per-step configuration resolution.
//!
//! For each step the resolver starts from schema defaults, applies literal
//! and file override sources in document order, then runs expression blocks
//! last with the config bound as a mutable `config` scope. Every override is
//! checked against the schema field table, from whichever source it came.

use std::collections::{BTreeMap, HashMap};
use std::env;

use quiver_expr::{run_block, Env, EvalLimits};
use quiver_spec::{OverrideSource, StepDecl};
use quiver_types::{QuiverError, Result};
use serde_json::Value;
use tracing::debug;

use crate::registry::{ConnectionTemplate, SchemaRegistry, StepSchema};

/// A concrete data-product endpoint of a resolved step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataProductType {
    pub name: String,
    pub dimensions: Vec<String>,
    /// Provided from outside the pipeline; needs no producing step.
    pub external: bool,
}

/// A step with its configuration fully applied and connection templates
/// expanded into concrete data-product names.
#[derive(Debug, Clone)]
pub struct ResolvedStep {
    pub label: String,
    pub class: String,
    pub config: Value,
    pub inputs: Vec<DataProductType>,
    pub outputs: Vec<DataProductType>,
}

/// Resolves step configurations. Holds the per-run override-file cache, so
/// one instance serves a whole resolution pass.
pub struct ConfigResolver<'a> {
    registry: &'a dyn SchemaRegistry,
    limits: EvalLimits,
    /// Expanded file path -> parsed overrides, read once per run.
    file_cache: HashMap<String, Vec<(String, Value)>>,
}

impl<'a> ConfigResolver<'a> {
    pub fn new(registry: &'a dyn SchemaRegistry, limits: EvalLimits) -> Self {
        Self {
            registry,
            limits,
            file_cache: HashMap::new(),
        }
    }

    pub fn resolve_step(&mut self, step: &StepDecl) -> Result<ResolvedStep> {
        let schema = self.registry.schema_for(&step.class)?;
        let mut config = defaults(schema);

        // Literal and file sources in document order; blocks run last.
        for source in &step.overrides {
            match source {
                OverrideSource::Value { path, value } => {
                    apply_override(&mut config, schema, &step.label, path, value.clone())?;
                }
                OverrideSource::File(path) => {
                    let overrides = self.load_file(path)?;
                    for (path, value) in overrides {
                        apply_override(&mut config, schema, &step.label, &path, value)?;
                    }
                }
                OverrideSource::Block(_) => {}
            }
        }
        for source in &step.overrides {
            if let OverrideSource::Block(text) = source {
                run_config_block(text, &mut config, schema, &step.label, &self.limits)?;
            }
        }
        typecheck(&config, schema, &step.label)?;

        let inputs = expand_templates(&schema.inputs, &config, &step.label)?;
        let outputs = expand_templates(&schema.outputs, &config, &step.label)?;
        debug!(step = %step.label, class = %step.class, "resolved step configuration");

        Ok(ResolvedStep {
            label: step.label.clone(),
            class: step.class.clone(),
            config,
            inputs,
            outputs,
        })
    }

    /// Load an override file, expanding env-var placeholders in the path.
    /// Files are YAML mappings of dotted field path to value, applied in
    /// file order.
    fn load_file(&mut self, path: &str) -> Result<Vec<(String, Value)>> {
        let expanded = expand_env_vars(path);
        if let Some(cached) = self.file_cache.get(&expanded) {
            return Ok(cached.clone());
        }
        let source = std::fs::read_to_string(&expanded)?;
        let yaml: serde_yaml::Value = serde_yaml::from_str(&source)?;
        let serde_yaml::Value::Mapping(map) = yaml else {
            return Err(QuiverError::Spec {
                location: expanded,
                message: "override file must be a mapping of field path to value".to_string(),
            });
        };
        let mut overrides = Vec::with_capacity(map.len());
        for (key, value) in &map {
            let key = key.as_str().ok_or_else(|| QuiverError::Spec {
                location: expanded.clone(),
                message: "override file keys must be dotted field paths".to_string(),
            })?;
            overrides.push((
                key.to_string(),
                quiver_spec::yaml_to_json(value, &expanded)?,
            ));
        }
        debug!(path = %expanded, entries = overrides.len(), "loaded override file");
        self.file_cache.insert(expanded, overrides.clone());
        Ok(overrides)
    }
}

// ---------------------------------------------------------------------------
// Field table application
// ---------------------------------------------------------------------------

/// Build the default config object from the schema field table.
fn defaults(schema: &StepSchema) -> Value {
    let mut config = Value::Object(serde_json::Map::new());
    for (path, field) in &schema.fields {
        set_dotted(&mut config, path, field.default.clone());
    }
    config
}

/// A path is addressable when it names a field exactly, or a whole subtree
/// of fields (a proper prefix of at least one field path).
fn path_is_known(schema: &StepSchema, path: &str) -> bool {
    schema.fields.contains_key(path)
        || schema
            .fields
            .keys()
            .any(|field| field.len() > path.len() && field.starts_with(path) && field.as_bytes()[path.len()] == b'.')
}

fn apply_override(
    config: &mut Value,
    schema: &StepSchema,
    step: &str,
    path: &str,
    value: Value,
) -> Result<()> {
    if !path_is_known(schema, path) {
        return Err(QuiverError::UnknownConfigField {
            step: step.to_string(),
            path: path.to_string(),
        });
    }
    if let Some(field) = schema.fields.get(path) {
        if !field.field_type.admits(&value) {
            return Err(QuiverError::ConfigType {
                step: step.to_string(),
                path: path.to_string(),
                expected: field.field_type.name().to_string(),
                actual: json_type_name(&value).to_string(),
            });
        }
    }
    set_dotted(config, path, value);
    Ok(())
}

fn run_config_block(
    text: &str,
    config: &mut Value,
    schema: &StepSchema,
    step: &str,
    limits: &EvalLimits,
) -> Result<()> {
    let env = Env::new();
    run_block(text, "config", config, &env, limits, &|target| {
        let path = target.field_prefix();
        if path.is_empty() || !path_is_known(schema, &path) {
            return Err(QuiverError::UnknownConfigField {
                step: step.to_string(),
                path,
            });
        }
        Ok(())
    })
}

/// Verify every schema field's final value against its declared type.
/// Blocks assign through arbitrary paths, so mismatches are caught here
/// rather than at assignment time.
fn typecheck(config: &Value, schema: &StepSchema, step: &str) -> Result<()> {
    for (path, field) in &schema.fields {
        if let Some(value) = get_dotted(config, path) {
            if !field.field_type.admits(value) {
                return Err(QuiverError::ConfigType {
                    step: step.to_string(),
                    path: path.clone(),
                    expected: field.field_type.name().to_string(),
                    actual: json_type_name(value).to_string(),
                });
            }
        }
    }
    Ok(())
}

pub(crate) fn set_dotted(config: &mut Value, path: &str, value: Value) {
    if !config.is_object() {
        *config = Value::Object(serde_json::Map::new());
    }
    let Value::Object(map) = config else {
        return;
    };
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let slot = map.entry(head.to_string()).or_insert(Value::Null);
            set_dotted(slot, rest, value);
        }
    }
}

pub(crate) fn get_dotted<'v>(config: &'v Value, path: &str) -> Option<&'v Value> {
    let mut slot = config;
    for part in path.split('.') {
        slot = slot.as_object()?.get(part)?;
    }
    Some(slot)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.as_i64().is_some() => "int",
        Value::Number(_) => "float",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

// ---------------------------------------------------------------------------
// Env-var and template expansion
// ---------------------------------------------------------------------------

/// Expand `$VAR` and `${VAR}` in a path. Unset variables are left as
/// written.
pub fn expand_env_vars(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = String::with_capacity(path.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            // Copy the span up to the next `$` whole; `$` is ASCII, so the
            // slice boundaries always fall on char boundaries.
            let next = bytes[i..]
                .iter()
                .position(|&b| b == b'$')
                .map_or(bytes.len(), |off| i + off);
            out.push_str(&path[i..next]);
            i = next;
            continue;
        }
        let (name, end) = if bytes.get(i + 1) == Some(&b'{') {
            match path[i + 2..].find('}') {
                Some(close) => (&path[i + 2..i + 2 + close], i + 2 + close + 1),
                None => {
                    out.push('$');
                    i += 1;
                    continue;
                }
            }
        } else {
            let mut j = i + 1;
            while j < bytes.len()
                && ((bytes[j] as char).is_ascii_alphanumeric() || bytes[j] == b'_')
            {
                j += 1;
            }
            (&path[i + 1..j], j)
        };
        if name.is_empty() {
            out.push('$');
            i += 1;
            continue;
        }
        match env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => out.push_str(&path[i..end]),
        }
        i = end;
    }
    out
}

/// Expand `{field}` placeholders in connection templates against the
/// resolved config. Placeholders must name a resolved scalar field.
fn expand_templates(
    templates: &[ConnectionTemplate],
    config: &Value,
    step: &str,
) -> Result<Vec<DataProductType>> {
    templates
        .iter()
        .map(|template| {
            Ok(DataProductType {
                name: expand_name(&template.name_template, config, step)?,
                dimensions: template.dimensions.clone(),
                external: template.external,
            })
        })
        .collect()
}

fn expand_name(template: &str, config: &Value, step: &str) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return Ok(out);
        };
        let path = &after[..close];
        let value = get_dotted(config, path).ok_or_else(|| QuiverError::UnknownConfigField {
            step: step.to_string(),
            path: path.to_string(),
        })?;
        match value {
            Value::String(s) => out.push_str(s),
            Value::Number(_) | Value::Bool(_) => out.push_str(&value.to_string()),
            _ => {
                return Err(QuiverError::UnknownConfigField {
                    step: step.to_string(),
                    path: path.to_string(),
                });
            }
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Map of labels to resolved configs
// ---------------------------------------------------------------------------

/// Contract evaluation binds each step label to its config namespace.
pub fn config_env(resolved: &[ResolvedStep]) -> BTreeMap<String, Value> {
    resolved
        .iter()
        .map(|step| (step.label.clone(), step.config.clone()))
        .collect()
}
