//! Parameter substitution over a merged document.
//!
//! Override values and expression-block text may reference entries of the
//! document's `parameters` table through the reserved `parameters.<name>`
//! prefix. A string that is exactly one reference is replaced structurally
//! (the parameter's value, whatever its type); a reference embedded in a
//! longer string is replaced textually. Parameters may reference each other;
//! chains are resolved eagerly and cycles rejected.

use std::collections::BTreeMap;

use quiver_types::{QuiverError, Result};
use serde_json::Value;
use tracing::debug;

use crate::model::{OverrideSource, PipelineSpec};

/// Reserved prefix marking a parameter reference.
pub const PARAMETER_PREFIX: &str = "parameters.";

/// How a substituted value is rendered when spliced into surrounding text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Render {
    /// Plain text: strings splice in bare, everything else as JSON.
    Text,
    /// Expression source: everything renders as a JSON literal, which is
    /// also a valid literal in the embedded expression grammar.
    Source,
}

/// Replace every parameter reference in the document's override chain.
/// The `parameters` table itself is left as written.
pub fn substitute_parameters(spec: &mut PipelineSpec) -> Result<()> {
    let table = resolve_table(&spec.parameters)?;
    for step in spec.steps_mut() {
        let used_in = format!("step '{}'", step.label);
        for source in &mut step.overrides {
            match source {
                OverrideSource::Value { value, .. } => {
                    *value = substitute_value(value, &table, &used_in)?;
                }
                OverrideSource::Block(text) => {
                    *text = substitute_text(text, &table, &used_in, Render::Source)?;
                }
                // File paths are opaque here; env expansion happens at load.
                OverrideSource::File(_) => {}
            }
        }
    }
    if !table.is_empty() {
        debug!(parameters = table.len(), "applied parameter substitution");
    }
    Ok(())
}

/// Resolve inter-parameter references in the table, detecting cycles.
fn resolve_table(raw: &BTreeMap<String, Value>) -> Result<BTreeMap<String, Value>> {
    let mut memo = BTreeMap::new();
    let mut active = Vec::new();
    for name in raw.keys() {
        resolve_entry(name, raw, &mut memo, &mut active)?;
    }
    Ok(memo)
}

fn resolve_entry(
    name: &str,
    raw: &BTreeMap<String, Value>,
    memo: &mut BTreeMap<String, Value>,
    active: &mut Vec<String>,
) -> Result<Value> {
    if let Some(done) = memo.get(name) {
        return Ok(done.clone());
    }
    if active.iter().any(|n| n == name) {
        let mut chain = active.clone();
        chain.push(name.to_string());
        return Err(QuiverError::ParameterCycle { chain });
    }
    let value = raw.get(name).cloned().ok_or_else(|| {
        let used_in = match active.last() {
            Some(referrer) => format!("parameter '{referrer}'"),
            None => "parameters".to_string(),
        };
        QuiverError::UndefinedParameter {
            name: name.to_string(),
            used_in,
        }
    })?;
    active.push(name.to_string());
    let resolved = resolve_value(&value, raw, memo, active)?;
    active.pop();
    memo.insert(name.to_string(), resolved.clone());
    Ok(resolved)
}

fn resolve_value(
    value: &Value,
    raw: &BTreeMap<String, Value>,
    memo: &mut BTreeMap<String, Value>,
    active: &mut Vec<String>,
) -> Result<Value> {
    match value {
        Value::String(text) => {
            subst_string(text, Render::Text, &mut |name| {
                resolve_entry(name, raw, memo, active)
            })
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| resolve_value(item, raw, memo, active))
                .collect::<Result<_>>()?,
        )),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, item) in map {
                out.insert(key.clone(), resolve_value(item, raw, memo, active)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Substitute references inside a literal override value, recursively.
fn substitute_value(
    value: &Value,
    table: &BTreeMap<String, Value>,
    used_in: &str,
) -> Result<Value> {
    match value {
        Value::String(text) => subst_string(text, Render::Text, &mut |name| {
            lookup(table, name, used_in)
        }),
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| substitute_value(item, table, used_in))
                .collect::<Result<_>>()?,
        )),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, item) in map {
                out.insert(key.clone(), substitute_value(item, table, used_in)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn substitute_text(
    text: &str,
    table: &BTreeMap<String, Value>,
    used_in: &str,
    render: Render,
) -> Result<String> {
    let out = subst_string(text, render, &mut |name| lookup(table, name, used_in))?;
    match out {
        Value::String(s) => Ok(s),
        // A block that is exactly one reference still renders as source text.
        other => Ok(other.to_string()),
    }
}

fn lookup(table: &BTreeMap<String, Value>, name: &str, used_in: &str) -> Result<Value> {
    table.get(name).cloned().ok_or_else(|| QuiverError::UndefinedParameter {
        name: name.to_string(),
        used_in: used_in.to_string(),
    })
}

/// Replace references in one string. A string that is exactly one reference
/// returns the looked-up value unchanged; otherwise each reference is
/// rendered into the surrounding text.
fn subst_string(
    text: &str,
    render: Render,
    lookup: &mut dyn FnMut(&str) -> Result<Value>,
) -> Result<Value> {
    let refs = find_references(text, render == Render::Source);
    if refs.is_empty() {
        return Ok(Value::String(text.to_string()));
    }
    if let [(start, end, name)] = refs.as_slice() {
        if text.trim() == &text[*start..*end] {
            return lookup(name);
        }
    }
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for (start, end, name) in &refs {
        out.push_str(&text[cursor..*start]);
        let value = lookup(name)?;
        match (render, &value) {
            (Render::Text, Value::String(s)) => out.push_str(s),
            _ => out.push_str(&value.to_string()),
        }
        cursor = *end;
    }
    out.push_str(&text[cursor..]);
    Ok(Value::String(out))
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Scan for `parameters.<name>` tokens. In source mode, quoted strings and
/// comments are left untouched.
fn find_references(text: &str, source_mode: bool) -> Vec<(usize, usize, String)> {
    let bytes = text.as_bytes();
    let mut refs = Vec::new();
    let mut i = 0;
    let mut prev: Option<char> = None;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if source_mode && (c == '"' || c == '\'') {
            let quote = bytes[i];
            i += 1;
            while i < bytes.len() && bytes[i] != quote {
                if bytes[i] == b'\\' {
                    i += 1;
                }
                i += 1;
            }
            i += 1;
            prev = Some(quote as char);
            continue;
        }
        if source_mode && c == '#' {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            prev = Some('\n');
            continue;
        }
        let boundary = !matches!(prev, Some(p) if is_ident_char(p) || p == '.');
        if boundary && text[i..].starts_with(PARAMETER_PREFIX) {
            let name_start = i + PARAMETER_PREFIX.len();
            let mut j = name_start;
            while j < bytes.len() && is_ident_char(bytes[j] as char) {
                j += 1;
            }
            let name = &text[name_start..j];
            if !name.is_empty() && !name.starts_with(|c: char| c.is_ascii_digit()) {
                refs.push((i, j, name.to_string()));
                prev = bytes.get(j.wrapping_sub(1)).map(|&b| b as char);
                i = j;
                continue;
            }
        }
        prev = Some(c);
        i += 1;
    }
    refs
}
