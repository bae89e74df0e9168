//! Parser for the YAML specification-document surface.
//!
//! Top-level keys: `description` (required), `tasks` (required), `parameters`,
//! `contracts`, `subsets`, `imports`. The YAML is walked by hand rather than
//! derived so that flexible forms (a step as a bare class string or a
//! `{class, config}` block, a subset as a label list or a block) parse with
//! errors that name the offending entry.

use quiver_types::{Provenance, QuiverError, Result};
use serde_json::Value as Json;
use serde_yaml::Value as Yaml;

use crate::model::{Contract, Import, OverrideSource, PipelineSpec, StepDecl, Subset};

/// Reserved key introducing a file reference inside a step's `config` block.
pub const CONFIG_FILE_KEY: &str = "file";
/// Reserved key introducing an embedded expression block.
pub const CONFIG_BLOCK_KEY: &str = "block";

fn spec_err(location: &str, message: impl Into<String>) -> QuiverError {
    QuiverError::Spec {
        location: location.to_string(),
        message: message.into(),
    }
}

/// Parse one specification document. `name` identifies the document in
/// provenance and error messages (usually its path).
pub fn parse_document(source: &str, name: &str) -> Result<PipelineSpec> {
    let root: Yaml = serde_yaml::from_str(source)?;
    let Yaml::Mapping(root) = root else {
        return Err(spec_err(name, "document root must be a mapping"));
    };

    let mut spec = PipelineSpec::default();
    let mut saw_description = false;
    let mut saw_tasks = false;

    for (key, value) in &root {
        let key = key
            .as_str()
            .ok_or_else(|| spec_err(name, "top-level keys must be strings"))?;
        match key {
            "description" => {
                spec.description = value
                    .as_str()
                    .ok_or_else(|| spec_err(name, "'description' must be a string"))?
                    .to_string();
                saw_description = true;
            }
            "tasks" => {
                parse_tasks(value, name, &mut spec)?;
                saw_tasks = true;
            }
            "parameters" => parse_parameters(value, name, &mut spec)?,
            "contracts" => parse_contracts(value, name, &mut spec)?,
            "subsets" => parse_subsets(value, name, &mut spec)?,
            "imports" => parse_imports(value, name, &mut spec)?,
            other => {
                return Err(spec_err(name, format!("unknown top-level key '{other}'")));
            }
        }
    }

    if !saw_description {
        return Err(spec_err(name, "missing required key 'description'"));
    }
    if !saw_tasks && spec.imports.is_empty() {
        return Err(spec_err(name, "missing required key 'tasks'"));
    }
    Ok(spec)
}

fn parse_tasks(value: &Yaml, name: &str, spec: &mut PipelineSpec) -> Result<()> {
    let Yaml::Mapping(tasks) = value else {
        return Err(spec_err(name, "'tasks' must be a mapping of label to step"));
    };
    for (label, step) in tasks {
        let label = label
            .as_str()
            .ok_or_else(|| spec_err(name, "step labels must be strings"))?;
        let decl = parse_step(label, step, name)?;
        spec.add_step(decl)?;
    }
    Ok(())
}

fn parse_step(label: &str, value: &Yaml, name: &str) -> Result<StepDecl> {
    let location = format!("{name}: step '{label}'");
    match value {
        Yaml::String(class) => Ok(StepDecl {
            label: label.to_string(),
            class: class.clone(),
            overrides: Vec::new(),
            provenance: Provenance::new(name),
        }),
        Yaml::Mapping(map) => {
            let mut class = None;
            let mut overrides = Vec::new();
            for (key, entry) in map {
                let key = key
                    .as_str()
                    .ok_or_else(|| spec_err(&location, "step keys must be strings"))?;
                match key {
                    "class" => {
                        class = Some(
                            entry
                                .as_str()
                                .ok_or_else(|| spec_err(&location, "'class' must be a string"))?
                                .to_string(),
                        );
                    }
                    "config" => parse_config(entry, &location, &mut overrides)?,
                    other => {
                        return Err(spec_err(&location, format!("unknown step key '{other}'")));
                    }
                }
            }
            let class =
                class.ok_or_else(|| spec_err(&location, "step block requires a 'class' key"))?;
            Ok(StepDecl {
                label: label.to_string(),
                class,
                overrides,
                provenance: Provenance::new(name),
            })
        }
        _ => Err(spec_err(
            &location,
            "step must be a class string or a {class, config} block",
        )),
    }
}

/// A `config` entry is a mapping, or a list of mappings applied in order.
fn parse_config(value: &Yaml, location: &str, out: &mut Vec<OverrideSource>) -> Result<()> {
    match value {
        Yaml::Mapping(map) => parse_config_mapping(map, location, out),
        Yaml::Sequence(items) => {
            for item in items {
                let Yaml::Mapping(map) = item else {
                    return Err(spec_err(location, "'config' list entries must be mappings"));
                };
                parse_config_mapping(map, location, out)?;
            }
            Ok(())
        }
        _ => Err(spec_err(
            location,
            "'config' must be a mapping or a list of mappings",
        )),
    }
}

fn parse_config_mapping(
    map: &serde_yaml::Mapping,
    location: &str,
    out: &mut Vec<OverrideSource>,
) -> Result<()> {
    for (key, value) in map {
        let key = key
            .as_str()
            .ok_or_else(|| spec_err(location, "config keys must be strings"))?;
        match key {
            CONFIG_FILE_KEY => match value {
                Yaml::String(path) => out.push(OverrideSource::File(path.clone())),
                Yaml::Sequence(paths) => {
                    for path in paths {
                        let path = path.as_str().ok_or_else(|| {
                            spec_err(location, "'file' entries must be path strings")
                        })?;
                        out.push(OverrideSource::File(path.to_string()));
                    }
                }
                _ => {
                    return Err(spec_err(
                        location,
                        "'file' must be a path string or a list of path strings",
                    ));
                }
            },
            CONFIG_BLOCK_KEY => {
                let block = value
                    .as_str()
                    .ok_or_else(|| spec_err(location, "'block' must be a string"))?;
                out.push(OverrideSource::Block(block.to_string()));
            }
            path => out.push(OverrideSource::Value {
                path: path.to_string(),
                value: yaml_to_json(value, location)?,
            }),
        }
    }
    Ok(())
}

fn parse_parameters(value: &Yaml, name: &str, spec: &mut PipelineSpec) -> Result<()> {
    let Yaml::Mapping(params) = value else {
        return Err(spec_err(name, "'parameters' must be a mapping"));
    };
    for (key, value) in params {
        let key = key
            .as_str()
            .ok_or_else(|| spec_err(name, "parameter names must be strings"))?;
        spec.parameters
            .insert(key.to_string(), yaml_to_json(value, name)?);
    }
    Ok(())
}

fn parse_contracts(value: &Yaml, name: &str, spec: &mut PipelineSpec) -> Result<()> {
    let Yaml::Sequence(entries) = value else {
        return Err(spec_err(name, "'contracts' must be a list"));
    };
    for entry in entries {
        let contract = match entry {
            Yaml::String(expression) => Contract {
                expression: expression.clone(),
                message: None,
                provenance: Provenance::new(name),
            },
            Yaml::Mapping(map) => {
                let mut expression = None;
                let mut message = None;
                for (key, value) in map {
                    match key.as_str() {
                        Some("contract") => {
                            expression = value.as_str().map(str::to_string);
                        }
                        Some("msg") => {
                            message = value.as_str().map(str::to_string);
                        }
                        _ => {
                            return Err(spec_err(
                                name,
                                "contract entries accept only 'contract' and 'msg' keys",
                            ));
                        }
                    }
                }
                Contract {
                    expression: expression.ok_or_else(|| {
                        spec_err(name, "contract entry requires a 'contract' key")
                    })?,
                    message,
                    provenance: Provenance::new(name),
                }
            }
            _ => {
                return Err(spec_err(
                    name,
                    "contract entries must be expression strings or {contract, msg} blocks",
                ));
            }
        };
        spec.contracts.push(contract);
    }
    Ok(())
}

fn parse_subsets(value: &Yaml, name: &str, spec: &mut PipelineSpec) -> Result<()> {
    let Yaml::Mapping(subsets) = value else {
        return Err(spec_err(name, "'subsets' must be a mapping"));
    };
    for (subset_name, entry) in subsets {
        let subset_name = subset_name
            .as_str()
            .ok_or_else(|| spec_err(name, "subset names must be strings"))?;
        let location = format!("{name}: subset '{subset_name}'");
        let subset = match entry {
            Yaml::Sequence(_) => Subset {
                labels: string_list(entry, &location)?,
                description: None,
            },
            Yaml::Mapping(map) => {
                let mut labels = None;
                let mut description = None;
                for (key, value) in map {
                    match key.as_str() {
                        Some("subset") => labels = Some(string_list(value, &location)?),
                        Some("description") => {
                            description = value.as_str().map(str::to_string);
                        }
                        _ => {
                            return Err(spec_err(
                                &location,
                                "subset blocks accept only 'subset' and 'description' keys",
                            ));
                        }
                    }
                }
                Subset {
                    labels: labels
                        .ok_or_else(|| spec_err(&location, "subset block requires a 'subset' key"))?,
                    description,
                }
            }
            _ => {
                return Err(spec_err(
                    &location,
                    "subset must be a label list or a {subset, description} block",
                ));
            }
        };
        spec.subsets.insert(subset_name.to_string(), subset);
    }
    Ok(())
}

fn parse_imports(value: &Yaml, name: &str, spec: &mut PipelineSpec) -> Result<()> {
    match value {
        Yaml::Sequence(entries) => {
            for entry in entries {
                spec.imports.push(parse_import(entry, name)?);
            }
            Ok(())
        }
        Yaml::String(_) | Yaml::Mapping(_) => {
            spec.imports.push(parse_import(value, name)?);
            Ok(())
        }
        _ => Err(spec_err(
            name,
            "'imports' must be a location, an import block, or a list of either",
        )),
    }
}

fn parse_import(value: &Yaml, name: &str) -> Result<Import> {
    match value {
        Yaml::String(location) => Ok(Import {
            location: location.clone(),
            include: Vec::new(),
            exclude: Vec::new(),
            import_contracts: true,
        }),
        Yaml::Mapping(map) => {
            let mut location = None;
            let mut include = Vec::new();
            let mut exclude = Vec::new();
            let mut import_contracts = true;
            for (key, value) in map {
                match key.as_str() {
                    Some("location") => location = value.as_str().map(str::to_string),
                    Some("include") => include = string_list(value, name)?,
                    Some("exclude") => exclude = string_list(value, name)?,
                    Some("importContracts") => {
                        import_contracts = value
                            .as_bool()
                            .ok_or_else(|| spec_err(name, "'importContracts' must be a boolean"))?;
                    }
                    _ => {
                        return Err(spec_err(
                            name,
                            "import blocks accept 'location', 'include', 'exclude', \
                             and 'importContracts'",
                        ));
                    }
                }
            }
            if !include.is_empty() && !exclude.is_empty() {
                return Err(spec_err(
                    name,
                    "an import may list 'include' or 'exclude', not both",
                ));
            }
            Ok(Import {
                location: location
                    .ok_or_else(|| spec_err(name, "import block requires a 'location' key"))?,
                include,
                exclude,
                import_contracts,
            })
        }
        _ => Err(spec_err(
            name,
            "import entry must be a location string or an import block",
        )),
    }
}

fn string_list(value: &Yaml, location: &str) -> Result<Vec<String>> {
    let Yaml::Sequence(items) = value else {
        return Err(spec_err(location, "expected a list of strings"));
    };
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_string)
                .ok_or_else(|| spec_err(location, "expected a list of strings"))
        })
        .collect()
}

/// Convert a YAML value to the JSON value model used for configuration.
pub fn yaml_to_json(value: &Yaml, location: &str) -> Result<Json> {
    Ok(match value {
        Yaml::Null => Json::Null,
        Yaml::Bool(b) => Json::Bool(*b),
        Yaml::Number(n) => {
            if let Some(i) = n.as_i64() {
                Json::from(i)
            } else if let Some(f) = n.as_f64() {
                Json::from(f)
            } else {
                return Err(spec_err(location, format!("unrepresentable number {n}")));
            }
        }
        Yaml::String(s) => Json::from(s.clone()),
        Yaml::Sequence(items) => Json::Array(
            items
                .iter()
                .map(|item| yaml_to_json(item, location))
                .collect::<Result<_>>()?,
        ),
        Yaml::Mapping(map) => {
            let mut out = serde_json::Map::new();
            for (key, value) in map {
                let key = key
                    .as_str()
                    .ok_or_else(|| spec_err(location, "mapping keys must be strings"))?;
                out.insert(key.to_string(), yaml_to_json(value, location)?);
            }
            Json::Object(out)
        }
        Yaml::Tagged(_) => {
            return Err(spec_err(location, "YAML tags are not supported"));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_minimal_document() {
        let spec = parse_document(
            r#"
description: A trivial pipeline
tasks:
  isr: ip.isr.IsrTask
"#,
            "min.yaml",
        )
        .unwrap();
        assert_eq!(spec.description, "A trivial pipeline");
        assert_eq!(spec.labels().collect::<Vec<_>>(), vec!["isr"]);
        assert_eq!(spec.step("isr").unwrap().class, "ip.isr.IsrTask");
    }

    #[test]
    fn parse_step_with_config_chain() {
        let spec = parse_document(
            r#"
description: overrides
tasks:
  calibrate:
    class: pipe.tasks.CalibrateTask
    config:
      astrometry.maxIter: 5
      file: $CONFIG_DIR/calibrate.yaml
      block: |
        config.doWrite = false
"#,
            "doc.yaml",
        )
        .unwrap();
        let step = spec.step("calibrate").unwrap();
        assert_eq!(step.overrides.len(), 3);
        assert_eq!(
            step.overrides[0],
            OverrideSource::Value {
                path: "astrometry.maxIter".into(),
                value: json!(5)
            }
        );
        assert_eq!(
            step.overrides[1],
            OverrideSource::File("$CONFIG_DIR/calibrate.yaml".into())
        );
        assert!(matches!(&step.overrides[2], OverrideSource::Block(b) if b.contains("doWrite")));
    }

    #[test]
    fn parse_config_as_list_of_mappings_preserves_order() {
        let spec = parse_document(
            r#"
description: ordered
tasks:
  isr:
    class: pkg.Isr
    config:
      - overscan.fitType: MEDIAN
      - file: [a.yaml, b.yaml]
      - overscan.order: 3
"#,
            "doc.yaml",
        )
        .unwrap();
        let step = spec.step("isr").unwrap();
        assert_eq!(step.overrides.len(), 4);
        assert!(matches!(&step.overrides[1], OverrideSource::File(p) if p == "a.yaml"));
        assert!(matches!(&step.overrides[2], OverrideSource::File(p) if p == "b.yaml"));
        assert!(
            matches!(&step.overrides[3], OverrideSource::Value { path, .. } if path == "overscan.order")
        );
    }

    #[test]
    fn parse_parameters_contracts_subsets() {
        let spec = parse_document(
            r#"
description: full surface
parameters:
  coadd_name: deep
  kernel: 29
tasks:
  makeWarp: pkg.MakeWarp
  assembleCoadd: pkg.AssembleCoadd
contracts:
  - makeWarp.matchingKernelSize == assembleCoadd.matchingKernelSize
  - contract: assembleCoadd.doWrite
    msg: coadds must be persisted
subsets:
  coaddition:
    subset: [makeWarp, assembleCoadd]
    description: warp and coadd only
  warps: [makeWarp]
"#,
            "doc.yaml",
        )
        .unwrap();
        assert_eq!(spec.parameters["coadd_name"], json!("deep"));
        assert_eq!(spec.contracts.len(), 2);
        assert_eq!(
            spec.contracts[1].message.as_deref(),
            Some("coadds must be persisted")
        );
        assert_eq!(spec.subsets["coaddition"].labels.len(), 2);
        assert_eq!(spec.subsets["warps"].description, None);
    }

    #[test]
    fn parse_imports_forms() {
        let spec = parse_document(
            r#"
description: importer
imports:
  - base.yaml
  - location: extra.yaml
    exclude: [slowStep]
    importContracts: false
tasks:
  local: pkg.Local
"#,
            "doc.yaml",
        )
        .unwrap();
        assert_eq!(spec.imports.len(), 2);
        assert_eq!(spec.imports[0].location, "base.yaml");
        assert!(spec.imports[0].import_contracts);
        assert_eq!(spec.imports[1].exclude, vec!["slowStep".to_string()]);
        assert!(!spec.imports[1].import_contracts);
    }

    #[test]
    fn parse_import_include_and_exclude_is_error() {
        let err = parse_document(
            r#"
description: bad import
imports:
  - location: base.yaml
    include: [a]
    exclude: [b]
"#,
            "doc.yaml",
        )
        .unwrap_err();
        assert!(err.to_string().contains("not both"));
    }

    #[test]
    fn parse_missing_description_is_error() {
        let err = parse_document("tasks:\n  a: pkg.A\n", "doc.yaml").unwrap_err();
        assert!(err.to_string().contains("description"));
    }

    #[test]
    fn parse_unknown_top_level_key_is_error() {
        let err = parse_document(
            "description: x\ntasks:\n  a: pkg.A\nstages:\n  b: pkg.B\n",
            "doc.yaml",
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown top-level key 'stages'"));
    }

    #[test]
    fn parse_duplicate_label_same_class_merges() {
        // YAML forbids duplicate mapping keys, but the same label can arrive
        // from two documents; add_step handles the merge. Here we only check
        // the single-document parse keeps one entry per label.
        let spec = parse_document(
            "description: x\ntasks:\n  a: pkg.A\n  b: pkg.B\n",
            "doc.yaml",
        )
        .unwrap();
        assert_eq!(spec.len(), 2);
    }

    #[test]
    fn yaml_to_json_nested() {
        let yaml: Yaml = serde_yaml::from_str("{a: [1, 2.5], b: {c: true}}").unwrap();
        let json = yaml_to_json(&yaml, "test").unwrap();
        assert_eq!(json, json!({"a": [1, 2.5], "b": {"c": true}}));
    }
}
