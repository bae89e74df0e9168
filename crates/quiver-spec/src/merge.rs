//! Composition merger: resolves `imports` into a single flat document.
//!
//! Documents are loaded depth-first through a [`DocumentLoader`], imported
//! content is filtered by `include`/`exclude`, and the importing document's
//! own declarations are layered last. Merging is deterministic: steps keep
//! import order then declaration order.

use quiver_types::{QuiverError, Result};
use tracing::debug;

use crate::document::parse_document;
use crate::model::PipelineSpec;

/// Seam between the merger and document storage. The CLI supplies a
/// filesystem loader; tests supply an in-memory map.
pub trait DocumentLoader {
    /// Load the document at `location` as referenced from `importer`.
    fn load(&self, location: &str, importer: &str) -> Result<LoadedDocument>;
}

/// A loaded document together with the canonical name used for cycle
/// detection and provenance.
pub struct LoadedDocument {
    pub source: String,
    pub name: String,
}

/// Flatten `root` and its transitive imports into one document.
pub fn merge(root: PipelineSpec, root_name: &str, loader: &dyn DocumentLoader) -> Result<PipelineSpec> {
    let mut active = vec![root_name.to_string()];
    merge_inner(root, root_name, loader, &mut active)
}

fn merge_inner(
    spec: PipelineSpec,
    name: &str,
    loader: &dyn DocumentLoader,
    active: &mut Vec<String>,
) -> Result<PipelineSpec> {
    if spec.imports.is_empty() {
        return Ok(spec);
    }

    let mut merged = PipelineSpec::new(spec.description.clone());
    for import in &spec.imports {
        let loaded = loader.load(&import.location, name)?;
        if active.contains(&loaded.name) {
            let mut chain = active.clone();
            chain.push(loaded.name.clone());
            return Err(QuiverError::ImportCycle { chain });
        }
        debug!(from = name, import = %loaded.name, "merging imported document");

        active.push(loaded.name.clone());
        let sub = parse_document(&loaded.source, &loaded.name)?;
        let mut sub = merge_inner(sub, &loaded.name, loader, active)?;
        active.pop();

        filter_labels(&mut sub, &loaded.name, &import.include, &import.exclude)?;
        if !import.import_contracts {
            sub.contracts.clear();
        }
        overlay(&mut merged, sub)?;
    }

    // The importing document's own declarations land last so its overrides,
    // parameters, and subsets take precedence.
    let description = spec.description.clone();
    overlay(&mut merged, spec)?;
    merged.description = description;
    merged.imports.clear();
    Ok(merged)
}

/// Apply an import's `include`/`exclude` list. Every listed label must exist
/// in the imported document.
fn filter_labels(
    spec: &mut PipelineSpec,
    name: &str,
    include: &[String],
    exclude: &[String],
) -> Result<()> {
    for label in include.iter().chain(exclude) {
        if !spec.has_step(label) {
            return Err(QuiverError::Spec {
                location: name.to_string(),
                message: format!("import filter names unknown step '{label}'"),
            });
        }
    }
    if !include.is_empty() {
        let drop: Vec<String> = spec
            .labels()
            .filter(|l| !include.iter().any(|k| k == l))
            .map(str::to_string)
            .collect();
        for label in &drop {
            spec.remove_step(label);
        }
    }
    for label in exclude {
        spec.remove_step(label);
    }
    spec.subsets.retain(|_, subset| !subset.labels.is_empty());
    Ok(())
}

/// Layer `upper` onto `base`: steps merge through the collision rules,
/// contracts append, parameters and subsets take the upper document's value
/// per name.
fn overlay(base: &mut PipelineSpec, upper: PipelineSpec) -> Result<()> {
    for step in upper.steps() {
        base.add_step(step.clone())?;
    }
    base.contracts.extend(upper.contracts);
    base.parameters.extend(upper.parameters);
    base.subsets.extend(upper.subsets);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct MapLoader(BTreeMap<&'static str, &'static str>);

    impl DocumentLoader for MapLoader {
        fn load(&self, location: &str, importer: &str) -> Result<LoadedDocument> {
            self.0
                .get(location)
                .map(|source| LoadedDocument {
                    source: source.to_string(),
                    name: location.to_string(),
                })
                .ok_or_else(|| QuiverError::Spec {
                    location: importer.to_string(),
                    message: format!("cannot load import '{location}'"),
                })
        }
    }

    fn loader(docs: &[(&'static str, &'static str)]) -> MapLoader {
        MapLoader(docs.iter().copied().collect())
    }

    fn parse(source: &str, name: &str) -> PipelineSpec {
        parse_document(source, name).unwrap()
    }

    #[test]
    fn merge_without_imports_is_identity() {
        let spec = parse("description: x\ntasks:\n  a: pkg.A\n", "root.yaml");
        let merged = merge(spec.clone(), "root.yaml", &loader(&[])).unwrap();
        assert_eq!(merged.labels().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn imported_steps_precede_local_steps() {
        let l = loader(&[(
            "base.yaml",
            "description: base\ntasks:\n  isr: pkg.Isr\n  characterize: pkg.Char\n",
        )]);
        let root = parse(
            "description: root\nimports: base.yaml\ntasks:\n  calibrate: pkg.Cal\n",
            "root.yaml",
        );
        let merged = merge(root, "root.yaml", &l).unwrap();
        assert_eq!(
            merged.labels().collect::<Vec<_>>(),
            vec!["isr", "characterize", "calibrate"]
        );
        assert_eq!(merged.description, "root");
        assert!(merged.imports.is_empty());
    }

    #[test]
    fn redeclaration_with_same_class_concatenates_overrides() {
        let l = loader(&[(
            "base.yaml",
            "description: base\ntasks:\n  isr:\n    class: pkg.Isr\n    config:\n      a.b: 1\n",
        )]);
        let root = parse(
            "description: root\nimports: base.yaml\ntasks:\n  isr:\n    class: pkg.Isr\n    config:\n      a.b: 2\n",
            "root.yaml",
        );
        let merged = merge(root, "root.yaml", &l).unwrap();
        let overrides = &merged.step("isr").unwrap().overrides;
        assert_eq!(overrides.len(), 2);
    }

    #[test]
    fn redeclaration_with_different_class_is_collision() {
        let l = loader(&[(
            "base.yaml",
            "description: base\ntasks:\n  isr: pkg.Isr\n",
        )]);
        let root = parse(
            "description: root\nimports: base.yaml\ntasks:\n  isr: other.Isr\n",
            "root.yaml",
        );
        let err = merge(root, "root.yaml", &l).unwrap_err();
        assert!(matches!(err, QuiverError::LabelCollision { .. }));
    }

    #[test]
    fn exclude_drops_step_and_empty_subsets() {
        let l = loader(&[(
            "base.yaml",
            "description: base\ntasks:\n  a: pkg.A\n  b: pkg.B\nsubsets:\n  onlyB: [b]\n  both: [a, b]\n",
        )]);
        let root = parse(
            "description: root\nimports:\n  - location: base.yaml\n    exclude: [b]\n",
            "root.yaml",
        );
        let merged = merge(root, "root.yaml", &l).unwrap();
        assert!(!merged.has_step("b"));
        assert!(!merged.subsets.contains_key("onlyB"));
        assert_eq!(merged.subsets["both"].labels, vec!["a".to_string()]);
    }

    #[test]
    fn include_keeps_only_listed_steps() {
        let l = loader(&[(
            "base.yaml",
            "description: base\ntasks:\n  a: pkg.A\n  b: pkg.B\n  c: pkg.C\n",
        )]);
        let root = parse(
            "description: root\nimports:\n  - location: base.yaml\n    include: [b]\n",
            "root.yaml",
        );
        let merged = merge(root, "root.yaml", &l).unwrap();
        assert_eq!(merged.labels().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn filter_naming_unknown_label_is_error() {
        let l = loader(&[("base.yaml", "description: base\ntasks:\n  a: pkg.A\n")]);
        let root = parse(
            "description: root\nimports:\n  - location: base.yaml\n    exclude: [ghost]\n",
            "root.yaml",
        );
        let err = merge(root, "root.yaml", &l).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn import_contracts_false_strips_imported_contracts() {
        let l = loader(&[(
            "base.yaml",
            "description: base\ntasks:\n  a: pkg.A\ncontracts:\n  - a.doWrite\n",
        )]);
        let root = parse(
            "description: root\nimports:\n  - location: base.yaml\n    importContracts: false\ncontracts:\n  - a.doFlat\n",
            "root.yaml",
        );
        let merged = merge(root, "root.yaml", &l).unwrap();
        assert_eq!(merged.contracts.len(), 1);
        assert_eq!(merged.contracts[0].expression, "a.doFlat");
    }

    #[test]
    fn importing_document_wins_parameters_and_subsets() {
        let l = loader(&[(
            "base.yaml",
            "description: base\ntasks:\n  a: pkg.A\nparameters:\n  depth: 3\nsubsets:\n  quick: [a]\n",
        )]);
        let root = parse(
            "description: root\nimports: base.yaml\ntasks:\n  b: pkg.B\nparameters:\n  depth: 7\nsubsets:\n  quick: [b]\n",
            "root.yaml",
        );
        let merged = merge(root, "root.yaml", &l).unwrap();
        assert_eq!(merged.parameters["depth"], serde_json::json!(7));
        assert_eq!(merged.subsets["quick"].labels, vec!["b".to_string()]);
    }

    #[test]
    fn transitive_imports_flatten() {
        let l = loader(&[
            (
                "mid.yaml",
                "description: mid\nimports: base.yaml\ntasks:\n  m: pkg.M\n",
            ),
            ("base.yaml", "description: base\ntasks:\n  b: pkg.B\n"),
        ]);
        let root = parse("description: root\nimports: mid.yaml\n", "root.yaml");
        let merged = merge(root, "root.yaml", &l).unwrap();
        assert_eq!(merged.labels().collect::<Vec<_>>(), vec!["b", "m"]);
    }

    #[test]
    fn import_cycle_names_the_chain() {
        let l = loader(&[
            (
                "a.yaml",
                "description: a\nimports: b.yaml\ntasks:\n  x: pkg.X\n",
            ),
            (
                "b.yaml",
                "description: b\nimports: a.yaml\ntasks:\n  y: pkg.Y\n",
            ),
        ]);
        let root = parse("description: root\nimports: a.yaml\n", "root.yaml");
        let err = merge(root, "root.yaml", &l).unwrap_err();
        let QuiverError::ImportCycle { chain } = err else {
            panic!("expected import cycle, got {err}");
        };
        assert_eq!(chain, vec!["root.yaml", "a.yaml", "b.yaml", "a.yaml"]);
    }
}
