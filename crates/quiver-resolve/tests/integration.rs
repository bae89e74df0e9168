//! End-to-end integration tests: parse document -> merge imports ->
//! substitute parameters -> resolve configs -> contracts -> graph.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;

use serde_json::json;

use quiver_resolve::{
    ConnectionTemplate, FieldSpec, FieldType, MemoryRegistry, Resolution, Resolver, StepSchema,
};
use quiver_spec::{merge, parse_document, DocumentLoader, LoadedDocument, PipelineSpec};
use quiver_types::{QuiverError, Result};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

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

fn field(field_type: FieldType, default: serde_json::Value) -> FieldSpec {
    FieldSpec {
        field_type,
        default,
        doc: None,
    }
}

fn connection(name: &str, dimensions: &[&str], external: bool) -> ConnectionTemplate {
    ConnectionTemplate {
        name_template: name.to_string(),
        dimensions: dimensions.iter().map(|d| d.to_string()).collect(),
        external,
    }
}

/// Registry mirroring a small single-frame-processing setup plus coaddition.
fn registry() -> MemoryRegistry {
    let visit = &["instrument", "visit", "detector"];
    let patch = &["skymap", "tract", "patch"];
    let mut registry = MemoryRegistry::new();

    registry.insert(
        "pipe.tasks.Isr",
        StepSchema {
            fields: [
                ("overscan.fitType".to_string(), field(FieldType::Str, json!("MEDIAN"))),
                ("overscan.order".to_string(), field(FieldType::Int, json!(1))),
                ("doBias".to_string(), field(FieldType::Bool, json!(true))),
            ]
            .into(),
            inputs: vec![connection("raw", visit, true)],
            outputs: vec![connection("postISRCCD", visit, false)],
        },
    );
    registry.insert(
        "pipe.tasks.Characterize",
        StepSchema {
            fields: [("psfKernelSize".to_string(), field(FieldType::Int, json!(21)))].into(),
            inputs: vec![connection("postISRCCD", visit, false)],
            outputs: vec![connection("icExp", visit, false)],
        },
    );
    registry.insert(
        "pipe.tasks.Calibrate",
        StepSchema {
            fields: [
                ("doWrite".to_string(), field(FieldType::Bool, json!(true))),
                ("astrometry.maxIter".to_string(), field(FieldType::Int, json!(10))),
            ]
            .into(),
            inputs: vec![
                connection("icExp", visit, false),
                connection("refcat", &["htm7"], true),
            ],
            outputs: vec![connection("calexp", visit, false), connection("src", visit, false)],
        },
    );
    registry.insert(
        "pipe.tasks.MakeWarp",
        StepSchema {
            fields: [
                ("matchingKernelSize".to_string(), field(FieldType::Int, json!(29))),
                ("connections.coaddName".to_string(), field(FieldType::Str, json!("deep"))),
            ]
            .into(),
            inputs: vec![connection("calexp", visit, true)],
            outputs: vec![connection("{connections.coaddName}Coadd_warp", patch, false)],
        },
    );
    registry.insert(
        "pipe.tasks.AssembleCoadd",
        StepSchema {
            fields: [
                ("matchingKernelSize".to_string(), field(FieldType::Int, json!(29))),
                ("connections.coaddName".to_string(), field(FieldType::Str, json!("deep"))),
            ]
            .into(),
            inputs: vec![connection("{connections.coaddName}Coadd_warp", patch, false)],
            outputs: vec![connection("{connections.coaddName}Coadd", patch, false)],
        },
    );
    registry
}

fn resolve(source: &str) -> Result<Resolution> {
    let spec = parse_document(source, "pipeline.yaml")?;
    Resolver::new(registry()).resolve(&spec)
}

const SINGLE_FRAME: &str = r#"
description: Single-frame processing
tasks:
  isr: pipe.tasks.Isr
  characterize: pipe.tasks.Characterize
  calibrate: pipe.tasks.Calibrate
subsets:
  detection:
    subset: [characterize, calibrate]
    description: steps that touch sources
"#;

// ---------------------------------------------------------------------------
// End-to-end resolution
// ---------------------------------------------------------------------------

#[test]
fn single_frame_chain_resolves_in_order() {
    let resolution = resolve(SINGLE_FRAME).expect("resolution should succeed");
    assert_eq!(
        resolution.graph.topo_order(),
        vec!["isr", "characterize", "calibrate"]
    );
    assert_eq!(
        resolution.graph.pipeline_inputs().into_iter().collect::<Vec<_>>(),
        vec!["raw", "refcat"]
    );
    assert_eq!(
        resolution.graph.pipeline_outputs().into_iter().collect::<Vec<_>>(),
        vec!["calexp", "src"]
    );
    assert_eq!(resolution.subsets["detection"].len(), 2);
}

#[test]
fn declaration_order_does_not_change_the_graph() {
    let reversed = r#"
description: Single-frame processing, declared backwards
tasks:
  calibrate: pipe.tasks.Calibrate
  characterize: pipe.tasks.Characterize
  isr: pipe.tasks.Isr
"#;
    let forward = resolve(SINGLE_FRAME).unwrap();
    let backward = resolve(reversed).unwrap();
    assert_eq!(forward.graph.all_edges(), backward.graph.all_edges());
    assert_eq!(forward.graph.topo_order(), backward.graph.topo_order());
}

#[test]
fn parameters_flow_into_configs_and_contracts() {
    let resolution = resolve(
        r#"
description: parameterized
parameters:
  kernel: 15
tasks:
  makeWarp:
    class: pipe.tasks.MakeWarp
    config:
      matchingKernelSize: parameters.kernel
  assembleCoadd:
    class: pipe.tasks.AssembleCoadd
    config:
      matchingKernelSize: parameters.kernel
contracts:
  - makeWarp.matchingKernelSize == assembleCoadd.matchingKernelSize
"#,
    )
    .unwrap();
    let warp = &resolution.resolved[0];
    assert_eq!(warp.label, "makeWarp");
    assert_eq!(warp.config["matchingKernelSize"], json!(15));
}

#[test]
fn kernel_mismatch_contract_reports_its_message() {
    let err = resolve(
        r#"
description: mismatched kernels
tasks:
  makeWarp:
    class: pipe.tasks.MakeWarp
    config:
      matchingKernelSize: 29
  assembleCoadd:
    class: pipe.tasks.AssembleCoadd
    config:
      matchingKernelSize: 15
contracts:
  - contract: makeWarp.matchingKernelSize == assembleCoadd.matchingKernelSize
    msg: warp and coadd matching kernels must agree
"#,
    )
    .unwrap_err();
    let QuiverError::ContractViolations { failures } = err else {
        panic!("expected contract violations, got {err}");
    };
    assert_eq!(failures.len(), 1);
    assert_eq!(
        failures[0].message.as_deref(),
        Some("warp and coadd matching kernels must agree")
    );
}

#[test]
fn coadd_name_template_rewires_the_graph() {
    let resolution = resolve(
        r#"
description: good-seeing coadds
parameters:
  coadd_name: goodSeeing
tasks:
  makeWarp:
    class: pipe.tasks.MakeWarp
    config:
      connections.coaddName: parameters.coadd_name
  assembleCoadd:
    class: pipe.tasks.AssembleCoadd
    config:
      connections.coaddName: parameters.coadd_name
"#,
    )
    .unwrap();
    assert_eq!(
        resolution.graph.producer_of("goodSeeingCoadd_warp"),
        Some("makeWarp")
    );
    assert!(resolution
        .graph
        .pipeline_outputs()
        .contains("goodSeeingCoadd"));
}

// ---------------------------------------------------------------------------
// Wiring errors
// ---------------------------------------------------------------------------

#[test]
fn two_producers_of_one_product_is_rejected() {
    let err = resolve(
        r#"
description: duplicated calibrate
tasks:
  calibrateA:
    class: pipe.tasks.Calibrate
  calibrateB:
    class: pipe.tasks.Calibrate
  isr: pipe.tasks.Isr
  characterize: pipe.tasks.Characterize
"#,
    )
    .unwrap_err();
    let QuiverError::AmbiguousProducer { product, producers } = err else {
        panic!("expected ambiguous producer, got {err}");
    };
    assert!(product == "calexp" || product == "src");
    assert_eq!(producers, vec!["calibrateA", "calibrateB"]);
}

#[test]
fn consuming_without_a_producer_is_rejected() {
    let err = resolve(
        "description: orphan\ntasks:\n  characterize: pipe.tasks.Characterize\n",
    )
    .unwrap_err();
    let QuiverError::DanglingInput { step, product } = err else {
        panic!("expected dangling input, got {err}");
    };
    assert_eq!(step, "characterize");
    assert_eq!(product, "postISRCCD");
}

#[test]
fn subset_naming_a_missing_step_is_rejected() {
    let err = resolve(
        "description: bad subset\ntasks:\n  isr: pipe.tasks.Isr\nsubsets:\n  quick: [isr, ghost]\n",
    )
    .unwrap_err();
    assert!(matches!(err, QuiverError::SubsetUndefinedLabel { .. }));
}

#[test]
fn unknown_field_fails_from_every_source_kind() {
    let literal = resolve(
        "description: x\ntasks:\n  isr:\n    class: pipe.tasks.Isr\n    config:\n      ghost: 1\n",
    )
    .unwrap_err();
    assert!(matches!(literal, QuiverError::UnknownConfigField { .. }));

    let block = resolve(
        "description: x\ntasks:\n  isr:\n    class: pipe.tasks.Isr\n    config:\n      block: |\n        config.ghost = 1\n",
    )
    .unwrap_err();
    assert!(matches!(block, QuiverError::UnknownConfigField { .. }));

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "ghost: 1\n").unwrap();
    let source = format!(
        "description: x\ntasks:\n  isr:\n    class: pipe.tasks.Isr\n    config:\n      file: {}\n",
        file.path().display()
    );
    let from_file = resolve(&source).unwrap_err();
    assert!(matches!(from_file, QuiverError::UnknownConfigField { .. }));
}

// ---------------------------------------------------------------------------
// Imports feeding resolution
// ---------------------------------------------------------------------------

fn merged(root: &str, docs: &[(&'static str, &'static str)]) -> Result<PipelineSpec> {
    let loader = MapLoader(docs.iter().copied().collect());
    let spec = parse_document(root, "root.yaml")?;
    merge(spec, "root.yaml", &loader)
}

#[test]
fn imported_pipeline_resolves_with_local_overrides() {
    let spec = merged(
        r#"
description: DRP
imports: singleFrame.yaml
tasks:
  isr:
    class: pipe.tasks.Isr
    config:
      overscan.order: 5
"#,
        &[("singleFrame.yaml", SINGLE_FRAME)],
    )
    .unwrap();
    let resolution = Resolver::new(registry()).resolve(&spec).unwrap();
    assert_eq!(resolution.resolved.len(), 3);
    let isr = resolution
        .resolved
        .iter()
        .find(|s| s.label == "isr")
        .expect("isr should survive the merge");
    assert_eq!(isr.config["overscan"]["order"], json!(5));
    assert_eq!(resolution.subsets["detection"].len(), 2);
}

#[test]
fn excluded_step_leaves_a_dangling_consumer() {
    let spec = merged(
        r#"
description: DRP without isr
imports:
  - location: singleFrame.yaml
    exclude: [isr]
"#,
        &[("singleFrame.yaml", SINGLE_FRAME)],
    )
    .unwrap();
    let err = Resolver::new(registry()).resolve(&spec).unwrap_err();
    let QuiverError::DanglingInput { product, .. } = err else {
        panic!("expected dangling input, got {err}");
    };
    assert_eq!(product, "postISRCCD");
}

#[test]
fn subset_selects_a_restricted_graph_view() {
    let resolution = resolve(SINGLE_FRAME).unwrap();
    let labels: BTreeSet<String> = resolution.subsets["detection"].clone();
    let view = resolution.graph.subgraph(&labels);
    assert_eq!(view.topo_order(), vec!["characterize", "calibrate"]);
    assert!(view.pipeline_inputs().contains("postISRCCD"));
}
