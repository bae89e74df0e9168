//! Subset validation.
//!
//! Subsets are named label groups used to select a slice of the pipeline.
//! Validation only checks membership against the merged step set; graph-level
//! views come from [`ExecutionGraph::subgraph`](crate::graph::ExecutionGraph::subgraph).

use std::collections::{BTreeMap, BTreeSet};

use quiver_spec::PipelineSpec;
use quiver_types::{QuiverError, Result};

pub fn validate_subsets(spec: &PipelineSpec) -> Result<BTreeMap<String, BTreeSet<String>>> {
    let mut out = BTreeMap::new();
    for (name, subset) in &spec.subsets {
        let mut labels = BTreeSet::new();
        for label in &subset.labels {
            if !spec.has_step(label) {
                return Err(QuiverError::SubsetUndefinedLabel {
                    subset: name.clone(),
                    label: label.clone(),
                });
            }
            labels.insert(label.clone());
        }
        out.insert(name.clone(), labels);
    }
    Ok(out)
}
