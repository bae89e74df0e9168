//! In-memory Document Model for a parsed pipeline specification.
//!
//! Built once per document set by the parser and the composition merger,
//! read-only thereafter. Step declaration order is preserved separately from
//! the label index so that resolution can be order-independent while error
//! messages and override precedence still follow the document.

use std::collections::BTreeMap;

use quiver_types::{Provenance, QuiverError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One source of configuration overrides for a step, in document order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OverrideSource {
    /// A dotted-path literal entry: `psf.kernelSize: 21`.
    Value { path: String, value: Value },
    /// A reference to an external override file; the path may contain
    /// environment-variable placeholders.
    File(String),
    /// An embedded expression block. Blocks always apply after all literal
    /// and file overrides for the step, in document order among themselves.
    Block(String),
}

/// A labeled processing step: implementation reference plus override chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDecl {
    pub label: String,
    /// Qualified implementation reference, resolved via the schema registry.
    pub class: String,
    pub overrides: Vec<OverrideSource>,
    pub provenance: Provenance,
}

/// A consistency expression checked across resolved step configurations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub expression: String,
    pub message: Option<String>,
    pub provenance: Provenance,
}

/// A named group of step labels selecting a partial execution plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subset {
    pub labels: Vec<String>,
    pub description: Option<String>,
}

/// A declared import of another specification document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Import {
    pub location: String,
    /// Keep only these labels from the imported document. Mutually exclusive
    /// with `exclude`.
    pub include: Vec<String>,
    /// Drop these labels from the imported document.
    pub exclude: Vec<String>,
    pub import_contracts: bool,
}

/// A complete specification document (or the merge of several).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub description: String,
    pub parameters: BTreeMap<String, Value>,
    pub contracts: Vec<Contract>,
    pub subsets: BTreeMap<String, Subset>,
    pub imports: Vec<Import>,
    pub(crate) steps: BTreeMap<String, StepDecl>,
    pub(crate) step_order: Vec<String>,
}

impl PipelineSpec {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    /// Add or merge a step declaration.
    ///
    /// Re-declaring a label with the same implementation reference appends to
    /// the existing override chain (the later declaration overrides). The same
    /// label with a *different* implementation reference is ambiguous and
    /// fails with [`QuiverError::LabelCollision`].
    pub fn add_step(&mut self, step: StepDecl) -> Result<()> {
        match self.steps.get_mut(&step.label) {
            None => {
                self.step_order.push(step.label.clone());
                self.steps.insert(step.label.clone(), step);
            }
            Some(existing) if existing.class == step.class => {
                existing.overrides.extend(step.overrides);
                existing.provenance = step.provenance;
            }
            Some(existing) => {
                return Err(QuiverError::LabelCollision {
                    label: step.label,
                    first: existing.class.clone(),
                    second: step.class,
                });
            }
        }
        Ok(())
    }

    /// Remove a step and its subset memberships. No-op for unknown labels.
    pub fn remove_step(&mut self, label: &str) {
        if self.steps.remove(label).is_some() {
            self.step_order.retain(|l| l != label);
            for subset in self.subsets.values_mut() {
                subset.labels.retain(|l| l != label);
            }
        }
    }

    pub fn step(&self, label: &str) -> Option<&StepDecl> {
        self.steps.get(label)
    }

    pub fn has_step(&self, label: &str) -> bool {
        self.steps.contains_key(label)
    }

    /// Steps in declaration order.
    pub fn steps(&self) -> impl Iterator<Item = &StepDecl> {
        self.step_order.iter().filter_map(|l| self.steps.get(l))
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.step_order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub(crate) fn steps_mut(&mut self) -> impl Iterator<Item = &mut StepDecl> {
        self.steps.values_mut()
    }
}
