//! Shared types and the unified error taxonomy for the Quiver pipeline resolver.
//!
//! This crate provides the foundational types used across all other Quiver crates:
//! - `QuiverError`: unified error taxonomy for the whole resolution pass
//! - `ContractFailure`: one entry in an aggregated contract report
//! - `Provenance`: where a specification entry originated, for error messages

use std::fmt;

use serde::{Deserialize, Serialize};

/// One failed contract, as collected by the contract evaluator.
///
/// Contract evaluation does not stop at the first failure; every failure is
/// collected into a single [`QuiverError::ContractViolations`] report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractFailure {
    /// The contract expression as written in the specification document.
    pub expression: String,
    /// Optional human-readable message supplied alongside the expression.
    pub message: Option<String>,
    /// What went wrong: `"evaluated to false"` or an evaluation error.
    pub detail: String,
}

impl fmt::Display for ContractFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "contract '{}' {}", self.expression, self.detail)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

/// Unified error type for all Quiver subsystems.
///
/// Every error is detected during the resolution pass, before any processing
/// step executes, and carries enough context (step label, field path,
/// expression text) for a caller to act without re-running.
#[derive(Debug, thiserror::Error)]
pub enum QuiverError {
    // === Document / composition errors ===
    #[error("specification error in {location}: {message}")]
    Spec { location: String, message: String },

    #[error("import cycle detected: {}", chain.join(" -> "))]
    ImportCycle { chain: Vec<String> },

    #[error(
        "step label '{label}' is declared with implementation '{first}' and again \
         with conflicting implementation '{second}'"
    )]
    LabelCollision {
        label: String,
        first: String,
        second: String,
    },

    // === Parameter errors ===
    #[error("undefined parameter 'parameters.{name}' referenced from {used_in}")]
    UndefinedParameter { name: String, used_in: String },

    #[error("parameter reference cycle: {}", chain.join(" -> "))]
    ParameterCycle { chain: Vec<String> },

    // === Configuration errors ===
    #[error("unknown implementation reference '{reference}'")]
    UnknownImplementation { reference: String },

    #[error("step '{step}': config override addresses unknown field '{path}'")]
    UnknownConfigField { step: String, path: String },

    #[error("step '{step}': field '{path}' expects {expected}, got {actual}")]
    ConfigType {
        step: String,
        path: String,
        expected: String,
        actual: String,
    },

    // === Contract errors ===
    #[error("contract '{expression}' references undefined step label '{label}'")]
    ContractUndefinedLabel { label: String, expression: String },

    #[error("{} contract(s) failed:\n{}", failures.len(),
            failures.iter().map(|f| format!("  {f}")).collect::<Vec<_>>().join("\n"))]
    ContractViolations { failures: Vec<ContractFailure> },

    // === Subset errors ===
    #[error("subset '{subset}' references undefined step label '{label}'")]
    SubsetUndefinedLabel { subset: String, label: String },

    // === Graph errors ===
    #[error("step '{step}' consumes '{product}' but no selected step produces it")]
    DanglingInput { step: String, product: String },

    #[error("data product '{product}' has multiple producers: {}", producers.join(", "))]
    AmbiguousProducer {
        product: String,
        producers: Vec<String>,
    },

    #[error("dependency cycle through data product '{product}': {}", steps.join(" -> "))]
    GraphCycle { steps: Vec<String>, product: String },

    #[error(
        "data product '{product}' declared with dimensions [{declared}] and again \
         with conflicting dimensions [{conflicting}]"
    )]
    ProductDimensionMismatch {
        product: String,
        declared: String,
        conflicting: String,
    },

    // === Expression errors ===
    #[error("parse error in expression '{expression}' at offset {offset}: {message}")]
    EvalParse {
        expression: String,
        offset: usize,
        message: String,
    },

    #[error("evaluation error in '{expression}': {message}")]
    Eval { expression: String, message: String },

    #[error("expression '{expression}' exceeded its execution budget after {elapsed_ms}ms")]
    EvalTimeout { expression: String, elapsed_ms: u64 },

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// The resolution phase an error belongs to. Used by callers (and the CLI)
/// to group diagnostics without matching on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvePhase {
    Compose,
    Parameters,
    Config,
    Contracts,
    Subsets,
    Graph,
    Expression,
    Io,
}

impl QuiverError {
    /// Which resolution phase produced this error.
    pub fn phase(&self) -> ResolvePhase {
        match self {
            QuiverError::Spec { .. }
            | QuiverError::ImportCycle { .. }
            | QuiverError::LabelCollision { .. } => ResolvePhase::Compose,
            QuiverError::UndefinedParameter { .. } | QuiverError::ParameterCycle { .. } => {
                ResolvePhase::Parameters
            }
            QuiverError::UnknownImplementation { .. }
            | QuiverError::UnknownConfigField { .. }
            | QuiverError::ConfigType { .. } => ResolvePhase::Config,
            QuiverError::ContractUndefinedLabel { .. }
            | QuiverError::ContractViolations { .. } => ResolvePhase::Contracts,
            QuiverError::SubsetUndefinedLabel { .. } => ResolvePhase::Subsets,
            QuiverError::DanglingInput { .. }
            | QuiverError::AmbiguousProducer { .. }
            | QuiverError::GraphCycle { .. }
            | QuiverError::ProductDimensionMismatch { .. } => ResolvePhase::Graph,
            QuiverError::EvalParse { .. }
            | QuiverError::Eval { .. }
            | QuiverError::EvalTimeout { .. } => ResolvePhase::Expression,
            QuiverError::Io(_) | QuiverError::Json(_) | QuiverError::Yaml(_) => ResolvePhase::Io,
        }
    }

    /// Returns `true` for wiring errors: mistakes in how steps are connected
    /// through data products, as opposed to configuration-value mistakes.
    pub fn is_wiring_error(&self) -> bool {
        matches!(self.phase(), ResolvePhase::Graph)
    }
}

/// A convenience alias for `Result<T, QuiverError>`.
pub type Result<T> = std::result::Result<T, QuiverError>;

// ---------------------------------------------------------------------------
// Provenance: where a specification entry originated
// ---------------------------------------------------------------------------

/// Records which specification document an entry came from.
///
/// Composition can fold many documents into one model; provenance keeps the
/// original location attached to each step and contract so later errors can
/// point at the right file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub document: String,
}

impl Provenance {
    pub fn new(document: impl Into<String>) -> Self {
        Self {
            document: document.into(),
        }
    }

    /// Provenance for entries built in memory rather than loaded from a file.
    pub fn inline() -> Self {
        Self {
            document: "<inline>".to_string(),
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.document)
    }
}
