//! Resolution orchestration.
//!
//! Drives a merged document through parameter substitution, subset
//! validation and config resolution (concurrently, on scoped threads),
//! contract evaluation, and graph construction. The pass is atomic: callers
//! get a complete [`Resolution`] or an error, never a partial result.

use std::collections::{BTreeMap, BTreeSet};
use std::thread;

use quiver_expr::EvalLimits;
use quiver_spec::{substitute_parameters, PipelineSpec};
use quiver_types::Result;
use tracing::{info, warn};

use crate::config::{ConfigResolver, ResolvedStep};
use crate::contracts::evaluate_contracts;
use crate::graph::{Diagnostic, ExecutionGraph};
use crate::registry::SchemaRegistry;
use crate::subsets::validate_subsets;

/// Knobs for one resolution pass.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Budget applied to each contract and config-block expression.
    pub limits: EvalLimits,
}

/// The complete output of a successful resolution.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub graph: ExecutionGraph,
    pub subsets: BTreeMap<String, BTreeSet<String>>,
    pub resolved: Vec<ResolvedStep>,
    /// Advisory findings from graph lint; never fatal.
    pub diagnostics: Vec<Diagnostic>,
}

pub struct Resolver<R> {
    registry: R,
    options: ResolveOptions,
}

impl<R: SchemaRegistry + Sync> Resolver<R> {
    pub fn new(registry: R) -> Self {
        Self {
            registry,
            options: ResolveOptions::default(),
        }
    }

    pub fn with_options(registry: R, options: ResolveOptions) -> Self {
        Self { registry, options }
    }

    /// Resolve a merged document into an execution graph.
    pub fn resolve(&self, spec: &PipelineSpec) -> Result<Resolution> {
        let mut spec = spec.clone();
        substitute_parameters(&mut spec)?;

        // Subset validation is independent of the config chain; run it on a
        // scoped thread while configs resolve here.
        let (subsets, resolved) = thread::scope(|scope| {
            let subset_handle = scope.spawn(|| validate_subsets(&spec));
            let resolved = self.resolve_configs(&spec);
            let subsets = match subset_handle.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            };
            (subsets, resolved)
        });
        let subsets = subsets?;
        let resolved = resolved?;

        evaluate_contracts(&spec.contracts, &resolved, &self.options.limits)?;

        let graph = ExecutionGraph::build(&resolved)?;
        let diagnostics = graph.lint();
        for diagnostic in &diagnostics {
            warn!(rule = %diagnostic.rule, "{}", diagnostic.message);
        }
        info!(
            steps = resolved.len(),
            edges = graph.all_edges().len(),
            subsets = subsets.len(),
            "pipeline resolved"
        );

        Ok(Resolution {
            graph,
            subsets,
            resolved,
            diagnostics,
        })
    }

    fn resolve_configs(&self, spec: &PipelineSpec) -> Result<Vec<ResolvedStep>> {
        let mut resolver = ConfigResolver::new(&self.registry, self.options.limits);
        spec.steps()
            .map(|step| resolver.resolve_step(step))
            .collect()
    }
}
