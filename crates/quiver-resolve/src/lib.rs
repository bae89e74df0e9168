//! Resolution of pipeline specifications into validated execution graphs.
//!
//! The entry point is [`Resolver`]: give it a [`SchemaRegistry`] and a merged
//! [`PipelineSpec`](quiver_spec::PipelineSpec), get back a [`Resolution`]
//! carrying the execution graph, validated subsets, and per-step resolved
//! configurations. The submodules can also be used piecemeal.

pub mod config;
pub mod contracts;
pub mod graph;
pub mod registry;
pub mod resolver;
pub mod subsets;

pub use config::{ConfigResolver, DataProductType, ResolvedStep};
pub use contracts::evaluate_contracts;
pub use graph::{Diagnostic, ExecutionGraph, GraphEdge, GraphNode, Severity};
pub use registry::{
    ConnectionTemplate, FieldSpec, FieldType, FileRegistry, MemoryRegistry, SchemaRegistry,
    StepSchema,
};
pub use resolver::{Resolution, ResolveOptions, Resolver};
pub use subsets::validate_subsets;
