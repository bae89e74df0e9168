//! Pipeline specification documents: parsing, import merging, and parameter
//! substitution.
//!
//! The flow is `parse_document` -> `merge` -> `substitute_parameters`,
//! producing a flat [`PipelineSpec`] ready for resolution.

pub mod document;
pub mod merge;
pub mod model;
pub mod params;

pub use document::{parse_document, yaml_to_json};
pub use merge::{merge, DocumentLoader, LoadedDocument};
pub use model::{Contract, Import, OverrideSource, PipelineSpec, StepDecl, Subset};
pub use params::substitute_parameters;
