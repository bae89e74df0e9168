//! CLI binary for resolving and inspecting Quiver pipeline specifications.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use quiver_resolve::{ExecutionGraph, FileRegistry, Resolution, Resolver, Severity};
use quiver_spec::{
    merge, parse_document, DocumentLoader, LoadedDocument, OverrideSource, PipelineSpec,
};
use quiver_types::{QuiverError, Result};

#[derive(Parser)]
#[command(name = "qvr", version, about = "Pipeline specification resolver")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Fully resolve a pipeline and report problems
    Validate {
        /// Path to the pipeline YAML file
        pipeline: PathBuf,

        /// Path to the schema registry YAML file
        #[arg(short, long)]
        registry: PathBuf,
    },

    /// Print the execution order or DOT rendering of the graph
    Graph {
        /// Path to the pipeline YAML file
        pipeline: PathBuf,

        /// Path to the schema registry YAML file
        #[arg(short, long)]
        registry: PathBuf,

        /// Restrict the graph to a named subset
        #[arg(short, long)]
        subset: Option<String>,

        /// Emit Graphviz DOT instead of a topological listing
        #[arg(long)]
        dot: bool,
    },

    /// Summarize the merged document without resolving schemas
    Info {
        /// Path to the pipeline YAML file
        pipeline: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Validate { pipeline, registry } => cmd_validate(&pipeline, &registry),
        Commands::Graph {
            pipeline,
            registry,
            subset,
            dot,
        } => cmd_graph(&pipeline, &registry, subset.as_deref(), dot),
        Commands::Info { pipeline } => cmd_info(&pipeline),
    }
}

// ---------------------------------------------------------------------------
// Document loading
// ---------------------------------------------------------------------------

/// Loads import locations from the filesystem, relative to the importing
/// document, with env-var placeholders expanded.
struct FsLoader;

impl DocumentLoader for FsLoader {
    fn load(&self, location: &str, importer: &str) -> Result<LoadedDocument> {
        let expanded = quiver_resolve::config::expand_env_vars(location);
        let path = resolve_location(&expanded, importer);
        let source = std::fs::read_to_string(&path).map_err(|err| QuiverError::Spec {
            location: importer.to_string(),
            message: format!("cannot load import '{}': {err}", path.display()),
        })?;
        Ok(LoadedDocument {
            source,
            name: path.to_string_lossy().into_owned(),
        })
    }
}

fn resolve_location(location: &str, importer: &str) -> PathBuf {
    let location = Path::new(location);
    if location.is_absolute() {
        return location.to_path_buf();
    }
    match Path::new(importer).parent() {
        Some(dir) => dir.join(location),
        None => location.to_path_buf(),
    }
}

fn load_merged(path: &Path) -> anyhow::Result<PipelineSpec> {
    let source = std::fs::read_to_string(path)?;
    let name = path.to_string_lossy().into_owned();
    let spec = parse_document(&source, &name)?;
    Ok(merge(spec, &name, &FsLoader)?)
}

fn resolve(pipeline: &Path, registry: &Path) -> anyhow::Result<Resolution> {
    let spec = load_merged(pipeline)?;
    let registry = FileRegistry::load(registry)?;
    Ok(Resolver::new(registry).resolve(&spec)?)
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn cmd_validate(pipeline: &Path, registry: &Path) -> anyhow::Result<()> {
    let resolution = match resolve(pipeline, registry) {
        Ok(resolution) => resolution,
        Err(err) => {
            eprintln!("ERROR: {err:#}");
            std::process::exit(1);
        }
    };
    for diagnostic in &resolution.diagnostics {
        let severity = match diagnostic.severity {
            Severity::Warning => "WARN",
            Severity::Info => "INFO",
        };
        println!("[{}] {}: {}", severity, diagnostic.rule, diagnostic.message);
    }
    println!(
        "Pipeline is valid: {} steps, {} edges",
        resolution.graph.len(),
        resolution.graph.all_edges().len()
    );
    Ok(())
}

fn cmd_graph(
    pipeline: &Path,
    registry: &Path,
    subset: Option<&str>,
    dot: bool,
) -> anyhow::Result<()> {
    let resolution = resolve(pipeline, registry)?;
    let graph = match subset {
        None => resolution.graph,
        Some(name) => {
            let labels = resolution.subsets.get(name).ok_or_else(|| {
                anyhow::anyhow!("pipeline defines no subset named '{name}'")
            })?;
            resolution.graph.subgraph(labels)
        }
    };
    if dot {
        print!("{}", render_dot(&graph));
    } else {
        for label in graph.topo_order() {
            let node = graph
                .node(&label)
                .ok_or_else(|| anyhow::anyhow!("missing node '{label}'"))?;
            println!("{}  ({})", label, node.class);
        }
    }
    Ok(())
}

fn cmd_info(pipeline: &Path) -> anyhow::Result<()> {
    let spec = load_merged(pipeline)?;

    println!("Description: {}", spec.description);
    println!("Steps: {}", spec.len());
    for step in spec.steps() {
        let overrides = step.overrides.len();
        if overrides == 0 {
            println!("  {}  ({})", step.label, step.class);
        } else {
            println!("  {}  ({}) [{overrides} override(s)]", step.label, step.class);
        }
    }
    if !spec.parameters.is_empty() {
        println!("Parameters:");
        for (name, value) in &spec.parameters {
            println!("  {name} = {value}");
        }
    }
    if !spec.contracts.is_empty() {
        println!("Contracts:");
        for contract in &spec.contracts {
            match &contract.message {
                Some(message) => println!("  {}  # {message}", contract.expression),
                None => println!("  {}", contract.expression),
            }
        }
    }
    if !spec.subsets.is_empty() {
        println!("Subsets:");
        for (name, subset) in &spec.subsets {
            println!("  {name}: {}", subset.labels.join(", "));
        }
    }
    let files: BTreeSet<&str> = spec
        .steps()
        .flat_map(|step| step.overrides.iter())
        .filter_map(|source| match source {
            OverrideSource::File(path) => Some(path.as_str()),
            _ => None,
        })
        .collect();
    if !files.is_empty() {
        println!("Override files:");
        for file in files {
            println!("  {file}");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// DOT rendering
// ---------------------------------------------------------------------------

fn render_dot(graph: &ExecutionGraph) -> String {
    let mut out = String::from("digraph pipeline {\n  rankdir=LR;\n");
    for node in graph.all_nodes() {
        out.push_str(&format!(
            "  \"{}\" [label=\"{}\\n{}\"];\n",
            node.label, node.label, node.class
        ));
    }
    for edge in graph.all_edges() {
        out.push_str(&format!(
            "  \"{}\" -> \"{}\" [label=\"{}\"];\n",
            edge.from, edge.to, edge.product
        ));
    }
    out.push_str("}\n");
    out
}
