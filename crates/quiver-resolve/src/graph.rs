//! Execution-graph construction and validation.
//!
//! Steps are joined through the data-product types they produce and consume.
//! The builder keeps the bipartite association (type -> producers/consumers)
//! in sorted containers so the resulting graph is independent of declaration
//! order. Construction fails on wiring errors: dependency cycles, consumed
//! types nobody produces, one type with several producers, and conflicting
//! dimension declarations. The graph itself carries no execution order;
//! [`ExecutionGraph::topo_order`] derives one on demand.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use quiver_types::{QuiverError, Result};
use serde_json::Value;

use crate::config::{DataProductType, ResolvedStep};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

/// An advisory finding about a structurally valid graph.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub step: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Info,
}

// ---------------------------------------------------------------------------
// Graph types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub label: String,
    pub class: String,
    pub config: Value,
    pub inputs: Vec<DataProductType>,
    pub outputs: Vec<DataProductType>,
}

/// A dependency edge: `to` consumes `product` produced by `from`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub product: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionGraph {
    nodes: BTreeMap<String, GraphNode>,
    /// Sorted by (from, to, product).
    edges: Vec<GraphEdge>,
    producers: BTreeMap<String, String>,
    consumers: BTreeMap<String, BTreeSet<String>>,
    dimensions: BTreeMap<String, Vec<String>>,
    external: BTreeSet<String>,
}

impl ExecutionGraph {
    /// Build and validate the graph for a set of resolved steps.
    pub fn build(resolved: &[ResolvedStep]) -> Result<Self> {
        let mut producers: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut consumers: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut dimensions: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut external: BTreeSet<String> = BTreeSet::new();
        let mut nodes = BTreeMap::new();

        for step in resolved {
            for product in &step.inputs {
                consumers
                    .entry(product.name.clone())
                    .or_default()
                    .insert(step.label.clone());
                check_dimensions(&mut dimensions, product)?;
                if product.external {
                    external.insert(product.name.clone());
                }
            }
            for product in &step.outputs {
                producers
                    .entry(product.name.clone())
                    .or_default()
                    .insert(step.label.clone());
                check_dimensions(&mut dimensions, product)?;
            }
            nodes.insert(
                step.label.clone(),
                GraphNode {
                    label: step.label.clone(),
                    class: step.class.clone(),
                    config: step.config.clone(),
                    inputs: step.inputs.clone(),
                    outputs: step.outputs.clone(),
                },
            );
        }

        // One producer per type; consumed types must be produced or external.
        let mut sole_producers = BTreeMap::new();
        for (product, labels) in &producers {
            if labels.len() > 1 {
                return Err(QuiverError::AmbiguousProducer {
                    product: product.clone(),
                    producers: labels.iter().cloned().collect(),
                });
            }
            if let Some(label) = labels.iter().next() {
                sole_producers.insert(product.clone(), label.clone());
            }
        }
        for (product, labels) in &consumers {
            if !sole_producers.contains_key(product) && !external.contains(product) {
                let step = labels
                    .iter()
                    .next()
                    .cloned()
                    .unwrap_or_default();
                return Err(QuiverError::DanglingInput {
                    step,
                    product: product.clone(),
                });
            }
        }

        let mut edges = Vec::new();
        for (product, consumed_by) in &consumers {
            if let Some(from) = sole_producers.get(product) {
                for to in consumed_by {
                    edges.push(GraphEdge {
                        from: from.clone(),
                        to: to.clone(),
                        product: product.clone(),
                    });
                }
            }
        }
        edges.sort();
        edges.dedup();

        let graph = Self {
            nodes,
            edges,
            producers: sole_producers,
            consumers,
            dimensions,
            external,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    // --- Accessors ---

    pub fn node(&self, label: &str) -> Option<&GraphNode> {
        self.nodes.get(label)
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.values()
    }

    pub fn all_edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    pub fn outgoing_edges<'g>(&'g self, label: &'g str) -> impl Iterator<Item = &'g GraphEdge> {
        self.edges.iter().filter(move |e| e.from == label)
    }

    /// The step that produces a data-product type, if any selected step does.
    pub fn producer_of(&self, product: &str) -> Option<&str> {
        self.producers.get(product).map(String::as_str)
    }

    pub fn dimensions_of(&self, product: &str) -> Option<&[String]> {
        self.dimensions.get(product).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Data-product types the pipeline needs from outside: consumed here but
    /// produced by no selected step.
    pub fn pipeline_inputs(&self) -> BTreeSet<String> {
        self.consumers
            .keys()
            .filter(|product| !self.producers.contains_key(*product))
            .cloned()
            .collect()
    }

    /// Data-product types produced here and consumed by no selected step.
    pub fn pipeline_outputs(&self) -> BTreeSet<String> {
        self.producers
            .keys()
            .filter(|product| !self.consumers.contains_key(*product))
            .cloned()
            .collect()
    }

    /// A deterministic execution order: Kahn's algorithm with a sorted ready
    /// set, so ties break lexicographically. The graph is acyclic by
    /// construction.
    pub fn topo_order(&self) -> Vec<String> {
        let mut indegree: BTreeMap<&str, usize> =
            self.nodes.keys().map(|l| (l.as_str(), 0)).collect();
        let mut successors: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for edge in &self.edges {
            if successors
                .entry(edge.from.as_str())
                .or_default()
                .insert(edge.to.as_str())
            {
                *indegree.entry(edge.to.as_str()).or_default() += 1;
            }
        }

        let mut ready: BTreeSet<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(l, _)| *l)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(label) = ready.iter().next().copied() {
            ready.remove(label);
            order.push(label.to_string());
            if let Some(next) = successors.get(label) {
                for succ in next {
                    let degree = indegree.entry(succ).or_default();
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert(succ);
                    }
                }
            }
        }
        order
    }

    /// Restrict the graph to the given labels, keeping induced edges. The
    /// view recomputes its own boundary; products produced outside the
    /// selection become pipeline inputs of the view.
    pub fn subgraph(&self, labels: &BTreeSet<String>) -> Self {
        let nodes: BTreeMap<String, GraphNode> = self
            .nodes
            .iter()
            .filter(|(label, _)| labels.contains(*label))
            .map(|(label, node)| (label.clone(), node.clone()))
            .collect();
        let edges: Vec<GraphEdge> = self
            .edges
            .iter()
            .filter(|e| labels.contains(&e.from) && labels.contains(&e.to))
            .cloned()
            .collect();
        let producers: BTreeMap<String, String> = self
            .producers
            .iter()
            .filter(|(_, label)| labels.contains(*label))
            .map(|(product, label)| (product.clone(), label.clone()))
            .collect();
        let mut consumers: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (product, consumed_by) in &self.consumers {
            let kept: BTreeSet<String> = consumed_by.intersection(labels).cloned().collect();
            if !kept.is_empty() {
                consumers.insert(product.clone(), kept);
            }
        }
        let referenced: BTreeSet<&String> = producers.keys().chain(consumers.keys()).collect();
        let dimensions = self
            .dimensions
            .iter()
            .filter(|(product, _)| referenced.contains(product))
            .map(|(product, dims)| (product.clone(), dims.clone()))
            .collect();
        let external = self
            .external
            .iter()
            .filter(|product| referenced.contains(product))
            .cloned()
            .collect();
        Self {
            nodes,
            edges,
            producers,
            consumers,
            dimensions,
            external,
        }
    }

    /// Advisory findings; never fatal.
    pub fn lint(&self) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        if self.nodes.len() < 2 {
            return diagnostics;
        }
        let mut connected: BTreeSet<&str> = BTreeSet::new();
        for edge in &self.edges {
            connected.insert(edge.from.as_str());
            connected.insert(edge.to.as_str());
        }
        for label in self.nodes.keys() {
            if !connected.contains(label.as_str()) {
                diagnostics.push(Diagnostic {
                    rule: "isolated_step".to_string(),
                    severity: Severity::Warning,
                    message: format!(
                        "step '{label}' shares no data products with any other step"
                    ),
                    step: Some(label.clone()),
                });
            }
        }
        diagnostics
    }

    // --- Validation ---

    /// Iterative DFS coloring. On a back edge, reports the cycle's steps and
    /// the data-product type that closes it.
    fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut successors: BTreeMap<&str, Vec<&GraphEdge>> = BTreeMap::new();
        for edge in &self.edges {
            successors.entry(edge.from.as_str()).or_default().push(edge);
        }

        let mut color: BTreeMap<&str, Color> =
            self.nodes.keys().map(|l| (l.as_str(), Color::White)).collect();

        for start in self.nodes.keys() {
            if color[start.as_str()] != Color::White {
                continue;
            }
            // Stack of (node, next successor index); path mirrors the stack.
            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            color.insert(start.as_str(), Color::Gray);
            while let Some(frame) = stack.last_mut() {
                let label = frame.0;
                let next = successors.get(label).and_then(|s| s.get(frame.1)).copied();
                frame.1 += 1;
                match next {
                    None => {
                        color.insert(label, Color::Black);
                        stack.pop();
                    }
                    Some(edge) => match color[edge.to.as_str()] {
                        Color::Black => {}
                        Color::White => {
                            color.insert(edge.to.as_str(), Color::Gray);
                            stack.push((edge.to.as_str(), 0));
                        }
                        Color::Gray => {
                            let mut steps: Vec<String> = stack
                                .iter()
                                .map(|(l, _)| l.to_string())
                                .skip_while(|l| l != &edge.to)
                                .collect();
                            steps.push(edge.to.clone());
                            return Err(QuiverError::GraphCycle {
                                steps,
                                product: edge.product.clone(),
                            });
                        }
                    },
                }
            }
        }
        Ok(())
    }
}

fn check_dimensions(
    dimensions: &mut BTreeMap<String, Vec<String>>,
    product: &DataProductType,
) -> Result<()> {
    match dimensions.get(&product.name) {
        None => {
            dimensions.insert(product.name.clone(), product.dimensions.clone());
            Ok(())
        }
        Some(declared) if *declared == product.dimensions => Ok(()),
        Some(declared) => Err(QuiverError::ProductDimensionMismatch {
            product: product.name.clone(),
            declared: declared.join(", "),
            conflicting: product.dimensions.join(", "),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn product(name: &str) -> DataProductType {
        DataProductType {
            name: name.to_string(),
            dimensions: vec!["visit".to_string()],
            external: false,
        }
    }

    fn external(name: &str) -> DataProductType {
        DataProductType {
            external: true,
            ..product(name)
        }
    }

    fn step(label: &str, inputs: Vec<DataProductType>, outputs: Vec<DataProductType>) -> ResolvedStep {
        ResolvedStep {
            label: label.to_string(),
            class: format!("pkg.{label}"),
            config: json!({}),
            inputs,
            outputs,
        }
    }

    fn chain() -> Vec<ResolvedStep> {
        vec![
            step("isr", vec![external("raw")], vec![product("postISRCCD")]),
            step(
                "characterize",
                vec![product("postISRCCD")],
                vec![product("icExp")],
            ),
            step("calibrate", vec![product("icExp")], vec![product("calexp")]),
        ]
    }

    #[test]
    fn linear_chain_builds_expected_edges() {
        let graph = ExecutionGraph::build(&chain()).unwrap();
        assert_eq!(graph.len(), 3);
        assert_eq!(
            graph.all_edges(),
            &[
                GraphEdge {
                    from: "characterize".into(),
                    to: "calibrate".into(),
                    product: "icExp".into()
                },
                GraphEdge {
                    from: "isr".into(),
                    to: "characterize".into(),
                    product: "postISRCCD".into()
                },
            ]
        );
        assert_eq!(graph.producer_of("calexp"), Some("calibrate"));
    }

    #[test]
    fn build_is_declaration_order_independent() {
        let forward = ExecutionGraph::build(&chain()).unwrap();
        let mut shuffled = chain();
        shuffled.reverse();
        let backward = ExecutionGraph::build(&shuffled).unwrap();
        assert_eq!(forward.all_edges(), backward.all_edges());
        assert_eq!(forward.topo_order(), backward.topo_order());
    }

    #[test]
    fn topo_order_respects_dependencies() {
        let graph = ExecutionGraph::build(&chain()).unwrap();
        assert_eq!(graph.topo_order(), vec!["isr", "characterize", "calibrate"]);
    }

    #[test]
    fn boundary_products_are_categorized() {
        let graph = ExecutionGraph::build(&chain()).unwrap();
        assert_eq!(
            graph.pipeline_inputs().into_iter().collect::<Vec<_>>(),
            vec!["raw"]
        );
        assert_eq!(
            graph.pipeline_outputs().into_iter().collect::<Vec<_>>(),
            vec!["calexp"]
        );
    }

    #[test]
    fn dangling_input_is_error() {
        let steps = vec![step("lone", vec![product("unproduced")], vec![])];
        let err = ExecutionGraph::build(&steps).unwrap_err();
        let QuiverError::DanglingInput { step, product } = err else {
            panic!("expected dangling input, got {err}");
        };
        assert_eq!(step, "lone");
        assert_eq!(product, "unproduced");
    }

    #[test]
    fn external_input_needs_no_producer() {
        let steps = vec![step("isr", vec![external("raw")], vec![product("out")])];
        ExecutionGraph::build(&steps).unwrap();
    }

    #[test]
    fn ambiguous_producer_is_error() {
        let steps = vec![
            step("a", vec![], vec![product("src_table")]),
            step("b", vec![], vec![product("src_table")]),
        ];
        let err = ExecutionGraph::build(&steps).unwrap_err();
        let QuiverError::AmbiguousProducer { product, producers } = err else {
            panic!("expected ambiguous producer, got {err}");
        };
        assert_eq!(product, "src_table");
        assert_eq!(producers, vec!["a", "b"]);
    }

    #[test]
    fn self_loop_is_cycle() {
        let steps = vec![step("a", vec![product("x")], vec![product("x")])];
        let err = ExecutionGraph::build(&steps).unwrap_err();
        let QuiverError::GraphCycle { steps, product } = err else {
            panic!("expected cycle, got {err}");
        };
        assert_eq!(steps, vec!["a", "a"]);
        assert_eq!(product, "x");
    }

    #[test]
    fn two_step_cycle_is_detected() {
        let steps = vec![
            step("a", vec![product("y")], vec![product("x")]),
            step("b", vec![product("x")], vec![product("y")]),
        ];
        let err = ExecutionGraph::build(&steps).unwrap_err();
        assert!(matches!(err, QuiverError::GraphCycle { .. }));
    }

    #[test]
    fn three_step_cycle_names_participants() {
        let steps = vec![
            step("a", vec![product("z")], vec![product("x")]),
            step("b", vec![product("x")], vec![product("y")]),
            step("c", vec![product("y")], vec![product("z")]),
        ];
        let err = ExecutionGraph::build(&steps).unwrap_err();
        let QuiverError::GraphCycle { steps, .. } = err else {
            panic!("expected cycle, got {err}");
        };
        assert_eq!(steps.len(), 4);
        assert_eq!(steps.first(), steps.last());
    }

    #[test]
    fn dimension_mismatch_is_error() {
        let steps = vec![
            step("a", vec![], vec![product("x")]),
            step(
                "b",
                vec![DataProductType {
                    name: "x".to_string(),
                    dimensions: vec!["tract".to_string()],
                    external: false,
                }],
                vec![],
            ),
        ];
        let err = ExecutionGraph::build(&steps).unwrap_err();
        assert!(matches!(err, QuiverError::ProductDimensionMismatch { .. }));
    }

    #[test]
    fn subgraph_keeps_induced_edges_and_reports_boundary() {
        let graph = ExecutionGraph::build(&chain()).unwrap();
        let labels: BTreeSet<String> =
            ["characterize", "calibrate"].iter().map(|s| s.to_string()).collect();
        let view = graph.subgraph(&labels);
        assert_eq!(view.len(), 2);
        assert_eq!(view.all_edges().len(), 1);
        assert!(view.pipeline_inputs().contains("postISRCCD"));
        assert_eq!(view.topo_order(), vec!["characterize", "calibrate"]);
    }

    #[test]
    fn isolated_step_gets_warning() {
        let steps = vec![
            step("isr", vec![external("raw")], vec![product("postISRCCD")]),
            step(
                "characterize",
                vec![product("postISRCCD")],
                vec![product("icExp")],
            ),
            step("loner", vec![external("refcat")], vec![product("matches")]),
        ];
        let graph = ExecutionGraph::build(&steps).unwrap();
        let diagnostics = graph.lint();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].step.as_deref(), Some("loner"));
        assert_eq!(diagnostics[0].severity, Severity::Warning);
    }

    #[test]
    fn single_step_pipeline_is_not_flagged() {
        let steps = vec![step("only", vec![external("raw")], vec![product("out")])];
        let graph = ExecutionGraph::build(&steps).unwrap();
        assert!(graph.lint().is_empty());
    }
}
