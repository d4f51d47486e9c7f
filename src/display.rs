//! Debug rendering of kernel graphs.

use petgraph::stable_graph::StableGraph;
use regex::Regex;

use crate::kernel::graph::{KernelGraph, NodeIndex};

/// Render the graph as graphviz dot, one label per node with its operator
/// name and output shape.
pub fn to_dot(graph: &KernelGraph) -> String {
    let mut g: StableGraph<String, u8> = StableGraph::default();
    let mut ids = rustc_hash::FxHashMap::default();
    for node in graph.node_indices() {
        let weight = &graph.graph[node];
        let label = format!("{} {}", weight.op.name(), weight.outputs[0].shape);
        ids.insert(node, g.add_node(label));
    }
    for edge in graph.edge_indices() {
        let (a, b) = graph.edge_endpoints(edge).unwrap();
        g.add_edge(ids[&a], ids[&b], 0);
    }
    let mut graph_string = petgraph::dot::Dot::with_config(
        &g,
        &[petgraph::dot::Config::EdgeIndexLabel],
    )
    .to_string();
    let re = Regex::new(r#"label\s*=\s*"\d+""#).unwrap();
    graph_string = re.replace_all(&graph_string, "").to_string();
    graph_string
}

/// View a debug graph in the browser, with the given nodes highlighted.
pub fn display_graph(graph: &KernelGraph, mark_nodes: &[NodeIndex]) {
    let mut graph_string = to_dot(graph);
    for n in mark_nodes {
        graph_string = graph_string.replace(
            &format!("    {} [ label =", n.index()),
            &format!(
                "    {} [ style=\"filled\" fillcolor=\"yellow\" label =",
                n.index()
            ),
        );
    }

    let url = format!(
        "https://dreampuf.github.io/GraphvizOnline/#{}",
        urlencoding::encode(&graph_string)
    );
    if let Err(e) = webbrowser::open(&url) {
        panic!("Error displaying graph: {:?}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::DType;

    #[test]
    fn test_to_dot_contains_ops() {
        let mut g = KernelGraph::new();
        let a = g.input([4, 4], DType::F32).unwrap();
        let b = g.exp(&a).unwrap();
        g.mark_output(&b).unwrap();
        let dot = to_dot(&g);
        assert!(dot.contains("Exp"));
        assert!(dot.contains("Input"));
    }
}
