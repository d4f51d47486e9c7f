//! Rewrite operators explored by the search engine.
//!
//! A rewrite never mutates its source graph; applying one rebuilds a fresh
//! graph through the normal validated append path, so every candidate obeys
//! the same construction invariants as a hand-built graph.

use petgraph::Direction;
use rustc_hash::FxHashMap;

use crate::{
    error::GraphError,
    kernel::{
        graph::{KernelGraph, NodeIndex},
        op::KernelOp,
    },
    tensor::{TensorDesc, TensorId},
    threadblock::ThreadblockGraph,
};

/// A proposed transformation of a kernel graph. Transient: candidates exist
/// only during search and are discarded unless verified and selected.
#[derive(Debug, Clone, PartialEq)]
pub enum Rewrite {
    /// Merge a single-consumer elementwise-unary producer into its consumer,
    /// concatenating the two stage chains into one kernel.
    FuseElementwise { first: NodeIndex, second: NodeIndex },
    /// Swap the operands of a commutative binary operator.
    ReorderCommutative { node: NodeIndex },
    /// Replace a node's threadblock mapping. Affects performance only.
    Retile {
        node: NodeIndex,
        schedule: ThreadblockGraph,
    },
}

/// Enumerate every applicable rewrite of `graph`, in deterministic node-index
/// order (insertion order), fusion first, then reorders, then retilings.
pub fn enumerate(graph: &KernelGraph) -> Vec<Rewrite> {
    let mut rewrites = vec![];
    for node in graph.toposort() {
        let weight = &graph.graph[node];
        if let KernelOp::ElementUnary(_) = &weight.op {
            let producer = weight.inputs[0].node;
            let fusable = matches!(graph.graph[producer].op, KernelOp::ElementUnary(_))
                && graph
                    .graph
                    .edges_directed(producer, Direction::Outgoing)
                    .count()
                    == 1
                && !graph.outputs.iter().any(|o| o.node == producer);
            if fusable {
                rewrites.push(Rewrite::FuseElementwise {
                    first: producer,
                    second: node,
                });
            }
        }
    }
    for node in graph.toposort() {
        if let KernelOp::ElementBinary(op) = &graph.graph[node].op {
            if op.is_commutative() {
                rewrites.push(Rewrite::ReorderCommutative { node });
            }
        }
    }
    for node in graph.toposort() {
        let weight = &graph.graph[node];
        if matches!(weight.op, KernelOp::Input) {
            continue;
        }
        // Offer wider blocks for mappings the cost model penalizes.
        for threads in [128usize, 256] {
            let out_elems = weight.outputs[0].shape.n_elements();
            if let Ok(schedule) = ThreadblockGraph::new(
                (out_elems.div_ceil(threads).max(1), 1, 1),
                (threads, 1, 1),
                1,
                None,
            ) {
                if weight.schedule.as_ref() != Some(&schedule) {
                    rewrites.push(Rewrite::Retile { node, schedule });
                }
            }
        }
    }
    rewrites
}

/// Apply a rewrite, producing a new graph. The original is untouched.
pub fn apply(graph: &KernelGraph, rewrite: &Rewrite) -> Result<KernelGraph, GraphError> {
    match rewrite {
        Rewrite::Retile { node, schedule } => {
            // Candidates are mutable copies regardless of the source's freeze
            // state; rebuilds below produce unfrozen graphs too.
            let mut out = graph.clone();
            out.frozen = false;
            out.attach_schedule(*node, schedule.clone())?;
            Ok(out)
        }
        Rewrite::FuseElementwise { first, second } => rebuild(graph, |node, op, inputs| {
            if node == *first {
                return NodeAction::Skip;
            }
            if node == *second {
                let (KernelOp::ElementUnary(head), KernelOp::ElementUnary(tail)) =
                    (&graph.graph[*first].op, op)
                else {
                    unreachable!("fusion only targets elementwise unary chains");
                };
                let mut chain = head.clone();
                chain.extend(tail.iter().copied());
                return NodeAction::Replace(
                    KernelOp::ElementUnary(chain),
                    graph.graph[*first].inputs.clone(),
                );
            }
            NodeAction::Keep(op.clone(), inputs.to_vec())
        }),
        Rewrite::ReorderCommutative { node } => rebuild(graph, |n, op, inputs| {
            if n == *node {
                let mut swapped = inputs.to_vec();
                swapped.reverse();
                NodeAction::Replace(op.clone(), swapped)
            } else {
                NodeAction::Keep(op.clone(), inputs.to_vec())
            }
        }),
    }
}

enum NodeAction {
    Keep(KernelOp, Vec<TensorId>),
    Replace(KernelOp, Vec<TensorId>),
    Skip,
}

/// Re-run the whole construction of `graph` through the validated builder,
/// letting `visit` keep, replace or drop each non-input node. Tensor ids are
/// remapped as nodes land in the new arena. For a fused node the surviving
/// node keeps its threadblock mapping.
fn rebuild(
    graph: &KernelGraph,
    mut visit: impl FnMut(NodeIndex, &KernelOp, &[TensorId]) -> NodeAction,
) -> Result<KernelGraph, GraphError> {
    let mut out = KernelGraph::new();
    let mut map: FxHashMap<TensorId, TensorId> = FxHashMap::default();
    for node in graph.toposort() {
        let weight = &graph.graph[node];
        let old_id = TensorId::new(node, 0);
        if matches!(weight.op, KernelOp::Input) {
            let desc = &weight.outputs[0];
            let new = out.input(desc.shape.clone(), desc.dtype)?;
            map.insert(old_id, new.id);
            continue;
        }
        let (op, old_inputs) = match visit(node, &weight.op, &weight.inputs) {
            NodeAction::Skip => continue,
            NodeAction::Keep(op, inputs) | NodeAction::Replace(op, inputs) => (op, inputs),
        };
        let descs: Vec<TensorDesc> = old_inputs
            .iter()
            .map(|id| {
                map.get(id)
                    .ok_or_else(|| GraphError::InputNotFound(format!("{id:?}")))
                    .and_then(|new_id| out.tensor_desc(*new_id).map(Clone::clone))
            })
            .collect::<Result<_, _>>()?;
        let refs: Vec<&TensorDesc> = descs.iter().collect();
        let new = out.add_op(op, &refs)?;
        out.graph[new.id.node].schedule = weight.schedule.clone();
        map.insert(old_id, new.id);
    }
    for output in &graph.outputs {
        let new_id = map
            .get(output)
            .ok_or_else(|| GraphError::InputNotFound(format!("{output:?}")))?;
        let desc = out.tensor_desc(*new_id)?.clone();
        out.mark_output(&desc)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::DType;

    fn unary_chain_graph() -> KernelGraph {
        let mut g = KernelGraph::new();
        let a = g.input([32, 32], DType::F32).unwrap();
        let b = g.exp(&a).unwrap();
        let c = g.relu(&b).unwrap();
        g.mark_output(&c).unwrap();
        g
    }

    #[test]
    fn test_enumerate_finds_fusion() {
        let g = unary_chain_graph();
        let rewrites = enumerate(&g);
        assert!(rewrites
            .iter()
            .any(|r| matches!(r, Rewrite::FuseElementwise { .. })));
    }

    #[test]
    fn test_fusion_preserves_semantics() {
        let g = unary_chain_graph();
        let fusion = enumerate(&g)
            .into_iter()
            .find(|r| matches!(r, Rewrite::FuseElementwise { .. }))
            .unwrap();
        let fused = apply(&g, &fusion).unwrap();
        assert_eq!(fused.launch_count(), g.launch_count() - 1);

        let feeds = vec![vec![0.5f32; 32 * 32]];
        assert_eq!(g.execute(&feeds).unwrap(), fused.execute(&feeds).unwrap());
    }

    #[test]
    fn test_retile_candidate_of_frozen_graph_is_unfrozen() {
        let mut g = unary_chain_graph();
        g.freeze();
        let retile = enumerate(&g)
            .into_iter()
            .find(|r| matches!(r, Rewrite::Retile { .. }))
            .unwrap();
        let candidate = apply(&g, &retile).unwrap();
        assert!(!candidate.is_frozen());
        let Rewrite::Retile { node, schedule } = &retile else {
            unreachable!();
        };
        assert_eq!(candidate.graph[*node].schedule.as_ref(), Some(schedule));
        assert!(g.is_frozen());
    }

    #[test]
    fn test_reorder_keeps_original_untouched() {
        let mut g = KernelGraph::new();
        let a = g.input([8], DType::F32).unwrap();
        let b = g.input([8], DType::F32).unwrap();
        let c = g.add(&a, &b).unwrap();
        g.mark_output(&c).unwrap();
        let before = g.clone();
        let reorder = enumerate(&g)
            .into_iter()
            .find(|r| matches!(r, Rewrite::ReorderCommutative { .. }))
            .unwrap();
        let swapped = apply(&g, &reorder).unwrap();
        assert_eq!(g.graph[c.id.node].inputs, before.graph[c.id.node].inputs);
        assert_eq!(
            swapped.graph[swapped.outputs[0].node].inputs,
            vec![b.id, a.id]
        );
    }
}
