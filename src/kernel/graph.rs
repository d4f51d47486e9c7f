use std::ops::{Deref, DerefMut};

use petgraph::{stable_graph::StableGraph, visit::EdgeRef, Direction};

use crate::{
    error::GraphError,
    kernel::op::{BinaryOp, KernelOp, ReduceOp, UnaryOp},
    shape::{DType, Shape},
    tensor::{TensorDesc, TensorId},
    threadblock::ThreadblockGraph,
};

pub use petgraph::stable_graph::NodeIndex;

pub type KernelDag = StableGraph<KernelNode, DataDep>;

/// A data dependency between two nodes: which output slot of the source feeds
/// which input position of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataDep {
    pub input_order: u8,
    pub output_slot: u8,
}

/// One operator in the kernel graph, with its consumed tensor ids, produced
/// tensor descriptors and (optionally) the threadblock-level execution mapping
/// chosen for it. The mapping's lifetime is bound to the node.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelNode {
    pub op: KernelOp,
    pub inputs: Vec<TensorId>,
    pub outputs: Vec<TensorDesc>,
    pub schedule: Option<ThreadblockGraph>,
}

/// The top-level unit of optimization: a DAG of tensor operators whose edges
/// are shared-tensor references.
///
/// Graphs are append-only. No node or edge is ever removed; rewriting always
/// produces a *new* graph, so the verifier can compare "before" and "after"
/// without aliasing concerns. Once handed to the verifier or compiler a graph
/// is frozen and further appends fail.
#[derive(Debug, Clone, Default)]
pub struct KernelGraph {
    pub graph: KernelDag,
    /// External inputs in insertion order.
    pub inputs: Vec<TensorId>,
    /// Marked outputs in mark order.
    pub outputs: Vec<TensorId>,
    pub(crate) frozen: bool,
}

impl KernelGraph {
    /// Create a new, empty kernel graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this graph has been handed off and is read-only.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Freeze the graph before handing it to the verifier or compiler.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Add an external input tensor.
    pub fn input(&mut self, shape: impl Into<Shape>, dtype: DType) -> Result<TensorDesc, GraphError> {
        if self.frozen {
            return Err(GraphError::FrozenGraph);
        }
        let shape = shape.into();
        shape.validate()?;
        let node = self.graph.add_node(KernelNode {
            op: KernelOp::Input,
            inputs: vec![],
            outputs: vec![],
            schedule: None,
        });
        let desc = TensorDesc::new(TensorId::new(node, 0), shape, dtype);
        self.graph[node].outputs.push(desc.clone());
        self.inputs.push(desc.id);
        Ok(desc)
    }

    /// Core append path: validate inputs, run shape inference, add the node
    /// and its data edges, hand back the fresh output handle.
    pub(crate) fn add_op(
        &mut self,
        op: KernelOp,
        srcs: &[&TensorDesc],
    ) -> Result<TensorDesc, GraphError> {
        if self.frozen {
            return Err(GraphError::FrozenGraph);
        }
        for src in srcs {
            self.check_live(src)?;
        }
        let (shape, dtype) = op.infer_shape(srcs)?;
        let node = self.graph.add_node(KernelNode {
            op,
            inputs: srcs.iter().map(|s| s.id).collect(),
            outputs: vec![],
            schedule: None,
        });
        for (order, src) in srcs.iter().enumerate() {
            self.graph.add_edge(
                src.id.node,
                node,
                DataDep {
                    input_order: order as u8,
                    output_slot: src.id.slot,
                },
            );
        }
        let desc = TensorDesc::new(TensorId::new(node, 0), shape, dtype);
        self.graph[node].outputs.push(desc.clone());
        Ok(desc)
    }

    /// A referenced tensor must be a live output of a node already present.
    fn check_live(&self, desc: &TensorDesc) -> Result<(), GraphError> {
        let Some(node) = self.graph.node_weight(desc.id.node) else {
            return Err(GraphError::InputNotFound(format!(
                "no node {:?} in graph",
                desc.id.node
            )));
        };
        let Some(stored) = node.outputs.get(desc.id.slot as usize) else {
            return Err(GraphError::InputNotFound(format!(
                "node {:?} has no output slot {}",
                desc.id.node, desc.id.slot
            )));
        };
        if stored.shape != desc.shape || stored.dtype != desc.dtype {
            return Err(GraphError::InputNotFound(format!(
                "stale tensor handle for node {:?}: expected {} {}, handle says {} {}",
                desc.id.node, stored.shape, stored.dtype, desc.shape, desc.dtype
            )));
        }
        Ok(())
    }

    // Operator-append calls. Each validates its shape rule at construction
    // time and appends in insertion order (the search tie-break).

    pub fn matmul(&mut self, a: &TensorDesc, b: &TensorDesc) -> Result<TensorDesc, GraphError> {
        self.add_op(KernelOp::Matmul, &[a, b])
    }

    pub fn exp(&mut self, a: &TensorDesc) -> Result<TensorDesc, GraphError> {
        self.add_op(KernelOp::ElementUnary(vec![UnaryOp::Exp]), &[a])
    }

    pub fn square(&mut self, a: &TensorDesc) -> Result<TensorDesc, GraphError> {
        self.add_op(KernelOp::ElementUnary(vec![UnaryOp::Square]), &[a])
    }

    pub fn sqrt(&mut self, a: &TensorDesc) -> Result<TensorDesc, GraphError> {
        self.add_op(KernelOp::ElementUnary(vec![UnaryOp::Sqrt]), &[a])
    }

    pub fn silu(&mut self, a: &TensorDesc) -> Result<TensorDesc, GraphError> {
        self.add_op(KernelOp::ElementUnary(vec![UnaryOp::Silu]), &[a])
    }

    pub fn gelu(&mut self, a: &TensorDesc) -> Result<TensorDesc, GraphError> {
        self.add_op(KernelOp::ElementUnary(vec![UnaryOp::Gelu]), &[a])
    }

    pub fn relu(&mut self, a: &TensorDesc) -> Result<TensorDesc, GraphError> {
        self.add_op(KernelOp::ElementUnary(vec![UnaryOp::Relu]), &[a])
    }

    pub fn mul_scalar(&mut self, a: &TensorDesc, scalar: f32) -> Result<TensorDesc, GraphError> {
        self.add_op(KernelOp::ElementUnary(vec![UnaryOp::MulScalar(scalar)]), &[a])
    }

    pub fn clamp(&mut self, a: &TensorDesc, min: f32, max: f32) -> Result<TensorDesc, GraphError> {
        self.add_op(KernelOp::ElementUnary(vec![UnaryOp::Clamp { min, max }]), &[a])
    }

    pub fn add(&mut self, a: &TensorDesc, b: &TensorDesc) -> Result<TensorDesc, GraphError> {
        self.add_op(KernelOp::ElementBinary(BinaryOp::Add), &[a, b])
    }

    pub fn mul(&mut self, a: &TensorDesc, b: &TensorDesc) -> Result<TensorDesc, GraphError> {
        self.add_op(KernelOp::ElementBinary(BinaryOp::Mul), &[a, b])
    }

    pub fn div(&mut self, a: &TensorDesc, b: &TensorDesc) -> Result<TensorDesc, GraphError> {
        self.add_op(KernelOp::ElementBinary(BinaryOp::Div), &[a, b])
    }

    pub fn reduction(
        &mut self,
        a: &TensorDesc,
        op: ReduceOp,
        axis: usize,
    ) -> Result<TensorDesc, GraphError> {
        self.add_op(KernelOp::Reduction(op, axis), &[a])
    }

    pub fn reshape(
        &mut self,
        a: &TensorDesc,
        new_shape: impl Into<Shape>,
    ) -> Result<TensorDesc, GraphError> {
        self.add_op(KernelOp::Reshape(new_shape.into()), &[a])
    }

    pub fn concat(
        &mut self,
        a: &TensorDesc,
        b: &TensorDesc,
        axis: usize,
    ) -> Result<TensorDesc, GraphError> {
        self.add_op(KernelOp::Concat(axis), &[a, b])
    }

    /// Mark a tensor as a graph output.
    pub fn mark_output(&mut self, t: &TensorDesc) -> Result<(), GraphError> {
        self.check_live(t)?;
        if !self.outputs.contains(&t.id) {
            self.outputs.push(t.id);
        }
        Ok(())
    }

    /// Fetch the stored descriptor for a tensor id.
    pub fn tensor_desc(&self, id: TensorId) -> Result<&TensorDesc, GraphError> {
        self.graph
            .node_weight(id.node)
            .and_then(|n| n.outputs.get(id.slot as usize))
            .ok_or_else(|| GraphError::InputNotFound(format!("{id:?}")))
    }

    /// Deterministic topological order: Kahn's algorithm with the ready set
    /// kept sorted by node index, so two isomorphic graphs built in the same
    /// order always linearize identically.
    pub fn toposort(&self) -> Vec<NodeIndex> {
        let mut in_deg: rustc_hash::FxHashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| {
                (
                    n,
                    self.graph
                        .edges_directed(n, Direction::Incoming)
                        .map(|e| e.source())
                        .collect::<rustc_hash::FxHashSet<_>>()
                        .len(),
                )
            })
            .collect();
        let mut ready: Vec<NodeIndex> = in_deg
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        ready.sort();
        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(&node) = ready.first() {
            ready.remove(0);
            order.push(node);
            let mut unlocked = vec![];
            for succ in self
                .graph
                .neighbors_directed(node, Direction::Outgoing)
                .collect::<rustc_hash::FxHashSet<_>>()
            {
                let d = in_deg.get_mut(&succ).unwrap();
                *d -= 1;
                if *d == 0 {
                    unlocked.push(succ);
                }
            }
            unlocked.sort();
            for u in unlocked {
                let pos = ready.partition_point(|r| *r < u);
                ready.insert(pos, u);
            }
        }
        debug_assert_eq!(order.len(), self.graph.node_count());
        order
    }

    /// Number of kernel launches this graph lowers to (non-input nodes).
    pub fn launch_count(&self) -> usize {
        self.graph
            .node_weights()
            .filter(|n| !matches!(n.op, KernelOp::Input))
            .count()
    }

    pub fn is_acyclic(&self) -> bool {
        !petgraph::algo::is_cyclic_directed(&self.graph)
    }

    /// Input descriptors in insertion order.
    pub fn input_descs(&self) -> Vec<&TensorDesc> {
        self.inputs
            .iter()
            .map(|id| self.tensor_desc(*id).unwrap())
            .collect()
    }

    /// Output descriptors in mark order.
    pub fn output_descs(&self) -> Vec<&TensorDesc> {
        self.outputs
            .iter()
            .map(|id| self.tensor_desc(*id).unwrap())
            .collect()
    }
}

impl Deref for KernelGraph {
    type Target = KernelDag;
    fn deref(&self) -> &Self::Target {
        &self.graph
    }
}

impl DerefMut for KernelGraph {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.graph
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_freeze() {
        let mut g = KernelGraph::new();
        let a = g.input([128, 256], DType::F32).unwrap();
        let b = g.input([256, 64], DType::F32).unwrap();
        let c = g.matmul(&a, &b).unwrap();
        assert_eq!(c.shape, Shape::from([128, 64]));
        g.mark_output(&c).unwrap();
        assert!(g.is_acyclic());

        g.freeze();
        assert!(matches!(g.exp(&c), Err(GraphError::FrozenGraph)));
    }

    #[test]
    fn test_shape_mismatch_at_construction() {
        let mut g = KernelGraph::new();
        let a = g.input([128, 255], DType::F32).unwrap();
        let b = g.input([256, 64], DType::F32).unwrap();
        assert!(matches!(
            g.matmul(&a, &b),
            Err(GraphError::ShapeMismatch(_))
        ));
        // Failed append leaves no node behind the two inputs.
        assert_eq!(g.graph.node_count(), 2);
    }

    #[test]
    fn test_foreign_tensor_rejected() {
        let mut g = KernelGraph::new();
        let mut other = KernelGraph::new();
        let a = g.input([4, 4], DType::F32).unwrap();
        let foreign = other.input([64, 64], DType::F32).unwrap();
        assert!(matches!(
            g.add(&a, &foreign),
            Err(GraphError::InputNotFound(_))
        ));
    }

    #[test]
    fn test_toposort_deterministic() {
        let mut g = KernelGraph::new();
        let a = g.input([8, 8], DType::F32).unwrap();
        let x = g.exp(&a).unwrap();
        let y = g.relu(&a).unwrap();
        let z = g.add(&x, &y).unwrap();
        g.mark_output(&z).unwrap();
        assert_eq!(g.toposort(), g.clone().toposort());
    }
}
