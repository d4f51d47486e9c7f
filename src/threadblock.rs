//! Threadblock-level execution mapping.
//!
//! A [`ThreadblockGraph`] bridges a logical kernel-graph operator and a
//! concrete schedule: how the computation is partitioned across the device's
//! grid/block hierarchy and how a reduction or batch dimension is streamed
//! through a forloop. The same node may admit many mappings; they are distinct
//! performance candidates with identical logical semantics.

use crate::{
    error::GraphError,
    kernel::graph::{KernelGraph, NodeIndex},
    shape::Dim3,
    tensor::TensorDesc,
};

/// Shared memory available to one threadblock. Ampere-class default; a tile
/// set that does not fit is rejected at attach time.
pub const MAX_SMEM_SIZE: usize = 96 * 1024;

/// Execution mapping for one kernel-graph node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThreadblockGraph {
    pub grid_dim: Dim3,
    pub block_dim: Dim3,
    /// Iteration count for streamed/pipelined execution across a reduction or
    /// batch dimension. Always >= 1.
    pub forloop_range: usize,
    /// Which logical axis is reduced across forloop iterations, if any.
    pub reduction_dimx: Option<usize>,
}

impl ThreadblockGraph {
    /// Build a mapping, validating extents before it can ever be attached.
    pub fn new(
        grid_dim: impl Into<Dim3>,
        block_dim: impl Into<Dim3>,
        forloop_range: usize,
        reduction_dimx: Option<usize>,
    ) -> Result<Self, GraphError> {
        let grid_dim = grid_dim.into();
        let block_dim = block_dim.into();
        if !grid_dim.is_positive() || !block_dim.is_positive() {
            return Err(GraphError::InvalidMapping(format!(
                "grid/block extents must be positive, got grid {grid_dim:?} block {block_dim:?}"
            )));
        }
        if forloop_range == 0 {
            return Err(GraphError::InvalidMapping(
                "forloop range must be >= 1".to_string(),
            ));
        }
        Ok(Self {
            grid_dim,
            block_dim,
            forloop_range,
            reduction_dimx,
        })
    }

    /// Per-threadblock shared memory footprint for the given node: one output
    /// tile plus one per-iteration input tile per operand.
    pub fn smem_usage(&self, inputs: &[&TensorDesc], output: &TensorDesc) -> usize {
        let blocks = self.grid_dim.volume();
        let out_tile = output.size_in_bytes().div_ceil(blocks);
        let in_tiles: usize = inputs
            .iter()
            .map(|i| i.size_in_bytes().div_ceil(blocks * self.forloop_range))
            .sum();
        out_tile + in_tiles
    }
}

impl KernelGraph {
    /// Attach an execution mapping to a node. Fails with `InvalidMapping` when
    /// the reduction axis is absent from the node's output shape or the tile
    /// set overflows shared memory. The mapping only affects performance,
    /// never the logical semantics, so re-attaching a different mapping needs
    /// no re-verification. Freeze still covers mappings: a frozen graph
    /// rejects them like any other mutation, and the search retiles unfrozen
    /// copies.
    pub fn attach_schedule(
        &mut self,
        node: NodeIndex,
        schedule: ThreadblockGraph,
    ) -> Result<(), GraphError> {
        if self.is_frozen() {
            return Err(GraphError::FrozenGraph);
        }
        let Some(weight) = self.graph.node_weight(node) else {
            return Err(GraphError::InputNotFound(format!("no node {node:?}")));
        };
        let output = weight.outputs[0].clone();
        if let Some(axis) = schedule.reduction_dimx {
            if axis >= output.shape.rank() {
                return Err(GraphError::InvalidMapping(format!(
                    "reduction_dimx {axis} out of range for output shape {}",
                    output.shape
                )));
            }
        }
        let input_descs: Vec<TensorDesc> = weight
            .inputs
            .iter()
            .map(|id| self.tensor_desc(*id).map(Clone::clone))
            .collect::<Result<_, _>>()?;
        let input_refs: Vec<&TensorDesc> = input_descs.iter().collect();
        let smem = schedule.smem_usage(&input_refs, &output);
        if smem > MAX_SMEM_SIZE {
            return Err(GraphError::InvalidMapping(format!(
                "schedule needs {smem} bytes of shared memory, max is {MAX_SMEM_SIZE}"
            )));
        }
        self.graph[node].schedule = Some(schedule);
        Ok(())
    }

    /// Fallback mapping used by the compiler for nodes the search never
    /// retiled: 1-d grid over output elements, 128-thread blocks, no
    /// forloop streaming.
    pub fn default_schedule(&self, node: NodeIndex) -> ThreadblockGraph {
        let out_elems = self.graph[node].outputs[0].shape.n_elements();
        ThreadblockGraph {
            grid_dim: Dim3::new(out_elems.div_ceil(128).max(1), 1, 1),
            block_dim: Dim3::new(128, 1, 1),
            forloop_range: 1,
            reduction_dimx: None,
        }
    }
}
