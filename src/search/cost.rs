//! Static cost model used to gate candidates before verification is spent on
//! them.
//!
//! The estimate is expressed in bytes of memory traffic: every non-input node
//! contributes its input and output tensor bytes, a fixed launch-overhead
//! equivalent, and an occupancy penalty when its threadblock mapping runs
//! fewer than [`FULL_OCCUPANCY_THREADS`] threads per block. Fusing two
//! elementwise nodes therefore always helps (the intermediate is never
//! materialized and one launch disappears), while retiling helps exactly when
//! it lifts an under-occupied mapping.

use crate::kernel::{graph::KernelGraph, op::KernelOp};

/// Fixed per-launch cost, as bytes of equivalent memory traffic.
pub const LAUNCH_OVERHEAD_BYTES: f64 = 65536.0;

/// Blocks below this thread count are treated as under-occupied.
pub const FULL_OCCUPANCY_THREADS: usize = 128;

#[derive(Debug, Clone, Copy)]
pub struct CostModel {
    pub launch_overhead_bytes: f64,
    /// Multiplier applied to under-occupied launches.
    pub occupancy_penalty: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            launch_overhead_bytes: LAUNCH_OVERHEAD_BYTES,
            occupancy_penalty: 1.25,
        }
    }
}

impl CostModel {
    /// Estimated execution cost of the whole graph, lower is better.
    pub fn cost(&self, graph: &KernelGraph) -> f64 {
        let mut total = 0.0;
        for node in graph.node_indices() {
            let weight = &graph.graph[node];
            if matches!(weight.op, KernelOp::Input) {
                continue;
            }
            let in_bytes: usize = weight
                .inputs
                .iter()
                .map(|id| graph.tensor_desc(*id).unwrap().size_in_bytes())
                .sum();
            let out_bytes: usize = weight.outputs.iter().map(|o| o.size_in_bytes()).sum();
            let mut node_cost = (in_bytes + out_bytes) as f64 + self.launch_overhead_bytes;
            let schedule = weight
                .schedule
                .clone()
                .unwrap_or_else(|| graph.default_schedule(node));
            if schedule.block_dim.volume() < FULL_OCCUPANCY_THREADS {
                node_cost *= self.occupancy_penalty;
            }
            total += node_cost;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{shape::DType, threadblock::ThreadblockGraph};

    #[test]
    fn test_under_occupied_mapping_costs_more() {
        let build = |block: usize| {
            let mut g = KernelGraph::new();
            let a = g.input([256, 256], DType::F32).unwrap();
            let e = g.exp(&a).unwrap();
            g.mark_output(&e).unwrap();
            let tb = ThreadblockGraph::new((512, 1, 1), (block, 1, 1), 1, None).unwrap();
            g.attach_schedule(e.id.node, tb).unwrap();
            g
        };
        let model = CostModel::default();
        assert!(model.cost(&build(32)) > model.cost(&build(128)));
    }

    #[test]
    fn test_fewer_launches_cost_less() {
        let mut chained = KernelGraph::new();
        let a = chained.input([64, 64], DType::F32).unwrap();
        let b = chained.exp(&a).unwrap();
        let c = chained.relu(&b).unwrap();
        chained.mark_output(&c).unwrap();

        let mut single = KernelGraph::new();
        let a = single.input([64, 64], DType::F32).unwrap();
        let b = single.exp(&a).unwrap();
        single.mark_output(&b).unwrap();

        let model = CostModel::default();
        assert!(model.cost(&single) < model.cost(&chained));
    }
}
