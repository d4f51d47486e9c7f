//! Named benchmark graphs for search evaluation.
//!
//! The registry supplies reference programs by name; each lookup constructs a
//! fresh graph so callers can freeze, rewrite or compile it independently.

use crate::{
    error::GraphError,
    kernel::{graph::KernelGraph, op::ReduceOp},
    shape::DType,
};

pub const DATASET_NAMES: &[&str] = &["gated_mlp", "rms_norm", "group_query_attention", "lora"];

/// Look up a benchmark graph by name.
pub fn lookup(name: &str) -> Option<KernelGraph> {
    let build = match name {
        "gated_mlp" => gated_mlp,
        "rms_norm" => rms_norm,
        "group_query_attention" => group_query_attention,
        "lora" => lora,
        _ => return None,
    };
    // Registry graphs are built from validated literals.
    Some(build().expect("dataset graph must construct"))
}

/// x -> silu(x W_gate) * (x W_up), the llama feed-forward gate.
fn gated_mlp() -> Result<KernelGraph, GraphError> {
    let mut g = KernelGraph::new();
    let x = g.input([16, 4096], DType::F32)?;
    let w_gate = g.input([4096, 4096], DType::F32)?;
    let w_up = g.input([4096, 4096], DType::F32)?;
    let gate = g.matmul(&x, &w_gate)?;
    let gate = g.silu(&gate)?;
    let up = g.matmul(&x, &w_up)?;
    let out = g.mul(&gate, &up)?;
    g.mark_output(&out)?;
    Ok(g)
}

/// x / sqrt(mean(x^2)), folded to a per-row scale.
fn rms_norm() -> Result<KernelGraph, GraphError> {
    let mut g = KernelGraph::new();
    let x = g.input([16, 4096], DType::F32)?;
    let sq = g.square(&x)?;
    let sum = g.reduction(&sq, ReduceOp::Sum, 1)?;
    let mean = g.mul_scalar(&sum, 1.0 / 4096.0)?;
    let rms = g.sqrt(&mean)?;
    g.mark_output(&x)?;
    g.mark_output(&rms)?;
    Ok(g)
}

/// One head group of attention: softmax-free QK^T score path with a max
/// normalizer, then the value matmul.
fn group_query_attention() -> Result<KernelGraph, GraphError> {
    let mut g = KernelGraph::new();
    let q = g.input([2, 64, 128], DType::F32)?;
    let k_t = g.input([2, 128, 512], DType::F32)?;
    let v = g.input([2, 512, 128], DType::F32)?;
    let scores = g.matmul(&q, &k_t)?;
    let scaled = g.mul_scalar(&scores, 1.0 / 11.313_708)?;
    let peak = g.reduction(&scaled, ReduceOp::Max, 2)?;
    let weights = g.exp(&scaled)?;
    let out = g.matmul(&weights, &v)?;
    g.mark_output(&out)?;
    g.mark_output(&peak)?;
    Ok(g)
}

/// y = x W + x A B, the low-rank adapter pattern.
fn lora() -> Result<KernelGraph, GraphError> {
    let mut g = KernelGraph::new();
    let x = g.input([16, 4096], DType::F32)?;
    let w = g.input([4096, 4096], DType::F32)?;
    let a = g.input([4096, 16], DType::F32)?;
    let b = g.input([16, 4096], DType::F32)?;
    let base = g.matmul(&x, &w)?;
    let down = g.matmul(&x, &a)?;
    let up = g.matmul(&down, &b)?;
    let out = g.add(&base, &up)?;
    g.mark_output(&out)?;
    Ok(g)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_names_resolve() {
        for name in DATASET_NAMES {
            let g = lookup(name).unwrap();
            assert!(g.is_acyclic());
            assert!(!g.outputs.is_empty());
            assert!(!g.is_frozen());
        }
        assert!(lookup("unknown_benchmark").is_none());
    }

    #[test]
    fn test_lookups_are_independent() {
        let mut first = lookup("gated_mlp").unwrap();
        first.freeze();
        let second = lookup("gated_mlp").unwrap();
        assert!(!second.is_frozen());
    }
}
