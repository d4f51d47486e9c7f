use thiserror::Error;

use crate::kernel::graph::KernelGraph;

/// Errors surfaced by graph construction, compilation and kernel execution.
///
/// Verification outcomes ([`crate::verify::Verification`]) are deliberately *not*
/// part of this taxonomy. A rejected rewrite candidate is normal control flow
/// inside the search engine, not an error.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Input shapes are incompatible with the operator's shape-inference rule.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    /// A referenced tensor is not a live output of any node in the graph.
    #[error("input tensor not found: {0}")]
    InputNotFound(String),
    /// A threadblock mapping has non-positive extents, an out-of-range
    /// reduction axis, or overflows shared memory.
    #[error("invalid threadblock mapping: {0}")]
    InvalidMapping(String),
    /// The graph was frozen (handed to the verifier or compiler) and can no
    /// longer accept new operators.
    #[error("graph is frozen, no operators can be appended")]
    FrozenGraph,
    /// Lowering to device code failed. Bypass mode downgrades this to a
    /// degraded-optimization retry with a recorded warning.
    #[error("compile error: {0}")]
    Compile(String),
    /// A persistent kernel was run after `release()`.
    #[error("persistent kernel used after release")]
    UseAfterRelease,
}

/// The search budget ran out without any candidate improving on the input
/// graph. Carries the best-known graph (possibly just the original) so the
/// caller can still compile something.
#[derive(Debug)]
pub struct SearchExhausted {
    pub best: KernelGraph,
    pub candidates_explored: usize,
}

impl std::fmt::Display for SearchExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "search exhausted after {} candidates without improvement",
            self.candidates_explored
        )
    }
}

impl std::error::Error for SearchExhausted {}
