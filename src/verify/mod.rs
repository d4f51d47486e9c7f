//! Two-phase equivalence verification: cheap probabilistic fingerprinting
//! prunes the overwhelming majority of invalid candidates before the formal
//! solver oracle is ever invoked.

pub mod fingerprint;
pub mod solver;

use std::time::Duration;

use crate::kernel::graph::KernelGraph;
use solver::{encode_graph, EquivalenceQuery, SolverOracle, SolverVerdict};

/// Outcome of an equivalence check. This is a result consumed by pattern
/// matching in the search engine, never an error propagated up the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Equivalent,
    NotEquivalent,
    /// The solver was inconclusive within its deadline. Rejected by the
    /// search engine unless bypass mode is enabled.
    Unknown,
}

/// Drives the two phases against a pluggable solver oracle.
pub struct Verifier<'a> {
    /// Random fingerprint trials before the formal phase.
    pub trials: usize,
    /// Base seed; per-trial seeds derive from it, keeping verification
    /// deterministic for a fixed configuration.
    pub seed: u64,
    /// Per-candidate deadline for the formal phase, so one slow solver call
    /// cannot starve the search budget.
    pub timeout: Duration,
    pub oracle: &'a dyn SolverOracle,
}

impl<'a> Verifier<'a> {
    pub fn new(oracle: &'a dyn SolverOracle) -> Self {
        Self {
            trials: 4,
            seed: 0x74656e73,
            timeout: Duration::from_millis(500),
            oracle,
        }
    }

    /// Check that `candidate` computes the same function as `original`.
    pub fn verify(&self, original: &KernelGraph, candidate: &KernelGraph) -> Verification {
        // Interface mismatch can never be equivalent.
        let (in_a, in_b) = (original.input_descs(), candidate.input_descs());
        if in_a.len() != in_b.len()
            || in_a
                .iter()
                .zip(&in_b)
                .any(|(a, b)| a.shape != b.shape || a.dtype != b.dtype)
        {
            return Verification::NotEquivalent;
        }
        let (out_a, out_b) = (original.output_descs(), candidate.output_descs());
        if out_a.len() != out_b.len()
            || out_a
                .iter()
                .zip(&out_b)
                .any(|(a, b)| a.shape != b.shape || a.dtype != b.dtype)
        {
            return Verification::NotEquivalent;
        }

        // Phase 1: random fingerprint trials. Any mismatch is a cheap,
        // high-confidence rejection.
        for trial in 0..self.trials {
            let feeds = fingerprint::sample_inputs(original, self.seed, trial);
            if original.fingerprint(&feeds) != candidate.fingerprint(&feeds) {
                return Verification::NotEquivalent;
            }
        }

        // Phase 2: ask the oracle whether a distinguishing input exists.
        let query = EquivalenceQuery {
            lhs_outputs: encode_graph(original),
            rhs_outputs: encode_graph(candidate),
        };
        match self.oracle.check_equivalence(&query, self.timeout) {
            SolverVerdict::Unsat => Verification::Equivalent,
            SolverVerdict::Sat(_) => Verification::NotEquivalent,
            SolverVerdict::Timeout => Verification::Unknown,
        }
    }
}
