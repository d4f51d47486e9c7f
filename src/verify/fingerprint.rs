//! Probabilistic equivalence testing over the finite field Z_p, p = 2^31 - 1.
//!
//! Both graphs are evaluated on the same randomly sampled residue assignments
//! and their outputs compared exactly. Field arithmetic is exact for the
//! algebraic operators (add, mul, div, matmul, sum-reduce), so any structural
//! rewrite that preserves those semantics fingerprints identically, while a
//! swapped operator (sum vs max, exp vs sqrt) mismatches with overwhelming
//! probability. Nonlinear unary stages are abstracted to distinct modular
//! power maps; the search engine never rewrites across nonlinear algebra, so
//! the abstraction is sound for every rewrite it proposes.

use rand::{rngs::StdRng, Rng, SeedableRng};
use rustc_hash::FxHashMap;

use crate::{
    kernel::{
        graph::KernelGraph,
        op::{BinaryOp, KernelOp, ReduceOp, UnaryOp},
    },
    tensor::TensorId,
};

/// The fingerprint field modulus (Mersenne prime 2^31 - 1).
pub const FP_PRIME: u64 = 2_147_483_647;

fn modpow(mut base: u64, mut exp: u64) -> u64 {
    let mut acc = 1u64;
    base %= FP_PRIME;
    while exp > 0 {
        if exp & 1 == 1 {
            acc = acc * base % FP_PRIME;
        }
        base = base * base % FP_PRIME;
        exp >>= 1;
    }
    acc
}

/// Multiplicative inverse by Fermat's little theorem. Inverse of 0 is 0 so
/// that a division-by-zero sample cannot crash a trial.
fn modinv(x: u64) -> u64 {
    if x % FP_PRIME == 0 {
        0
    } else {
        modpow(x, FP_PRIME - 2)
    }
}

impl UnaryOp {
    /// Injective residue map for this stage. Distinct stages (and distinct
    /// parameters) get distinct maps.
    fn fingerprint(&self, x: u64) -> u64 {
        match self {
            // square is exact in the field
            UnaryOp::Square => x * x % FP_PRIME,
            UnaryOp::Exp => modpow(x, 3),
            UnaryOp::Sqrt => modpow(x, 5),
            UnaryOp::Silu => modpow(x, 7),
            UnaryOp::Gelu => modpow(x, 11),
            UnaryOp::Relu => modpow(x, 13),
            UnaryOp::MulScalar(s) => x * (s.to_bits() as u64 % FP_PRIME) % FP_PRIME,
            UnaryOp::Clamp { min, max } => {
                let salt =
                    (min.to_bits() as u64 + 31 * max.to_bits() as u64) % FP_PRIME;
                (modpow(x, 17) + salt) % FP_PRIME
            }
        }
    }
}

impl KernelGraph {
    /// Evaluate the graph over Z_p on the given residue feeds (one buffer per
    /// external input, insertion order). Returns one buffer per marked output.
    pub fn fingerprint(&self, feeds: &[Vec<u64>]) -> Vec<Vec<u64>> {
        assert_eq!(feeds.len(), self.inputs.len());
        let mut tensors: FxHashMap<TensorId, Vec<u64>> = FxHashMap::default();
        for (id, feed) in self.inputs.iter().zip(feeds) {
            tensors.insert(*id, feed.iter().map(|x| x % FP_PRIME).collect());
        }

        for node in self.toposort() {
            let weight = &self.graph[node];
            if matches!(weight.op, KernelOp::Input) {
                continue;
            }
            let srcs: Vec<&[u64]> = weight
                .inputs
                .iter()
                .map(|id| tensors[id].as_slice())
                .collect();
            let src_shapes: Vec<_> = weight
                .inputs
                .iter()
                .map(|id| self.tensor_desc(*id).unwrap().shape.clone())
                .collect();
            let out = match &weight.op {
                KernelOp::Input => unreachable!(),
                KernelOp::Matmul => {
                    let a_sh = &src_shapes[0];
                    let b_sh = &src_shapes[1];
                    let r = a_sh.rank();
                    let (m, k) = (a_sh.dims()[r - 2], a_sh.dims()[r - 1]);
                    let n = b_sh.dims()[r - 1];
                    let batch = a_sh.dims()[..r - 2].iter().product::<usize>().max(1);
                    let mut c = vec![0u64; batch * m * n];
                    for bi in 0..batch {
                        for i in 0..m {
                            for j in 0..n {
                                let mut acc = 0u64;
                                for kk in 0..k {
                                    acc = (acc
                                        + srcs[0][bi * m * k + i * k + kk]
                                            * srcs[1][bi * k * n + kk * n + j])
                                        % FP_PRIME;
                                }
                                c[bi * m * n + i * n + j] = acc;
                            }
                        }
                    }
                    c
                }
                KernelOp::ElementUnary(chain) => srcs[0]
                    .iter()
                    .map(|&x| chain.iter().fold(x, |acc, u| u.fingerprint(acc)))
                    .collect(),
                KernelOp::ElementBinary(op) => srcs[0]
                    .iter()
                    .zip(srcs[1].iter())
                    .map(|(&a, &b)| match op {
                        BinaryOp::Add => (a + b) % FP_PRIME,
                        BinaryOp::Mul => a * b % FP_PRIME,
                        BinaryOp::Div => a * modinv(b) % FP_PRIME,
                    })
                    .collect(),
                KernelOp::Reduction(op, axis) => {
                    let sh = src_shapes[0].dims();
                    let front_size = sh.iter().take(*axis).product::<usize>().max(1);
                    let back_size = sh.iter().skip(axis + 1).product::<usize>().max(1);
                    let dim_size = sh[*axis];
                    let init = match op {
                        ReduceOp::Sum => 0,
                        ReduceOp::Max => u64::MIN,
                    };
                    let mut result = vec![init; front_size * back_size];
                    for i in 0..front_size {
                        for j in 0..back_size {
                            for k in 0..dim_size {
                                let x = srcs[0][i * dim_size * back_size + k * back_size + j];
                                let out = &mut result[i * back_size + j];
                                *out = match op {
                                    ReduceOp::Sum => (*out + x) % FP_PRIME,
                                    ReduceOp::Max => (*out).max(x),
                                };
                            }
                        }
                    }
                    result
                }
                KernelOp::Reshape(_) => srcs[0].to_vec(),
                KernelOp::Concat(axis) => {
                    let (a_sh, b_sh) = (src_shapes[0].dims(), src_shapes[1].dims());
                    let outer = a_sh.iter().take(*axis).product::<usize>().max(1);
                    let a_chunk = a_sh.iter().skip(*axis).product::<usize>();
                    let b_chunk = b_sh.iter().skip(*axis).product::<usize>();
                    let mut out = Vec::with_capacity(srcs[0].len() + srcs[1].len());
                    for i in 0..outer {
                        out.extend_from_slice(&srcs[0][i * a_chunk..(i + 1) * a_chunk]);
                        out.extend_from_slice(&srcs[1][i * b_chunk..(i + 1) * b_chunk]);
                    }
                    out
                }
            };
            tensors.insert(TensorId::new(node, 0), out);
        }

        self.outputs.iter().map(|id| tensors[id].clone()).collect()
    }
}

/// Sample one residue assignment for every external input of `graph`. Seeds
/// are derived per trial so the whole phase is deterministic.
pub fn sample_inputs(graph: &KernelGraph, seed: u64, trial: usize) -> Vec<Vec<u64>> {
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(trial as u64));
    graph
        .input_descs()
        .iter()
        .map(|desc| {
            (0..desc.shape.n_elements())
                .map(|_| rng.gen_range(0..FP_PRIME))
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::DType;

    #[test]
    fn test_field_helpers() {
        assert_eq!(modpow(2, 10), 1024);
        let inv = modinv(12345);
        assert_eq!(12345 * inv % FP_PRIME, 1);
        assert_eq!(modinv(0), 0);
    }

    #[test]
    fn test_commutative_fingerprint() {
        let mut g1 = KernelGraph::new();
        let a = g1.input([4, 4], DType::F32).unwrap();
        let b = g1.input([4, 4], DType::F32).unwrap();
        let c = g1.add(&a, &b).unwrap();
        g1.mark_output(&c).unwrap();

        let mut g2 = KernelGraph::new();
        let a2 = g2.input([4, 4], DType::F32).unwrap();
        let b2 = g2.input([4, 4], DType::F32).unwrap();
        let c2 = g2.add(&b2, &a2).unwrap();
        g2.mark_output(&c2).unwrap();

        let feeds = sample_inputs(&g1, 7, 0);
        assert_eq!(g1.fingerprint(&feeds), g2.fingerprint(&feeds));
    }

    #[test]
    fn test_sum_vs_max_fingerprint_mismatch() {
        use crate::kernel::op::ReduceOp;
        let build = |op| {
            let mut g = KernelGraph::new();
            let a = g.input([8, 8], DType::F32).unwrap();
            let r = g.reduction(&a, op, 1).unwrap();
            g.mark_output(&r).unwrap();
            g
        };
        let (g1, g2) = (build(ReduceOp::Sum), build(ReduceOp::Max));
        let feeds = sample_inputs(&g1, 7, 0);
        assert_ne!(g1.fingerprint(&feeds), g2.fingerprint(&feeds));
    }
}
