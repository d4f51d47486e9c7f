//! Host-side reference interpreter for kernel graphs.
//!
//! Used by the verifier's concrete-sampling phase, the host device runtime and
//! the test suite. Matmul goes through `matrixmultiply::sgemm`; everything else
//! is a plain loop nest over row-major data.

use rustc_hash::FxHashMap;

use crate::{
    error::GraphError,
    kernel::{
        graph::KernelGraph,
        op::{BinaryOp, KernelOp, ReduceOp, UnaryOp},
    },
    tensor::TensorId,
};

impl UnaryOp {
    /// Apply one chain stage to a single element.
    pub fn apply(&self, x: f32) -> f32 {
        match self {
            UnaryOp::Exp => x.exp(),
            UnaryOp::Square => x * x,
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Silu => x / (1.0 + (-x).exp()),
            // tanh approximation of gelu, matching the emitted device code
            UnaryOp::Gelu => {
                0.5 * x * (1.0 + (0.7978845608 * (x + 0.044715 * x * x * x)).tanh())
            }
            UnaryOp::Relu => x.max(0.0),
            UnaryOp::MulScalar(s) => x * s,
            UnaryOp::Clamp { min, max } => x.clamp(*min, *max),
        }
    }
}

impl BinaryOp {
    pub fn apply(&self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
        }
    }
}

impl KernelGraph {
    /// Execute the graph on concrete inputs (one buffer per external input, in
    /// insertion order) and return one buffer per marked output, in mark order.
    pub fn execute(&self, feeds: &[Vec<f32>]) -> Result<Vec<Vec<f32>>, GraphError> {
        if feeds.len() != self.inputs.len() {
            return Err(GraphError::InputNotFound(format!(
                "graph has {} inputs, got {} feeds",
                self.inputs.len(),
                feeds.len()
            )));
        }
        let mut tensors: FxHashMap<TensorId, Vec<f32>> = FxHashMap::default();
        for (id, feed) in self.inputs.iter().zip(feeds) {
            let desc = self.tensor_desc(*id)?;
            if feed.len() != desc.shape.n_elements() {
                return Err(GraphError::ShapeMismatch(format!(
                    "feed for {id:?} has {} elements, shape {} needs {}",
                    feed.len(),
                    desc.shape,
                    desc.shape.n_elements()
                )));
            }
            tensors.insert(*id, feed.clone());
        }

        for node in self.toposort() {
            let weight = &self.graph[node];
            if matches!(weight.op, KernelOp::Input) {
                continue;
            }
            let srcs: Vec<&[f32]> = weight
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
                    let mut c = vec![0.0; batch * m * n];
                    for bi in 0..batch {
                        unsafe {
                            matrixmultiply::sgemm(
                                m,
                                k,
                                n,
                                1.0,
                                srcs[0][bi * m * k..].as_ptr(),
                                k as isize,
                                1,
                                srcs[1][bi * k * n..].as_ptr(),
                                n as isize,
                                1,
                                0.0,
                                c[bi * m * n..].as_mut_ptr(),
                                n as isize,
                                1,
                            );
                        }
                    }
                    c
                }
                KernelOp::ElementUnary(chain) => srcs[0]
                    .iter()
                    .map(|&x| chain.iter().fold(x, |acc, u| u.apply(acc)))
                    .collect(),
                KernelOp::ElementBinary(op) => srcs[0]
                    .iter()
                    .zip(srcs[1].iter())
                    .map(|(&a, &b)| op.apply(a, b))
                    .collect(),
                KernelOp::Reduction(op, axis) => {
                    let sh = src_shapes[0].dims();
                    let front_size = sh.iter().take(*axis).product::<usize>().max(1);
                    let back_size = sh.iter().skip(axis + 1).product::<usize>().max(1);
                    let dim_size = sh[*axis];
                    let init = match op {
                        ReduceOp::Sum => 0.0,
                        ReduceOp::Max => -f32::INFINITY,
                    };
                    let mut result = vec![init; front_size * back_size];
                    for i in 0..front_size {
                        for j in 0..back_size {
                            for k in 0..dim_size {
                                let x = srcs[0][i * dim_size * back_size + k * back_size + j];
                                let out = &mut result[i * back_size + j];
                                *out = match op {
                                    ReduceOp::Sum => *out + x,
                                    ReduceOp::Max => out.max(x),
                                };
                            }
                        }
                    }
                    result
                }
                // Row-major data is unchanged by reshape.
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

        Ok(self
            .outputs
            .iter()
            .map(|id| tensors[id].clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use crate::{kernel::graph::KernelGraph, kernel::op::ReduceOp, shape::DType};

    #[test]
    fn test_matmul_execute() {
        let mut g = KernelGraph::new();
        let a = g.input([2, 3], DType::F32).unwrap();
        let b = g.input([3, 2], DType::F32).unwrap();
        let c = g.matmul(&a, &b).unwrap();
        g.mark_output(&c).unwrap();
        let out = g
            .execute(&[
                vec![1., 2., 3., 4., 5., 6.],
                vec![1., 0., 0., 1., 1., 1.],
            ])
            .unwrap();
        assert_eq!(out[0], vec![4., 5., 10., 11.]);
    }

    #[test]
    fn test_reduction_execute() {
        let mut g = KernelGraph::new();
        let a = g.input([2, 3], DType::F32).unwrap();
        let s = g.reduction(&a, ReduceOp::Sum, 1).unwrap();
        let m = g.reduction(&a, ReduceOp::Max, 0).unwrap();
        g.mark_output(&s).unwrap();
        g.mark_output(&m).unwrap();
        let out = g.execute(&[vec![1., 2., 3., 4., 5., 6.]]).unwrap();
        assert_eq!(out[0], vec![6., 15.]);
        assert_eq!(out[1], vec![4., 5., 6.]);
    }

    #[test]
    fn test_concat_execute() {
        let mut g = KernelGraph::new();
        let a = g.input([2, 2], DType::F32).unwrap();
        let b = g.input([2, 1], DType::F32).unwrap();
        let c = g.concat(&a, &b, 1).unwrap();
        g.mark_output(&c).unwrap();
        let out = g
            .execute(&[vec![1., 2., 3., 4.], vec![9., 8.]])
            .unwrap();
        assert_eq!(out[0], vec![1., 2., 9., 3., 4., 8.]);
    }
}
