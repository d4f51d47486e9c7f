//! Per-operator device source emitters.
//!
//! Each kernel-graph node lowers to one `__global__` function with its shapes
//! baked in as compile-time constants. [`super::OptLevel::Aggressive`] emits
//! the fast variants (tiled matmul, warp-shuffle tree reduction) and rejects
//! nodes those variants cannot express; `Conservative` always succeeds with
//! plain loop kernels.

use itertools::Itertools;

use crate::{
    error::GraphError,
    kernel::{
        graph::{KernelGraph, NodeIndex},
        op::{BinaryOp, KernelOp, ReduceOp, UnaryOp},
    },
    shape::DType,
};

use super::OptLevel;

/// Tile edge used by the aggressive matmul kernel.
pub const MATMUL_TILE: usize = 16;

impl UnaryOp {
    /// C expression applying this stage to `x`.
    fn c_expr(&self, x: &str) -> String {
        match self {
            UnaryOp::Exp => format!("__expf({x})"),
            UnaryOp::Square => format!("({x} * {x})"),
            UnaryOp::Sqrt => format!("sqrtf({x})"),
            UnaryOp::Silu => format!("({x} / (1.0f + __expf(-{x})))"),
            UnaryOp::Gelu => format!(
                "(0.5f * {x} * (1.0f + tanhf(0.7978845608f * ({x} + 0.044715f * {x} * {x} * {x}))))"
            ),
            UnaryOp::Relu => format!("fmaxf({x}, 0.0f)"),
            UnaryOp::MulScalar(s) => format!("({x} * {s:?}f)"),
            UnaryOp::Clamp { min, max } => {
                format!("fminf(fmaxf({x}, {min:?}f), {max:?}f)")
            }
        }
    }
}

impl BinaryOp {
    fn c_expr(&self, a: &str, b: &str) -> String {
        match self {
            BinaryOp::Add => format!("({a} + {b})"),
            BinaryOp::Mul => format!("({a} * {b})"),
            BinaryOp::Div => format!("({a} / {b})"),
        }
    }
}

/// Emit the `__global__` function for one node. The function name doubles as
/// the launch-table key.
pub fn emit_node(
    graph: &KernelGraph,
    node: NodeIndex,
    opt: OptLevel,
) -> Result<(String, String), GraphError> {
    let weight = &graph.graph[node];
    let name = format!("tf_node{}_{}", node.index(), sanitize(&weight.op.name()));
    let out = &weight.outputs[0];
    let ty = out.dtype.c_name();
    if out.dtype == DType::F16 && matches!(weight.op, KernelOp::Matmul) && opt == OptLevel::Aggressive
    {
        // The tiled f16 path needs tensor-core plumbing this emitter does not
        // carry; the conservative kernel handles f16 fine.
        return Err(GraphError::Compile(format!(
            "{name}: f16 matmul unsupported at aggressive optimization"
        )));
    }
    let params = (0..weight.inputs.len())
        .map(|i| format!("const {ty}* in{i}"))
        .chain([format!("{ty}* out0")])
        .join(", ");
    let body = match &weight.op {
        KernelOp::Input => unreachable!("inputs emit no kernel"),
        KernelOp::Matmul => {
            let sh = graph.tensor_desc(weight.inputs[0])?.shape.clone();
            let r = sh.rank();
            let (m, k) = (sh.dims()[r - 2], sh.dims()[r - 1]);
            let n = graph.tensor_desc(weight.inputs[1])?.shape.dims()[r - 1];
            let batch = sh.dims()[..r - 2].iter().product::<usize>().max(1);
            match opt {
                OptLevel::Aggressive => {
                    if m % MATMUL_TILE != 0 || n % MATMUL_TILE != 0 || k % MATMUL_TILE != 0 {
                        return Err(GraphError::Compile(format!(
                            "{name}: tiled matmul needs dims divisible by {MATMUL_TILE}, got {m}x{k}x{n}"
                        )));
                    }
                    format!(
                        r#"    __shared__ {ty} a_tile[{t}][{t}];
    __shared__ {ty} b_tile[{t}][{t}];
    const int b_idx = blockIdx.z;
    const int row = blockIdx.y * {t} + threadIdx.y;
    const int col = blockIdx.x * {t} + threadIdx.x;
    {ty} acc = 0.0f;
    for (int kt = 0; kt < {k}; kt += {t}) {{
        a_tile[threadIdx.y][threadIdx.x] = in0[b_idx * {mk} + row * {k} + kt + threadIdx.x];
        b_tile[threadIdx.y][threadIdx.x] = in1[b_idx * {kn} + (kt + threadIdx.y) * {n} + col];
        __syncthreads();
        #pragma unroll
        for (int kk = 0; kk < {t}; kk++)
            acc += a_tile[threadIdx.y][kk] * b_tile[kk][threadIdx.x];
        __syncthreads();
    }}
    out0[b_idx * {mn} + row * {n} + col] = acc;"#,
                        t = MATMUL_TILE,
                        mk = m * k,
                        kn = k * n,
                        mn = m * n,
                    )
                }
                OptLevel::Conservative => format!(
                    r#"    const int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx >= {total}) return;
    const int b_idx = idx / {mn};
    const int row = (idx % {mn}) / {n};
    const int col = idx % {n};
    {ty} acc = 0.0f;
    for (int kk = 0; kk < {k}; kk++)
        acc += in0[b_idx * {mk} + row * {k} + kk] * in1[b_idx * {kn} + kk * {n} + col];
    out0[idx] = acc;"#,
                    total = batch * m * n,
                    mk = m * k,
                    kn = k * n,
                    mn = m * n,
                ),
            }
        }
        KernelOp::ElementUnary(chain) => {
            let expr = chain
                .iter()
                .fold("in0[idx]".to_string(), |acc, u| u.c_expr(&acc));
            format!(
                r#"    const int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx >= {n}) return;
    out0[idx] = {expr};"#,
                n = out.shape.n_elements(),
            )
        }
        KernelOp::ElementBinary(op) => format!(
            r#"    const int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx >= {n}) return;
    out0[idx] = {expr};"#,
            n = out.shape.n_elements(),
            expr = op.c_expr("in0[idx]", "in1[idx]"),
        ),
        KernelOp::Reduction(op, axis) => {
            let sh = graph.tensor_desc(weight.inputs[0])?.shape.clone();
            let front = sh.dims().iter().take(*axis).product::<usize>().max(1);
            let back = sh.dims().iter().skip(axis + 1).product::<usize>().max(1);
            let dim = sh.dims()[*axis];
            let (init, combine) = match op {
                ReduceOp::Sum => ("0.0f", "acc += v;"),
                ReduceOp::Max => ("-INFINITY", "acc = fmaxf(acc, v);"),
            };
            let shuf_combine = match op {
                ReduceOp::Sum => "acc += __shfl_down_sync(0xffffffff, acc, off);",
                ReduceOp::Max => "acc = fmaxf(acc, __shfl_down_sync(0xffffffff, acc, off));",
            };
            match opt {
                OptLevel::Aggressive => {
                    if !dim.is_power_of_two() {
                        return Err(GraphError::Compile(format!(
                            "{name}: shuffle tree reduction needs a power-of-two extent, got {dim}"
                        )));
                    }
                    format!(
                        r#"    // one warp per output element, tree reduction over the {dim}-wide axis
    const int o = blockIdx.x;
    const int i = o / {back};
    const int j = o % {back};
    {ty} acc = {init};
    for (int k = threadIdx.x; k < {dim}; k += 32) {{
        {ty} v = in0[i * {dim} * {back} + k * {back} + j];
        {combine}
    }}
    for (int off = 16; off > 0; off >>= 1) {{
        {shuf_combine}
    }}
    if (threadIdx.x == 0) out0[o] = acc;"#
                    )
                }
                OptLevel::Conservative => format!(
                    r#"    const int o = blockIdx.x * blockDim.x + threadIdx.x;
    if (o >= {total}) return;
    const int i = o / {back};
    const int j = o % {back};
    {ty} acc = {init};
    for (int k = 0; k < {dim}; k++) {{
        {ty} v = in0[i * {dim} * {back} + k * {back} + j];
        {combine}
    }}
    out0[o] = acc;"#,
                    total = front * back,
                ),
            }
        }
        // Row-major reshape is a contiguous copy.
        KernelOp::Reshape(_) => format!(
            r#"    const int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx >= {n}) return;
    out0[idx] = in0[idx];"#,
            n = out.shape.n_elements(),
        ),
        KernelOp::Concat(axis) => {
            let a_sh = graph.tensor_desc(weight.inputs[0])?.shape.clone();
            let b_sh = graph.tensor_desc(weight.inputs[1])?.shape.clone();
            let a_chunk = a_sh.dims().iter().skip(*axis).product::<usize>();
            let b_chunk = b_sh.dims().iter().skip(*axis).product::<usize>();
            format!(
                r#"    const int idx = blockIdx.x * blockDim.x + threadIdx.x;
    if (idx >= {n}) return;
    const int outer = idx / {chunk};
    const int inner = idx % {chunk};
    out0[idx] = inner < {a_chunk}
        ? in0[outer * {a_chunk} + inner]
        : in1[outer * {b_chunk} + (inner - {a_chunk})];"#,
                n = out.shape.n_elements(),
                chunk = a_chunk + b_chunk,
            )
        }
    };
    let source = format!("extern \"C\" __global__ void {name}({params}) {{\n{body}\n}}\n");
    Ok((name, source))
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::DType;

    #[test]
    fn test_emit_matmul_aggressive() {
        let mut g = KernelGraph::new();
        let a = g.input([128, 256], DType::F32).unwrap();
        let b = g.input([256, 64], DType::F32).unwrap();
        let c = g.matmul(&a, &b).unwrap();
        g.mark_output(&c).unwrap();
        let (name, src) = emit_node(&g, c.id.node, OptLevel::Aggressive).unwrap();
        assert!(src.contains("__shared__"));
        assert!(src.contains(&name));
    }

    #[test]
    fn test_ragged_matmul_rejected_then_lowered_conservatively() {
        let mut g = KernelGraph::new();
        let a = g.input([2, 3], DType::F32).unwrap();
        let b = g.input([3, 2], DType::F32).unwrap();
        let c = g.matmul(&a, &b).unwrap();
        g.mark_output(&c).unwrap();
        assert!(matches!(
            emit_node(&g, c.id.node, OptLevel::Aggressive),
            Err(GraphError::Compile(_))
        ));
        assert!(emit_node(&g, c.id.node, OptLevel::Conservative).is_ok());
    }

    #[test]
    fn test_unary_chain_emits_single_expression() {
        let mut g = KernelGraph::new();
        let a = g.input([64], DType::F32).unwrap();
        let e = g.exp(&a).unwrap();
        g.mark_output(&e).unwrap();
        let (_, src) = emit_node(&g, e.id.node, OptLevel::Aggressive).unwrap();
        assert!(src.contains("__expf(in0[idx])"));
    }
}
