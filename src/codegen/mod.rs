//! Lowering of a verified kernel graph to an executable device kernel.

pub mod kernels;
pub mod persistent;

use std::sync::Mutex;

use colored::Colorize;
use itertools::Itertools;

use crate::{
    config::Config,
    error::GraphError,
    kernel::{graph::KernelGraph, op::KernelOp},
    search::SearchResult,
    shape::Dim3,
};

pub use persistent::PersistentKernel;

/// One entry of the compiled artifact's launch table, in DAG dependency order.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub kernel_name: String,
    pub grid: Dim3,
    pub block: Dim3,
    pub smem_bytes: usize,
    pub forloop_range: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptLevel {
    Aggressive,
    Conservative,
}

/// The artifact produced from a verified, finalized kernel graph.
#[derive(Debug, Clone)]
pub struct CompiledKernel {
    pub name: String,
    /// Full linked device source.
    pub source: String,
    pub launches: Vec<LaunchSpec>,
    pub device_id: usize,
    pub opt_level: OptLevel,
    /// Set when the graph was accepted with an `Unknown` verification verdict
    /// under bypass mode.
    pub degraded_confidence: bool,
    /// Warnings recorded instead of aborting (bypass-mode retries).
    pub warnings: Vec<String>,
    graph: KernelGraph,
}

impl CompiledKernel {
    pub fn graph(&self) -> &KernelGraph {
        &self.graph
    }
}

// The underlying device toolchain is not assumed reentrant: one compile/link
// pass holds the context at a time, process-wide.
static DEVICE_COMPILER_LOCK: Mutex<()> = Mutex::new(());

/// Lower `graph` to a compiled kernel for the configured device.
///
/// Fails with `CompileError` unless `bypass_compile_errors` is set, in which
/// case compilation is retried at degraded optimization and a warning is
/// recorded instead of aborting.
pub fn compile(graph: &KernelGraph, config: &Config) -> Result<CompiledKernel, GraphError> {
    compile_inner(graph, config, false)
}

/// Compile a search result, carrying its degraded-confidence marker into the
/// artifact metadata.
pub fn compile_result(
    result: &SearchResult,
    config: &Config,
) -> Result<CompiledKernel, GraphError> {
    compile_inner(&result.graph, config, result.degraded_confidence)
}

pub(crate) fn compile_inner(
    graph: &KernelGraph,
    config: &Config,
    degraded_confidence: bool,
) -> Result<CompiledKernel, GraphError> {
    let mut frozen = graph.clone();
    frozen.freeze();

    let _ctx = DEVICE_COMPILER_LOCK.lock().unwrap();
    let mut warnings = vec![];
    let (source, launches, opt_level) = match lower(&frozen, OptLevel::Aggressive) {
        Ok((source, launches)) => (source, launches, OptLevel::Aggressive),
        Err(GraphError::Compile(msg)) if config.bypass_compile_errors => {
            println!(
                "{} {msg}, retrying at degraded optimization",
                "warning:".bold().yellow()
            );
            warnings.push(msg);
            let (source, launches) = lower(&frozen, OptLevel::Conservative)?;
            (source, launches, OptLevel::Conservative)
        }
        Err(e) => return Err(e),
    };

    let name = format!(
        "tf_module_{}",
        frozen
            .toposort()
            .iter()
            .map(|n| n.index().to_string())
            .join("_")
    );
    Ok(CompiledKernel {
        name,
        source,
        launches,
        device_id: config.gpu_device_id,
        opt_level,
        degraded_confidence,
        warnings,
        graph: frozen,
    })
}

/// Emit every node's kernel and link them in dependency order.
fn lower(
    graph: &KernelGraph,
    opt: OptLevel,
) -> Result<(String, Vec<LaunchSpec>), GraphError> {
    let mut source = String::from("#include <math_constants.h>\n\n");
    let mut launches = vec![];
    for node in graph.toposort() {
        let weight = &graph.graph[node];
        if matches!(weight.op, KernelOp::Input) {
            continue;
        }
        let (kernel_name, kernel_src) = kernels::emit_node(graph, node, opt)?;
        source.push_str(&kernel_src);
        source.push('\n');
        // The aggressive matmul and reduction kernels dictate their own block
        // shapes; everything else follows the node's threadblock mapping (or
        // the default).
        let spec = if matches!(weight.op, KernelOp::Matmul) && opt == OptLevel::Aggressive {
            let out_sh = &weight.outputs[0].shape;
            let r = out_sh.rank();
            let (m, n) = (out_sh.dims()[r - 2], out_sh.dims()[r - 1]);
            let batch = out_sh.dims()[..r - 2].iter().product::<usize>().max(1);
            let t = kernels::MATMUL_TILE;
            LaunchSpec {
                kernel_name,
                grid: Dim3::new(n / t, m / t, batch),
                block: Dim3::new(t, t, 1),
                smem_bytes: 2 * t * t * weight.outputs[0].dtype.size_of(),
                forloop_range: 1,
            }
        } else if matches!(weight.op, KernelOp::Reduction(..)) && opt == OptLevel::Aggressive {
            // One warp per output element for the shuffle tree.
            LaunchSpec {
                kernel_name,
                grid: Dim3::new(weight.outputs[0].shape.n_elements(), 1, 1),
                block: Dim3::new(32, 1, 1),
                forloop_range: 1,
                smem_bytes: 0,
            }
        } else {
            let schedule = weight
                .schedule
                .clone()
                .unwrap_or_else(|| graph.default_schedule(node));
            LaunchSpec {
                kernel_name,
                grid: schedule.grid_dim,
                block: schedule.block_dim,
                smem_bytes: 0,
                forloop_range: schedule.forloop_range,
            }
        };
        launches.push(spec);
    }
    Ok((source, launches))
}
