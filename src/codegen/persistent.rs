//! Device-resident ("persistent") kernels.
//!
//! A persistent kernel keeps its intermediate buffers allocated and its
//! control loop resident across invocations, so repeated `run` calls pay no
//! relaunch overhead. It owns real device state and must be released exactly
//! once; release is idempotent and running afterwards is a caller bug.

use std::sync::{Arc, Mutex};

use crate::{
    config::Config,
    error::GraphError,
    kernel::{graph::KernelGraph, op::KernelOp},
    runtime::{DeviceBuffer, DeviceRuntime},
    search::SearchResult,
    tensor::Tensor,
};

use super::{compile_inner, CompiledKernel};

struct PersistentState {
    released: bool,
    resident: Vec<DeviceBuffer>,
    invocations: u64,
}

/// A compiled kernel plus its device-resident state and run loop.
pub struct PersistentKernel {
    inner: CompiledKernel,
    runtime: Arc<dyn DeviceRuntime>,
    state: Mutex<PersistentState>,
}

/// Compile `graph` into a persistent kernel, allocating one device-resident
/// buffer per non-input tensor up front.
pub fn compile_persistent(
    graph: &KernelGraph,
    config: &Config,
    runtime: Arc<dyn DeviceRuntime>,
) -> Result<PersistentKernel, GraphError> {
    let inner = compile_inner(graph, config, false)?;
    PersistentKernel::new(inner, runtime)
}

/// Like [`compile_persistent`] but carries the search result's
/// degraded-confidence marker.
pub fn compile_persistent_result(
    result: &SearchResult,
    config: &Config,
    runtime: Arc<dyn DeviceRuntime>,
) -> Result<PersistentKernel, GraphError> {
    let inner = compile_inner(&result.graph, config, result.degraded_confidence)?;
    PersistentKernel::new(inner, runtime)
}

impl PersistentKernel {
    fn new(inner: CompiledKernel, runtime: Arc<dyn DeviceRuntime>) -> Result<Self, GraphError> {
        let graph = inner.graph();
        let mut resident = vec![];
        for node in graph.node_indices() {
            let weight = &graph.graph[node];
            if matches!(weight.op, KernelOp::Input) {
                continue;
            }
            for out in &weight.outputs {
                match runtime.alloc(inner.device_id, out.size_in_bytes()) {
                    Ok(buf) => resident.push(buf),
                    Err(e) => {
                        // Unwind partial allocations before surfacing.
                        for buf in resident {
                            runtime.free(buf);
                        }
                        return Err(e);
                    }
                }
            }
        }
        Ok(Self {
            inner,
            runtime,
            state: Mutex::new(PersistentState {
                released: false,
                resident,
                invocations: 0,
            }),
        })
    }

    pub fn compiled(&self) -> &CompiledKernel {
        &self.inner
    }

    pub fn degraded_confidence(&self) -> bool {
        self.inner.degraded_confidence
    }

    pub fn invocations(&self) -> u64 {
        self.state.lock().unwrap().invocations
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().unwrap().released
    }

    /// Execute one invocation. Concurrent callers are serialized: the state
    /// lock is held for the whole invocation (single-active-invocation
    /// discipline), which also makes `release` safe against in-flight runs.
    pub fn run(&self, inputs: &[Tensor]) -> Result<Vec<Tensor>, GraphError> {
        let mut state = self.state.lock().unwrap();
        if state.released {
            return Err(GraphError::UseAfterRelease);
        }
        state.invocations += 1;
        self.runtime.launch(&self.inner, inputs)
    }

    /// Free the device-resident state. Idempotent: calling it again is a
    /// no-op, not an error.
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        if state.released {
            return;
        }
        state.released = true;
        for buf in state.resident.drain(..) {
            self.runtime.free(buf);
        }
    }
}

impl Drop for PersistentKernel {
    fn drop(&mut self) {
        self.release();
    }
}
