//! Device/runtime boundary.
//!
//! Compiled and persistent kernels depend on an external execution runtime for
//! kernel launch, memory allocation and device enumeration. The core treats it
//! as an opaque backend reachable by device id; [`HostRuntime`] is the
//! reference backend that interprets the lowered graph on the CPU, used by the
//! test suite and anywhere no GPU toolchain is present.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::{codegen::CompiledKernel, error::GraphError, tensor::Tensor};

/// An opaque device-resident allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBuffer {
    pub device_id: usize,
    pub bytes: usize,
    pub handle: u64,
}

pub trait DeviceRuntime: Send + Sync {
    fn device_count(&self) -> usize;

    fn alloc(&self, device_id: usize, bytes: usize) -> Result<DeviceBuffer, GraphError>;

    fn free(&self, buffer: DeviceBuffer);

    /// Execute one compiled kernel on concrete inputs, one tensor per
    /// external graph input.
    fn launch(
        &self,
        kernel: &CompiledKernel,
        inputs: &[Tensor],
    ) -> Result<Vec<Tensor>, GraphError>;
}

/// CPU interpreter backend. Tracks outstanding allocations so resource
/// lifecycle bugs (leaked persistent state) show up in tests.
#[derive(Debug, Default)]
pub struct HostRuntime {
    devices: usize,
    outstanding: AtomicUsize,
    next_handle: AtomicU64,
}

impl HostRuntime {
    pub fn new() -> Self {
        Self::with_devices(1)
    }

    pub fn with_devices(devices: usize) -> Self {
        Self {
            devices,
            outstanding: AtomicUsize::new(0),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Number of live allocations, for leak assertions in tests.
    pub fn outstanding_allocations(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

impl DeviceRuntime for HostRuntime {
    fn device_count(&self) -> usize {
        self.devices
    }

    fn alloc(&self, device_id: usize, bytes: usize) -> Result<DeviceBuffer, GraphError> {
        if device_id >= self.devices {
            return Err(GraphError::Compile(format!(
                "device {device_id} out of range, runtime has {} devices",
                self.devices
            )));
        }
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Ok(DeviceBuffer {
            device_id,
            bytes,
            handle: self.next_handle.fetch_add(1, Ordering::SeqCst),
        })
    }

    fn free(&self, _buffer: DeviceBuffer) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }

    fn launch(
        &self,
        kernel: &CompiledKernel,
        inputs: &[Tensor],
    ) -> Result<Vec<Tensor>, GraphError> {
        let feeds = inputs
            .iter()
            .map(Tensor::as_f32)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(kernel
            .graph()
            .execute(&feeds)?
            .into_iter()
            .map(Tensor::new)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codegen::compile, config::Config, kernel::graph::KernelGraph, shape::DType};

    #[test]
    fn test_launch_widens_half_precision_inputs() {
        let mut g = KernelGraph::new();
        let a = g.input([2, 2], DType::F32).unwrap();
        let b = g.relu(&a).unwrap();
        g.mark_output(&b).unwrap();
        let kernel = compile(&g, &Config::default()).unwrap();

        let runtime = HostRuntime::new();
        let feed = Tensor::new(vec![
            half::f16::from_f32(1.0),
            half::f16::from_f32(-1.0),
            half::f16::from_f32(2.0),
            half::f16::from_f32(-2.0),
        ]);
        let out = runtime.launch(&kernel, &[feed]).unwrap();
        assert_eq!(
            out[0].downcast_ref::<Vec<f32>>().unwrap(),
            &vec![1.0, 0.0, 2.0, 0.0]
        );
    }

    #[test]
    fn test_alloc_tracks_outstanding() {
        let runtime = HostRuntime::with_devices(2);
        let buf = runtime.alloc(1, 1024).unwrap();
        assert_eq!(runtime.outstanding_allocations(), 1);
        runtime.free(buf);
        assert_eq!(runtime.outstanding_allocations(), 0);
        assert!(runtime.alloc(2, 64).is_err());
    }
}
