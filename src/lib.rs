pub mod codegen;
pub mod config;
pub mod dataset;
pub mod display;
pub mod error;
pub mod kernel;
pub mod runtime;
pub mod search;
pub mod shape;
pub mod tensor;
pub mod threadblock;
pub mod verify;

#[cfg(test)]
mod tests;

pub mod prelude {
    pub use crate::codegen::{
        compile, compile_result,
        persistent::{compile_persistent, compile_persistent_result},
        CompiledKernel, OptLevel, PersistentKernel,
    };
    pub use crate::config::Config;
    pub use crate::error::{GraphError, SearchExhausted};
    pub use crate::kernel::graph::{KernelGraph, NodeIndex};
    pub use crate::kernel::op::{BinaryOp, KernelOp, ReduceOp, UnaryOp};
    pub use crate::runtime::{DeviceRuntime, HostRuntime};
    pub use crate::search::{SearchBudget, SearchEngine, SearchResult};
    pub use crate::shape::{DType, Dim3, Shape};
    pub use crate::tensor::{Tensor, TensorDesc, TensorId};
    pub use crate::threadblock::ThreadblockGraph;
    pub use crate::verify::{solver::AlgebraicOracle, Verification, Verifier};
}
