use itertools::Itertools;

use crate::{
    error::GraphError,
    shape::{DType, Shape},
    tensor::TensorDesc,
};

/// A single stage of an elementwise unary chain.
#[derive(Debug, Clone, Copy, PartialEq, strum::Display)]
pub enum UnaryOp {
    Exp,
    Square,
    Sqrt,
    Silu,
    Gelu,
    Relu,
    MulScalar(f32),
    Clamp { min: f32, max: f32 },
}

/// Elementwise binary operators. `Add` and `Mul` are commutative, which the
/// search engine's reorder rewrite and the solver's canonicalization rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum BinaryOp {
    Add,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn is_commutative(&self) -> bool {
        matches!(self, BinaryOp::Add | BinaryOp::Mul)
    }
}

/// Reduction operators applied along a single axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum ReduceOp {
    Sum,
    Max,
}

/// A kernel-graph node: a closed tagged variant per operator kind, each
/// carrying its own parameter payload. Shape inference and codegen dispatch on
/// the tag.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelOp {
    /// External graph input.
    Input,
    /// `[.., m, k] x [.., k, n] -> [.., m, n]`, equal leading batch dims.
    Matmul,
    /// A chain of elementwise unary stages applied in order. A freshly built
    /// operator holds one stage; the fusion rewrite concatenates chains.
    ElementUnary(Vec<UnaryOp>),
    ElementBinary(BinaryOp),
    /// Reduce along the given axis; the axis is removed from the output shape.
    Reduction(ReduceOp, usize),
    /// Reinterpret to a new shape with the same element count.
    Reshape(Shape),
    /// Concatenate two tensors along the given axis.
    Concat(usize),
}

impl KernelOp {
    pub fn num_inputs(&self) -> usize {
        match self {
            KernelOp::Input => 0,
            KernelOp::ElementUnary(_) | KernelOp::Reduction(..) | KernelOp::Reshape(_) => 1,
            KernelOp::Matmul | KernelOp::ElementBinary(_) | KernelOp::Concat(_) => 2,
        }
    }

    /// Short name used in graph display and emitted kernel names.
    pub fn name(&self) -> String {
        match self {
            KernelOp::Input => "Input".to_string(),
            KernelOp::Matmul => "Matmul".to_string(),
            KernelOp::ElementUnary(chain) => chain.iter().map(|u| u.to_string()).join("_"),
            KernelOp::ElementBinary(b) => b.to_string(),
            KernelOp::Reduction(r, axis) => format!("{r}Reduce{axis}"),
            KernelOp::Reshape(s) => format!("Reshape{s}"),
            KernelOp::Concat(axis) => format!("Concat{axis}"),
        }
    }

    /// The operator's shape-inference rule. Violated inputs fail here, at
    /// construction time, never later.
    pub fn infer_shape(&self, inputs: &[&TensorDesc]) -> Result<(Shape, DType), GraphError> {
        if inputs.len() != self.num_inputs() {
            return Err(GraphError::ShapeMismatch(format!(
                "{} expects {} inputs, got {}",
                self.name(),
                self.num_inputs(),
                inputs.len()
            )));
        }
        if let Some((a, b)) = inputs.iter().tuple_windows().next() {
            if a.dtype != b.dtype {
                return Err(GraphError::ShapeMismatch(format!(
                    "mixed dtypes {} and {} in {}",
                    a.dtype,
                    b.dtype,
                    self.name()
                )));
            }
        }
        match self {
            KernelOp::Input => unreachable!("inputs are constructed directly"),
            KernelOp::Matmul => {
                let (a, b) = (&inputs[0].shape, &inputs[1].shape);
                if a.rank() < 2 || b.rank() < 2 || a.rank() != b.rank() {
                    return Err(GraphError::ShapeMismatch(format!(
                        "matmul needs equal-rank operands of rank >= 2, got {a} and {b}"
                    )));
                }
                let r = a.rank();
                let (m, ka) = (a.dims()[r - 2], a.dims()[r - 1]);
                let (kb, n) = (b.dims()[r - 2], b.dims()[r - 1]);
                if ka != kb {
                    return Err(GraphError::ShapeMismatch(format!(
                        "matmul inner dims disagree: {a} x {b}"
                    )));
                }
                if a.dims()[..r - 2] != b.dims()[..r - 2] {
                    return Err(GraphError::ShapeMismatch(format!(
                        "matmul batch dims disagree: {a} x {b}"
                    )));
                }
                let out = Shape::new(
                    a.dims()[..r - 2]
                        .iter()
                        .copied()
                        .chain([m, n]),
                );
                Ok((out, inputs[0].dtype))
            }
            KernelOp::ElementUnary(chain) => {
                // Stage parameters are baked into device source as literals.
                for stage in chain {
                    let finite = match stage {
                        UnaryOp::MulScalar(s) => s.is_finite(),
                        UnaryOp::Clamp { min, max } => min.is_finite() && max.is_finite(),
                        _ => true,
                    };
                    if !finite {
                        return Err(GraphError::ShapeMismatch(format!(
                            "non-finite parameter in {}",
                            self.name()
                        )));
                    }
                }
                Ok((inputs[0].shape.clone(), inputs[0].dtype))
            }
            KernelOp::ElementBinary(b) => {
                if inputs[0].shape != inputs[1].shape {
                    return Err(GraphError::ShapeMismatch(format!(
                        "{b} operands must have identical shapes, got {} and {}",
                        inputs[0].shape, inputs[1].shape
                    )));
                }
                Ok((inputs[0].shape.clone(), inputs[0].dtype))
            }
            KernelOp::Reduction(r, axis) => {
                if *axis >= inputs[0].shape.rank() {
                    return Err(GraphError::ShapeMismatch(format!(
                        "{r} reduction axis {axis} out of range for shape {}",
                        inputs[0].shape
                    )));
                }
                Ok((inputs[0].shape.remove_dim(*axis), inputs[0].dtype))
            }
            KernelOp::Reshape(new_shape) => {
                new_shape.validate()?;
                if new_shape.n_elements() != inputs[0].shape.n_elements() {
                    return Err(GraphError::ShapeMismatch(format!(
                        "cannot reshape {} ({} elements) to {new_shape} ({} elements)",
                        inputs[0].shape,
                        inputs[0].shape.n_elements(),
                        new_shape.n_elements()
                    )));
                }
                Ok((new_shape.clone(), inputs[0].dtype))
            }
            KernelOp::Concat(axis) => {
                let (a, b) = (&inputs[0].shape, &inputs[1].shape);
                if a.rank() != b.rank() || *axis >= a.rank() {
                    return Err(GraphError::ShapeMismatch(format!(
                        "concat axis {axis} invalid for {a} and {b}"
                    )));
                }
                for d in 0..a.rank() {
                    if d != *axis && a.dims()[d] != b.dims()[d] {
                        return Err(GraphError::ShapeMismatch(format!(
                            "concat operands disagree on non-concat dim {d}: {a} and {b}"
                        )));
                    }
                }
                let out = Shape::new(a.dims().iter().enumerate().map(|(d, &s)| {
                    if d == *axis {
                        s + b.dims()[d]
                    } else {
                        s
                    }
                }));
                Ok((out, inputs[0].dtype))
            }
        }
    }
}
