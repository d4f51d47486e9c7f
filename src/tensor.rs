use std::{any::Any, fmt::Debug};

use dyn_clone::{clone_trait_object, DynClone};
use petgraph::stable_graph::NodeIndex;

use crate::{
    error::GraphError,
    shape::{DType, Shape},
};

/// Stable identity of a tensor value: the producing node and its output slot.
///
/// Node indices come from the graph's arena, so cross-references (tensor ->
/// producing operator, threadblock graph -> parent node) never form ownership
/// cycles and lookups stay O(1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId {
    pub node: NodeIndex,
    pub slot: u8,
}

impl TensorId {
    pub fn new(node: NodeIndex, slot: u8) -> Self {
        Self { node, slot }
    }
}

/// Immutable metadata handle for a tensor value in a kernel graph.
///
/// Handles are cheap to copy and shared by every node that consumes the value;
/// the underlying value's lifetime is tied to the owning graph.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDesc {
    pub id: TensorId,
    pub shape: Shape,
    pub dtype: DType,
}

impl TensorDesc {
    pub fn new(id: TensorId, shape: Shape, dtype: DType) -> Self {
        Self { id, shape, dtype }
    }

    pub fn size_in_bytes(&self) -> usize {
        self.shape.n_elements() * self.dtype.size_of()
    }
}

/// A tensor value crossing the device-runtime boundary: concrete host data
/// behind the [`Data`] trait object. Kernel launches consume and produce
/// these; internally the interpreter widens everything to f32.
#[derive(Debug, Clone)]
pub struct Tensor {
    data: Box<dyn Data>,
}

impl Tensor {
    pub fn new<T: Data>(data: T) -> Self {
        Self {
            data: Box::new(data),
        }
    }

    pub fn downcast_ref<T: Data>(&self) -> Option<&T> {
        self.data.as_any().downcast_ref()
    }

    pub fn downcast_mut<T: Data>(&mut self) -> Option<&mut T> {
        self.data.as_any_mut().downcast_mut()
    }

    pub fn is<T: Data>(&self) -> bool {
        self.data.as_any().is::<T>()
    }

    /// The payload's element type, if it is one the runtime executes.
    pub fn dtype(&self) -> Option<DType> {
        if self.is::<Vec<f32>>() {
            Some(DType::F32)
        } else if self.is::<Vec<half::f16>>() {
            Some(DType::F16)
        } else {
            None
        }
    }

    /// Widen the payload to f32 for execution. Half-precision data is
    /// converted elementwise; anything else is not a launchable payload.
    pub fn as_f32(&self) -> Result<Vec<f32>, GraphError> {
        if let Some(v) = self.downcast_ref::<Vec<f32>>() {
            Ok(v.clone())
        } else if let Some(v) = self.downcast_ref::<Vec<half::f16>>() {
            Ok(v.iter().map(|h| h.to_f32()).collect())
        } else {
            Err(GraphError::ShapeMismatch(format!(
                "tensor payload {:?} is not launchable",
                self.data
            )))
        }
    }
}

/// Host data a [`Tensor`] can carry across the runtime boundary.
pub trait Data: Any + Debug + DynClone {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

clone_trait_object!(Data);

impl Data for Vec<f32> {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Data for Vec<half::f16> {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_downcast() {
        let mut t = Tensor::new(vec![1.0f32, 2.0]);
        assert!(t.is::<Vec<f32>>());
        assert_eq!(t.dtype(), Some(DType::F32));
        t.downcast_mut::<Vec<f32>>().unwrap().push(3.0);
        assert_eq!(t.downcast_ref::<Vec<f32>>().unwrap().len(), 3);

        let cloned = t.clone();
        assert_eq!(cloned.downcast_ref::<Vec<f32>>(), t.downcast_ref());
    }

    #[test]
    fn test_half_precision_widens() {
        let h = Tensor::new(vec![half::f16::from_f32(0.5), half::f16::from_f32(-2.0)]);
        assert_eq!(h.dtype(), Some(DType::F16));
        assert_eq!(h.as_f32().unwrap(), vec![0.5, -2.0]);
    }
}
