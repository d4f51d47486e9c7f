use std::fmt::{self, Debug, Display};

use tinyvec::TinyVec;

use crate::error::GraphError;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::Display)]
pub enum DType {
    #[default]
    F32,
    F16,
}

impl DType {
    pub fn size_of(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
        }
    }

    /// Type name in emitted device source.
    pub fn c_name(&self) -> &'static str {
        match self {
            DType::F32 => "float",
            DType::F16 => "__half",
        }
    }
}

/// An ordered sequence of positive dimension sizes. Inlined up to 6 dims.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape {
    dims: TinyVec<[usize; 6]>,
}

impl Shape {
    pub fn new(dims: impl IntoIterator<Item = usize>) -> Self {
        Self {
            dims: dims.into_iter().collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn n_elements(&self) -> usize {
        self.dims.iter().product::<usize>().max(1)
    }

    /// Row-major (contiguous) strides.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1; self.rank()];
        for i in (0..self.rank().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    /// All dimensions must be positive.
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.dims.is_empty() {
            return Err(GraphError::ShapeMismatch("empty shape".to_string()));
        }
        if self.dims.iter().any(|d| *d == 0) {
            return Err(GraphError::ShapeMismatch(format!(
                "zero-sized dimension in shape {self:?}"
            )));
        }
        Ok(())
    }

    /// Shape with one axis removed (reduction output shape). A rank-1 input
    /// reduces to a scalar-like rank-1 shape of [1].
    pub fn remove_dim(&self, axis: usize) -> Shape {
        let mut dims: TinyVec<[usize; 6]> = self
            .dims
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != axis)
            .map(|(_, d)| *d)
            .collect();
        if dims.is_empty() {
            dims.push(1);
        }
        Shape { dims }
    }
}

impl Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &self.dims[..])
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &self.dims[..])
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(value: [usize; N]) -> Self {
        Shape::new(value)
    }
}

impl From<&[usize]> for Shape {
    fn from(value: &[usize]) -> Self {
        Shape::new(value.iter().copied())
    }
}

/// Grid or block extents. All three extents must be positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dim3 {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl Dim3 {
    pub fn new(x: usize, y: usize, z: usize) -> Self {
        Self { x, y, z }
    }

    pub fn volume(&self) -> usize {
        self.x * self.y * self.z
    }

    pub fn is_positive(&self) -> bool {
        self.x > 0 && self.y > 0 && self.z > 0
    }
}

impl From<(usize, usize, usize)> for Dim3 {
    fn from((x, y, z): (usize, usize, usize)) -> Self {
        Self { x, y, z }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strides() {
        let s = Shape::from([2, 3, 4]);
        assert_eq!(s.strides(), vec![12, 4, 1]);
        assert_eq!(s.n_elements(), 24);
    }

    #[test]
    fn test_remove_dim() {
        let s = Shape::from([2, 3, 4]);
        assert_eq!(s.remove_dim(1), Shape::from([2, 4]));
        assert_eq!(Shape::from([5]).remove_dim(0), Shape::from([1]));
    }

    #[test]
    fn test_validate() {
        assert!(Shape::from([2, 0]).validate().is_err());
        assert!(Shape::from([128, 256]).validate().is_ok());
    }
}
