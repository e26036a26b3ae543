use crate::error::{Error, Result};
use crate::tensor::types::{ElemKind, Type};
use ndarray::{ArrayD, Axis, IxDyn};

// Opaque buffer behind every variable and storage location.
// All element kinds are materialized in an `ArrayD<f32>`; quantized and index
// kinds hold integral values. The type travels with the data so that bindings
// and kernels can check it without looking at the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    ty: Type,
    data: ArrayD<f32>,
}

impl Tensor {
    /// Zero-filled tensor of the given type.
    pub fn zeros(ty: Type) -> Self {
        let data = ArrayD::zeros(IxDyn(&ty.dims));
        Self { ty, data }
    }

    /// Tensor of the given type with every element set to `value`.
    pub fn full(ty: Type, value: f32) -> Self {
        let data = ArrayD::from_elem(IxDyn(&ty.dims), value);
        Self { ty, data }
    }

    pub fn from_vec(ty: Type, values: Vec<f32>) -> Result<Self> {
        let expected = ty.size();
        if values.len() != expected {
            return Err(Error::msg(format!(
                "tensor of type {} needs {} elements, got {}",
                ty,
                expected,
                values.len()
            )));
        }
        let data = ArrayD::from_shape_vec(IxDyn(&ty.dims), values)
            .map_err(|e| Error::msg(format!("failed to build tensor: {e}")))?;
        Ok(Self { ty, data })
    }

    /// Float tensor from a flat vector, the common case in tests and callers.
    pub fn from_f32(dims: &[usize], values: Vec<f32>) -> Result<Self> {
        Self::from_vec(Type::float(dims), values)
    }

    /// Index tensor (labels, gather indices).
    pub fn from_indices(dims: &[usize], values: &[usize]) -> Result<Self> {
        Self::from_vec(
            Type::index(dims),
            values.iter().map(|&v| v as f32).collect(),
        )
    }

    /// Wrap an existing array; its shape must agree with `ty`.
    pub fn from_array(ty: Type, data: ArrayD<f32>) -> Result<Self> {
        if data.shape() != ty.dims.as_slice() {
            return Err(Error::msg(format!(
                "array of shape {:?} does not fit type {}",
                data.shape(),
                ty
            )));
        }
        Ok(Self { ty, data })
    }

    pub fn ty(&self) -> &Type {
        &self.ty
    }

    pub fn elem(&self) -> ElemKind {
        self.ty.elem
    }

    pub fn dims(&self) -> &[usize] {
        &self.ty.dims
    }

    pub fn size(&self) -> usize {
        self.ty.size()
    }

    pub fn data(&self) -> &ArrayD<f32> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ArrayD<f32> {
        &mut self.data
    }

    pub fn into_data(self) -> ArrayD<f32> {
        self.data
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }

    /// Element at a multi-dimensional index.
    pub fn at(&self, index: &[usize]) -> Option<f32> {
        self.data.get(IxDyn(index)).copied()
    }

    /// Set every element to `value`.
    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    /// Element-wise copy from a tensor of the same type.
    pub fn copy_from(&mut self, other: &Tensor) -> Result<()> {
        if self.ty != other.ty {
            return Err(Error::msg(format!(
                "cannot copy tensor of type {} into tensor of type {}",
                other.ty, self.ty
            )));
        }
        self.data.assign(&other.data);
        Ok(())
    }

    /// Copy `self.dims()[0]` consecutive rows of `src`, starting at row
    /// `start` and wrapping around the end of `src`, into this tensor.
    /// Both tensors must agree on everything but the leading dimension.
    pub fn copy_rows_from(&mut self, src: &Tensor, start: usize) -> Result<()> {
        if self.ty.rank() == 0
            || src.ty.rank() != self.ty.rank()
            || src.ty.dims[1..] != self.ty.dims[1..]
            || src.ty.elem != self.ty.elem
            || src.ty.scale != self.ty.scale
            || src.ty.offset != self.ty.offset
        {
            return Err(Error::msg(format!(
                "cannot slice rows of {} into {}",
                src.ty, self.ty
            )));
        }
        let total = src.ty.dims[0];
        if total == 0 {
            return Err(Error::msg("cannot slice rows of an empty tensor"));
        }
        let rows = self.ty.dims[0];
        for r in 0..rows {
            let src_row = src.data.index_axis(Axis(0), (start + r) % total);
            self.data.index_axis_mut(Axis(0), r).assign(&src_row);
        }
        Ok(())
    }
}
