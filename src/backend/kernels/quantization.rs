//! Conversions between stored integers and real values.
//!
//! A quantized element stores `q` and represents `scale * (q - offset)`.
//! Kernels only ever see real values: the interpreter dequantizes operands on
//! the way in and requantizes results into the destination type on the way
//! out, which is all that `Quantize`, `Dequantize` and `RescaleQuantized` need.

use crate::tensor::{Tensor, Type};
use ndarray::ArrayD;
use std::borrow::Cow;

pub const INT8_MIN: f32 = -128.0;
pub const INT8_MAX: f32 = 127.0;

/// Real values of a tensor. Borrowed unless the tensor is quantized.
pub fn real(tensor: &Tensor) -> Cow<'_, ArrayD<f32>> {
    let ty = tensor.ty();
    if ty.is_quantized() {
        let (scale, offset) = (ty.scale, ty.offset as f32);
        Cow::Owned(tensor.data().mapv(|q| scale * (q - offset)))
    } else {
        Cow::Borrowed(tensor.data())
    }
}

/// Quantize one real value into `ty`.
pub fn quantize_value(value: f32, ty: &Type) -> f32 {
    (value / ty.scale + ty.offset as f32)
        .round()
        .clamp(INT8_MIN, INT8_MAX)
}

/// Convert real values into the stored representation of `ty`.
pub fn store(values: ArrayD<f32>, ty: &Type) -> ArrayD<f32> {
    if ty.is_quantized() {
        values.mapv(|x| quantize_value(x, ty))
    } else {
        values
    }
}
