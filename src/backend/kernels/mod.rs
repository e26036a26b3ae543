//! Reference CPU kernels used by the interpreter.
//!
//! Every kernel is a pure function from input arrays (real values, already
//! dequantized by the caller) to freshly allocated output arrays. Errors are
//! plain strings; the interpreter attaches the instruction name.

pub mod convolution;
pub mod elementwise;
pub mod matrix;
pub mod normalization;
pub mod pooling;
pub mod quantization;
pub mod sgd;

use ndarray::ArrayD;

pub type KernelResult = Result<ArrayD<f32>, String>;

/// Read an index element stored as `f32`.
pub(crate) fn as_index(value: f32, bound: usize) -> Result<usize, String> {
    if value < 0.0 || value.fract() != 0.0 || value as usize >= bound {
        return Err(format!("index {value} out of range 0..{bound}"));
    }
    Ok(value as usize)
}

/// Read a dimension by position, failing on rank mismatch instead of panicking.
pub(crate) fn dims4(shape: &[usize], what: &str) -> Result<(usize, usize, usize, usize), String> {
    match shape {
        [a, b, c, d] => Ok((*a, *b, *c, *d)),
        _ => Err(format!("{what} must be 4D, got {shape:?}")),
    }
}
