use super::KernelResult;
use ndarray::{ArrayD, IxDyn, Zip};

fn check_same_shape(lhs: &ArrayD<f32>, rhs: &ArrayD<f32>) -> Result<(), String> {
    if lhs.shape() != rhs.shape() {
        return Err(format!(
            "shape mismatch: {:?} vs {:?}",
            lhs.shape(),
            rhs.shape()
        ));
    }
    Ok(())
}

/// Apply `op` to matching elements of two arrays of the same shape.
pub fn binary<F>(lhs: &ArrayD<f32>, rhs: &ArrayD<f32>, op: F) -> KernelResult
where
    F: Fn(f32, f32) -> f32,
{
    check_same_shape(lhs, rhs)?;
    Ok(Zip::from(lhs).and(rhs).map_collect(|&a, &b| op(a, b)))
}

pub fn add(lhs: &ArrayD<f32>, rhs: &ArrayD<f32>) -> KernelResult {
    binary(lhs, rhs, |a, b| a + b)
}

pub fn sub(lhs: &ArrayD<f32>, rhs: &ArrayD<f32>) -> KernelResult {
    binary(lhs, rhs, |a, b| a - b)
}

pub fn mul(lhs: &ArrayD<f32>, rhs: &ArrayD<f32>) -> KernelResult {
    binary(lhs, rhs, |a, b| a * b)
}

// Division by zero follows IEEE semantics (inf / NaN), like every other
// float kernel here.
pub fn div(lhs: &ArrayD<f32>, rhs: &ArrayD<f32>) -> KernelResult {
    binary(lhs, rhs, |a, b| a / b)
}

pub fn max(lhs: &ArrayD<f32>, rhs: &ArrayD<f32>) -> KernelResult {
    binary(lhs, rhs, f32::max)
}

pub fn min(lhs: &ArrayD<f32>, rhs: &ArrayD<f32>) -> KernelResult {
    binary(lhs, rhs, f32::min)
}

/// `cond != 0 ? lhs : rhs`
pub fn select(cond: &ArrayD<f32>, lhs: &ArrayD<f32>, rhs: &ArrayD<f32>) -> KernelResult {
    check_same_shape(cond, lhs)?;
    check_same_shape(lhs, rhs)?;
    Ok(Zip::from(cond)
        .and(lhs)
        .and(rhs)
        .map_collect(|&c, &l, &r| if c != 0.0 { l } else { r }))
}

pub fn relu(input: &ArrayD<f32>) -> ArrayD<f32> {
    input.mapv(|x| x.max(0.0))
}

pub fn sigmoid(input: &ArrayD<f32>) -> ArrayD<f32> {
    input.mapv(|x| 1.0 / (1.0 + (-x).exp()))
}

pub fn tanh(input: &ArrayD<f32>) -> ArrayD<f32> {
    input.mapv(f32::tanh)
}

/// Gradient of relu, expressed through the relu output: the incoming gradient
/// passes where the output is positive.
pub fn relu_grad(output: &ArrayD<f32>, out_grad: &ArrayD<f32>) -> KernelResult {
    binary(output, out_grad, |y, g| if y > 0.0 { g } else { 0.0 })
}

pub fn splat(dims: &[usize], value: f32) -> ArrayD<f32> {
    ArrayD::from_elem(IxDyn(dims), value)
}
