use super::{KernelResult, as_index};
use ndarray::{Array2, ArrayD, ArrayView2, Axis, IxDyn};

fn as_matrix<'a>(array: &'a ArrayD<f32>, what: &str) -> Result<ArrayView2<'a, f32>, String> {
    array
        .view()
        .into_dimensionality()
        .map_err(|e| format!("{what} must be 2D, got {:?}: {e}", array.shape()))
}

/// Flatten everything but the leading dimension: `[N, ...] -> [N, K]`.
fn flatten_rows(array: &ArrayD<f32>) -> Result<Array2<f32>, String> {
    let n = array.shape().first().copied().unwrap_or(0);
    let k = if n == 0 { 0 } else { array.len() / n };
    array
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((n, k))
        .map_err(|e| format!("cannot flatten {:?} to [{n}, {k}]: {e}", array.shape()))
}

pub fn matmul(lhs: &ArrayD<f32>, rhs: &ArrayD<f32>) -> KernelResult {
    let a = as_matrix(lhs, "lhs")?;
    let b = as_matrix(rhs, "rhs")?;
    if a.ncols() != b.nrows() {
        return Err(format!(
            "cannot multiply {:?} by {:?}",
            lhs.shape(),
            rhs.shape()
        ));
    }
    Ok(a.dot(&b).into_dyn())
}

/// `flatten(src) x weights + bias`
pub fn fully_connected(
    src: &ArrayD<f32>,
    weights: &ArrayD<f32>,
    bias: &ArrayD<f32>,
) -> KernelResult {
    let x = flatten_rows(src)?;
    let w = as_matrix(weights, "weights")?;
    if x.ncols() != w.nrows() || bias.len() != w.ncols() {
        return Err(format!(
            "fully connected input {:?}, weights {:?} and bias {:?} disagree",
            src.shape(),
            weights.shape(),
            bias.shape()
        ));
    }
    let mut out = x.dot(&w);
    for mut row in out.axis_iter_mut(Axis(0)) {
        row.iter_mut().zip(bias.iter()).for_each(|(o, &b)| *o += b);
    }
    Ok(out.into_dyn())
}

/// Adds `slice` to every row of `batch`.
pub fn batched_add(batch: &ArrayD<f32>, slice: &ArrayD<f32>) -> KernelResult {
    if batch.ndim() == 0 || &batch.shape()[1..] != slice.shape() {
        return Err(format!(
            "slice {:?} does not match rows of {:?}",
            slice.shape(),
            batch.shape()
        ));
    }
    let mut out = batch.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        row += slice;
    }
    Ok(out)
}

/// Sum over the leading dimension.
pub fn batched_reduce_add(batch: &ArrayD<f32>) -> KernelResult {
    if batch.ndim() == 0 {
        return Err("cannot reduce a scalar".to_string());
    }
    Ok(batch.sum_axis(Axis(0)))
}

pub fn transpose(src: &ArrayD<f32>, shuffle: &[usize]) -> KernelResult {
    let mut seen = vec![false; src.ndim()];
    for &axis in shuffle {
        if axis >= seen.len() || seen[axis] {
            return Err(format!("{shuffle:?} is not a permutation of {:?}", src.shape()));
        }
        seen[axis] = true;
    }
    if shuffle.len() != src.ndim() {
        return Err(format!("{shuffle:?} is not a permutation of {:?}", src.shape()));
    }
    Ok(src
        .view()
        .permuted_axes(IxDyn(shuffle))
        .as_standard_layout()
        .into_owned())
}

pub fn reshape(src: &ArrayD<f32>, dims: &[usize]) -> KernelResult {
    src.as_standard_layout()
        .into_owned()
        .into_shape_with_order(IxDyn(dims))
        .map_err(|e| format!("cannot reshape {:?} to {dims:?}: {e}", src.shape()))
}

/// Rows of `data` selected by `indices`; output shape is
/// `indices.shape ++ data.shape[1..]`.
pub fn gather(data: &ArrayD<f32>, indices: &ArrayD<f32>) -> KernelResult {
    if data.ndim() == 0 {
        return Err("cannot gather from a scalar".to_string());
    }
    let rows = data.shape()[0];
    let mut values = Vec::with_capacity(indices.len() * (data.len() / rows.max(1)));
    for &index in indices.iter() {
        let row = as_index(index, rows)?;
        values.extend(data.index_axis(Axis(0), row).iter().copied());
    }
    let mut dims = indices.shape().to_vec();
    dims.extend_from_slice(&data.shape()[1..]);
    ArrayD::from_shape_vec(IxDyn(&dims), values)
        .map_err(|e| format!("failed to build gather output: {e}"))
}
