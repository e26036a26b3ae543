use super::{KernelResult, as_index, dims4};
use crate::graph::LrnParams;
use ndarray::{ArrayD, Axis, Ix2};

/// Row-wise softmax over `[N, C]`, shifted by the row maximum for stability.
pub fn softmax(input: &ArrayD<f32>) -> KernelResult {
    let rows = input
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| format!("softmax input must be 2D: {e}"))?;
    let mut out = rows.to_owned();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
        row.mapv_inplace(|x| (x - max).exp());
        let sum = row.sum();
        row.mapv_inplace(|x| x / sum);
    }
    Ok(out.into_dyn())
}

/// Gradient of cross-entropy through softmax: `output - onehot(selected)`.
pub fn softmax_grad(output: &ArrayD<f32>, selected: &ArrayD<f32>) -> KernelResult {
    let mut grad = output
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|e| format!("softmax output must be 2D: {e}"))?
        .to_owned();
    let classes = grad.ncols();
    if selected.len() != grad.nrows() {
        return Err(format!(
            "{} labels for {} rows",
            selected.len(),
            grad.nrows()
        ));
    }
    for (mut row, &label) in grad.axis_iter_mut(Axis(0)).zip(selected.iter()) {
        row[as_index(label, classes)?] -= 1.0;
    }
    Ok(grad.into_dyn())
}

/// Per-element normalizer `k + alpha / window * sum(x^2)` over the channel
/// window centred on each element, NHWC.
fn lrn_scale(input: &ArrayD<f32>, params: &LrnParams) -> Result<Vec<f32>, String> {
    let (n, h, w, c) = dims4(input.shape(), "normalization input")?;
    let data = input.as_standard_layout();
    let src = data.as_slice().ok_or("input data not contiguous")?;
    let window = (2 * params.half_window + 1) as f32;
    let normed_alpha = params.alpha / window;

    let mut scale = vec![0.0f32; src.len()];
    for pixel in 0..n * h * w {
        let base = pixel * c;
        for ch in 0..c {
            let lo = ch.saturating_sub(params.half_window);
            let hi = (ch + params.half_window).min(c - 1);
            let square_sum: f32 = src[base + lo..=base + hi].iter().map(|x| x * x).sum();
            scale[base + ch] = params.k + normed_alpha * square_sum;
        }
    }
    Ok(scale)
}

/// Local response normalization across channels:
/// `out = x * scale^-beta`.
pub fn local_response_normalization(input: &ArrayD<f32>, params: &LrnParams) -> KernelResult {
    let scale = lrn_scale(input, params)?;
    let mut out = input.as_standard_layout().into_owned();
    out.iter_mut()
        .zip(scale.iter())
        .for_each(|(x, &s)| *x *= s.powf(-params.beta));
    Ok(out)
}

/// Input gradient of local response normalization:
/// `g_x[c] = g[c] * scale[c]^-beta
///           - 2 * beta * alpha / window * x[c] * sum_{c' near c} g[c'] * out[c'] / scale[c']`.
pub fn local_response_normalization_grad(
    input: &ArrayD<f32>,
    output: &ArrayD<f32>,
    out_grad: &ArrayD<f32>,
    params: &LrnParams,
) -> KernelResult {
    if input.shape() != output.shape() || input.shape() != out_grad.shape() {
        return Err(format!(
            "input {:?}, output {:?} and gradient {:?} differ",
            input.shape(),
            output.shape(),
            out_grad.shape()
        ));
    }
    let (_, _, _, c) = dims4(input.shape(), "normalization input")?;
    let scale = lrn_scale(input, params)?;
    let x = input.as_standard_layout();
    let y = output.as_standard_layout();
    let g = out_grad.as_standard_layout();
    let (x, y, g) = (
        x.as_slice().ok_or("input data not contiguous")?,
        y.as_slice().ok_or("output data not contiguous")?,
        g.as_slice().ok_or("gradient data not contiguous")?,
    );
    let normed_alpha = params.alpha / (2 * params.half_window + 1) as f32;

    // g[c'] * out[c'] / scale[c'] is shared by every channel in the window.
    let ratio: Vec<f32> = (0..x.len()).map(|i| g[i] * y[i] / scale[i]).collect();

    let mut result = vec![0.0f32; x.len()];
    for pixel in 0..x.len() / c.max(1) {
        let base = pixel * c;
        for ch in 0..c {
            let lo = ch.saturating_sub(params.half_window);
            let hi = (ch + params.half_window).min(c - 1);
            let window_sum: f32 = ratio[base + lo..=base + hi].iter().sum();
            let i = base + ch;
            result[i] = g[i] * scale[i].powf(-params.beta)
                - 2.0 * normed_alpha * params.beta * x[i] * window_sum;
        }
    }
    ArrayD::from_shape_vec(input.raw_dim(), result)
        .map_err(|e| format!("failed to build input gradient: {e}"))
}
