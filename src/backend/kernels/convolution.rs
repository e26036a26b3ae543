use super::{KernelResult, dims4};
use crate::graph::Window;
use ndarray::{Array2, ArrayD, ArrayView2, IxDyn};

/// Geometry of one convolution, all in NHWC / `[D, k, k, C]`.
struct ConvShape {
    batch: usize,
    in_h: usize,
    in_w: usize,
    channels: usize,
    depth: usize,
    out_h: usize,
    out_w: usize,
    window: Window,
}

impl ConvShape {
    fn new(input: &[usize], filter: &[usize], window: Window) -> Result<Self, String> {
        let (batch, in_h, in_w, channels) = dims4(input, "convolution input")?;
        let (depth, kh, kw, fc) = dims4(filter, "convolution filter")?;
        if kh != window.kernel || kw != window.kernel || fc != channels {
            return Err(format!(
                "filter {filter:?} does not fit input {input:?} with {window}"
            ));
        }
        let (out_h, out_w) = match (window.output_extent(in_h), window.output_extent(in_w)) {
            (Some(h), Some(w)) => (h, w),
            _ => return Err(format!("window {window} does not fit input {input:?}")),
        };
        Ok(Self {
            batch,
            in_h,
            in_w,
            channels,
            depth,
            out_h,
            out_w,
            window,
        })
    }

    /// Rows of the patch matrix: one per output pixel.
    fn patches(&self) -> usize {
        self.batch * self.out_h * self.out_w
    }

    /// Columns of the patch matrix: one per filter element.
    fn patch_len(&self) -> usize {
        self.window.kernel * self.window.kernel * self.channels
    }

    /// Visit every (patch row, patch column, input offset) triple that falls
    /// inside the unpadded input.
    fn for_each_tap(&self, mut f: impl FnMut(usize, usize, usize)) {
        let k = self.window.kernel;
        let pad = self.window.pad as isize;
        for b in 0..self.batch {
            for oy in 0..self.out_h {
                for ox in 0..self.out_w {
                    let row = (b * self.out_h + oy) * self.out_w + ox;
                    for ky in 0..k {
                        let y = (oy * self.window.stride + ky) as isize - pad;
                        if y < 0 || y >= self.in_h as isize {
                            continue;
                        }
                        for kx in 0..k {
                            let x = (ox * self.window.stride + kx) as isize - pad;
                            if x < 0 || x >= self.in_w as isize {
                                continue;
                            }
                            let base = ((b * self.in_h + y as usize) * self.in_w + x as usize)
                                * self.channels;
                            let col = (ky * k + kx) * self.channels;
                            for c in 0..self.channels {
                                f(row, col + c, base + c);
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Convert image patches to a `[N*OH*OW, k*k*C]` matrix (im2col), so the
/// convolution becomes one matrix product. Padding taps stay zero.
fn im2col(input: &ArrayD<f32>, shape: &ConvShape) -> Result<Array2<f32>, String> {
    let data = input.as_standard_layout();
    let src = data.as_slice().ok_or("input data not contiguous")?;
    let cols = shape.patch_len();
    let mut out = vec![0.0f32; shape.patches() * cols];
    shape.for_each_tap(|row, col, offset| out[row * cols + col] = src[offset]);
    Array2::from_shape_vec((shape.patches(), cols), out)
        .map_err(|e| format!("failed to build im2col matrix: {e}"))
}

/// Scatter-add a patch matrix back into an NHWC image (col2im).
fn col2im(cols: &Array2<f32>, shape: &ConvShape) -> KernelResult {
    let data = cols.as_standard_layout();
    let src = data.as_slice().ok_or("patch matrix not contiguous")?;
    let width = shape.patch_len();
    let mut out = vec![0.0f32; shape.batch * shape.in_h * shape.in_w * shape.channels];
    shape.for_each_tap(|row, col, offset| out[offset] += src[row * width + col]);
    ArrayD::from_shape_vec(
        IxDyn(&[shape.batch, shape.in_h, shape.in_w, shape.channels]),
        out,
    )
    .map_err(|e| format!("failed to build image: {e}"))
}

fn filter_matrix(filter: &ArrayD<f32>, shape: &ConvShape) -> Result<Array2<f32>, String> {
    filter
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((shape.depth, shape.patch_len()))
        .map_err(|e| format!("filter reshape failed: {e}"))
}

fn grad_matrix(out_grad: &ArrayD<f32>, shape: &ConvShape) -> Result<Array2<f32>, String> {
    let expected = [shape.batch, shape.out_h, shape.out_w, shape.depth];
    if out_grad.shape() != expected {
        return Err(format!(
            "output gradient {:?} does not match {expected:?}",
            out_grad.shape()
        ));
    }
    out_grad
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((shape.patches(), shape.depth))
        .map_err(|e| format!("gradient reshape failed: {e}"))
}

/// 2D convolution over NHWC input with a `[D, k, k, C]` filter.
pub fn convolution(
    input: &ArrayD<f32>,
    filter: &ArrayD<f32>,
    bias: &ArrayD<f32>,
    window: Window,
) -> KernelResult {
    let shape = ConvShape::new(input.shape(), filter.shape(), window)?;
    if bias.len() != shape.depth {
        return Err(format!("bias {:?} does not match depth {}", bias.shape(), shape.depth));
    }
    let cols = im2col(input, &shape)?;
    let filter = filter_matrix(filter, &shape)?;
    let filter_t: ArrayView2<f32> = filter.t();

    // [N*OH*OW, kkC] x [kkC, D]
    let mut out = cols.dot(&filter_t);
    for mut row in out.rows_mut() {
        row.iter_mut().zip(bias.iter()).for_each(|(o, &b)| *o += b);
    }
    out.into_dyn()
        .into_shape_with_order(IxDyn(&[shape.batch, shape.out_h, shape.out_w, shape.depth]))
        .map_err(|e| format!("failed to build convolution output: {e}"))
}

/// Gradient with respect to the input: `col2im(dest_grad x filter)`.
pub fn convolution_input_grad(
    input_dims: &[usize],
    filter: &ArrayD<f32>,
    out_grad: &ArrayD<f32>,
    window: Window,
) -> KernelResult {
    let shape = ConvShape::new(input_dims, filter.shape(), window)?;
    let grad = grad_matrix(out_grad, &shape)?;
    let filter = filter_matrix(filter, &shape)?;
    let cols = grad.dot(&filter);
    col2im(&cols, &shape)
}

/// Gradient with respect to the filter: `dest_grad^T x im2col(input)`.
pub fn convolution_filter_grad(
    input: &ArrayD<f32>,
    filter_dims: &[usize],
    out_grad: &ArrayD<f32>,
    window: Window,
) -> KernelResult {
    let shape = ConvShape::new(input.shape(), filter_dims, window)?;
    let grad = grad_matrix(out_grad, &shape)?;
    let cols = im2col(input, &shape)?;
    grad.t()
        .dot(&cols)
        .into_dyn()
        .into_shape_with_order(IxDyn(filter_dims))
        .map_err(|e| format!("filter gradient reshape failed: {e}"))
}
