use super::{KernelResult, dims4};
use crate::graph::Window;
use ndarray::{ArrayD, IxDyn};

/// Trait that defines pooling operations.
/// This lets max and average pooling share the same window walk.
trait PoolingOp {
    /// Initial value for the accumulator.
    fn init_value() -> f32;

    /// Fold one in-bounds input value into the accumulator.
    fn accumulate(accumulator: &mut f32, value: f32);

    /// Turn the accumulator into the output value. `kernel_area` counts every
    /// tap of the window, padding included.
    fn finalize(accumulator: f32, kernel_area: usize) -> f32;
}

/// Max pooling. Padding taps never win.
struct MaxPoolOp;

impl PoolingOp for MaxPoolOp {
    fn init_value() -> f32 {
        f32::MIN
    }

    fn accumulate(accumulator: &mut f32, value: f32) {
        if value > *accumulator {
            *accumulator = value;
        }
    }

    fn finalize(accumulator: f32, _kernel_area: usize) -> f32 {
        accumulator
    }
}

/// Average pooling. Padding taps count as zeros.
struct AvgPoolOp;

impl PoolingOp for AvgPoolOp {
    fn init_value() -> f32 {
        0.0
    }

    fn accumulate(accumulator: &mut f32, value: f32) {
        *accumulator += value;
    }

    fn finalize(accumulator: f32, kernel_area: usize) -> f32 {
        accumulator / kernel_area as f32
    }
}

/// NHWC pooling geometry.
struct PoolShape {
    batch: usize,
    in_h: usize,
    in_w: usize,
    channels: usize,
    out_h: usize,
    out_w: usize,
    window: Window,
}

impl PoolShape {
    fn new(input: &[usize], window: Window) -> Result<Self, String> {
        let (batch, in_h, in_w, channels) = dims4(input, "pooling input")?;
        let (out_h, out_w) = match (window.output_extent(in_h), window.output_extent(in_w)) {
            (Some(h), Some(w)) => (h, w),
            _ => return Err(format!("window {window} does not fit input {input:?}")),
        };
        Ok(Self {
            batch,
            in_h,
            in_w,
            channels,
            out_h,
            out_w,
            window,
        })
    }

    fn output_dims(&self) -> [usize; 4] {
        [self.batch, self.out_h, self.out_w, self.channels]
    }

    fn input_len(&self) -> usize {
        self.batch * self.in_h * self.in_w * self.channels
    }

    /// Flat input offsets covered by the window of output pixel
    /// `(b, oy, ox)` for channel `c`, skipping padding.
    fn taps(&self, b: usize, oy: usize, ox: usize, c: usize) -> impl Iterator<Item = usize> + '_ {
        let k = self.window.kernel;
        let pad = self.window.pad as isize;
        let y0 = (oy * self.window.stride) as isize - pad;
        let x0 = (ox * self.window.stride) as isize - pad;
        (0..k * k).filter_map(move |tap| {
            let y = y0 + (tap / k) as isize;
            let x = x0 + (tap % k) as isize;
            if y < 0 || x < 0 || y >= self.in_h as isize || x >= self.in_w as isize {
                return None;
            }
            Some(((b * self.in_h + y as usize) * self.in_w + x as usize) * self.channels + c)
        })
    }

    /// Visit every output element with its flat output offset.
    fn for_each_output(&self, mut f: impl FnMut(usize, usize, usize, usize, usize)) {
        for b in 0..self.batch {
            for oy in 0..self.out_h {
                for ox in 0..self.out_w {
                    for c in 0..self.channels {
                        let out = ((b * self.out_h + oy) * self.out_w + ox) * self.channels + c;
                        f(out, b, oy, ox, c);
                    }
                }
            }
        }
    }
}

/// Generic 2D pooling implementation used by both max and average pooling.
fn pool2d_impl<Op: PoolingOp>(input: &ArrayD<f32>, window: Window) -> KernelResult {
    let shape = PoolShape::new(input.shape(), window)?;
    let data = input.as_standard_layout();
    let src = data.as_slice().ok_or("input data not contiguous")?;
    let area = window.kernel * window.kernel;

    let [n, oh, ow, c] = shape.output_dims();
    let mut out = vec![0.0f32; n * oh * ow * c];
    shape.for_each_output(|o, b, oy, ox, ch| {
        let mut accumulator = Op::init_value();
        for offset in shape.taps(b, oy, ox, ch) {
            Op::accumulate(&mut accumulator, src[offset]);
        }
        out[o] = Op::finalize(accumulator, area);
    });

    ArrayD::from_shape_vec(IxDyn(&shape.output_dims()), out)
        .map_err(|e| format!("failed to create pooled output: {e}"))
}

pub fn pool_max(input: &ArrayD<f32>, window: Window) -> KernelResult {
    pool2d_impl::<MaxPoolOp>(input, window)
}

pub fn pool_avg(input: &ArrayD<f32>, window: Window) -> KernelResult {
    pool2d_impl::<AvgPoolOp>(input, window)
}

fn check_grad(out_grad: &ArrayD<f32>, shape: &PoolShape) -> Result<(), String> {
    if out_grad.shape() != shape.output_dims() {
        return Err(format!(
            "output gradient {:?} does not match pooled shape {:?}",
            out_grad.shape(),
            shape.output_dims()
        ));
    }
    Ok(())
}

/// Routes each output gradient to the first input position holding the
/// window's maximum.
pub fn pool_max_grad(input: &ArrayD<f32>, out_grad: &ArrayD<f32>, window: Window) -> KernelResult {
    let shape = PoolShape::new(input.shape(), window)?;
    check_grad(out_grad, &shape)?;
    let data = input.as_standard_layout();
    let src = data.as_slice().ok_or("input data not contiguous")?;
    let grad = out_grad.as_standard_layout();
    let g = grad.as_slice().ok_or("gradient data not contiguous")?;

    let mut result = vec![0.0f32; shape.input_len()];
    shape.for_each_output(|o, b, oy, ox, ch| {
        let mut best: Option<usize> = None;
        for offset in shape.taps(b, oy, ox, ch) {
            if best.is_none_or(|i| src[offset] > src[i]) {
                best = Some(offset);
            }
        }
        if let Some(i) = best {
            result[i] += g[o];
        }
    });

    ArrayD::from_shape_vec(IxDyn(input.shape()), result)
        .map_err(|e| format!("failed to create input gradient: {e}"))
}

/// Spreads each output gradient uniformly over its window (`1 / k^2` per tap).
pub fn pool_avg_grad(input_dims: &[usize], out_grad: &ArrayD<f32>, window: Window) -> KernelResult {
    let shape = PoolShape::new(input_dims, window)?;
    check_grad(out_grad, &shape)?;
    let grad = out_grad.as_standard_layout();
    let g = grad.as_slice().ok_or("gradient data not contiguous")?;
    let scale = 1.0 / (window.kernel * window.kernel) as f32;

    let mut result = vec![0.0f32; shape.input_len()];
    shape.for_each_output(|o, b, oy, ox, ch| {
        for offset in shape.taps(b, oy, ox, ch) {
            result[offset] += g[o] * scale;
        }
    });

    ArrayD::from_shape_vec(IxDyn(input_dims), result)
        .map_err(|e| format!("failed to create input gradient: {e}"))
}
