use crate::backend::Backend;
use crate::backend::kernels::quantization::{real, store};
use crate::backend::kernels::{
    KernelResult, convolution, elementwise, matrix, normalization, pooling, sgd,
};
use crate::error::{Error, Result};
use crate::ir::function::resolve;
use crate::ir::{InstrKind, Instruction, IrFunction, StorageArena, Value};
use crate::tensor::Tensor;
use ndarray::ArrayD;
use std::borrow::Cow;
use tracing::trace;

/// Reference backend: executes instructions one at a time on the CPU.
#[derive(Debug, Default)]
pub struct Interpreter {
    executed: u64,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of instructions executed since creation.
    pub fn executed(&self) -> u64 {
        self.executed
    }
}

impl Backend for Interpreter {
    fn name(&self) -> &str {
        "interpreter"
    }

    fn execute(&mut self, function: &mut IrFunction, weights: &mut StorageArena) -> Result<()> {
        let (instrs, activations) = function.split_mut();
        for instr in instrs {
            let results = evaluate(instr, activations, weights)?;
            write_results(instr, results, activations, weights)?;
            trace!(instr = %instr, "executed");
            self.executed += 1;
        }
        Ok(())
    }
}

/// Compute the values of every written operand of `instr`, in operand order.
fn evaluate(
    instr: &Instruction,
    activations: &StorageArena,
    weights: &StorageArena,
) -> Result<Vec<ArrayD<f32>>> {
    let tensors: Vec<&Tensor> = instr
        .operands
        .iter()
        .map(|op| resolve(activations, weights, op.value).map(|loc| loc.payload()))
        .collect::<Result<_>>()?;
    if tensors.len() != instr.kind.layout().len() {
        return Err(Error::kernel(&instr.name, "operand count does not match the kind"));
    }
    let real_values: Vec<Cow<'_, ArrayD<f32>>> = tensors.iter().map(|t| real(t)).collect();
    let r = |i: usize| real_values[i].as_ref();
    let dest_dims = tensors[0].dims();

    let single = |value: KernelResult| -> Result<Vec<ArrayD<f32>>> {
        value
            .map(|v| vec![v])
            .map_err(|reason| Error::kernel(&instr.name, reason))
    };

    use InstrKind::*;
    match &instr.kind {
        Copy => single(Ok(r(1).clone())),
        Splat(value) => single(Ok(elementwise::splat(dest_dims, *value))),
        ElementAdd => single(elementwise::add(r(1), r(2))),
        ElementSub => single(elementwise::sub(r(1), r(2))),
        ElementMul => single(elementwise::mul(r(1), r(2))),
        ElementDiv => single(elementwise::div(r(1), r(2))),
        ElementMax => single(elementwise::max(r(1), r(2))),
        ElementMin => single(elementwise::min(r(1), r(2))),
        ElementSelect => single(elementwise::select(r(1), r(2), r(3))),
        Relu => single(Ok(elementwise::relu(r(1)))),
        Sigmoid => single(Ok(elementwise::sigmoid(r(1)))),
        Tanh => single(Ok(elementwise::tanh(r(1)))),
        MatMul => single(matrix::matmul(r(1), r(2))),
        FullyConnected => single(matrix::fully_connected(r(1), r(2), r(3))),
        BatchedAdd => single(matrix::batched_add(r(1), r(2))),
        BatchedReduceAdd => single(matrix::batched_reduce_add(r(1))),
        Convolution(window) => single(convolution::convolution(r(1), r(2), r(3), *window)),
        PoolMax(window) => single(pooling::pool_max(r(1), *window)),
        PoolAvg(window) => single(pooling::pool_avg(r(1), *window)),
        SoftMax => single(normalization::softmax(r(1))),
        Gather => single(matrix::gather(r(1), r(2))),
        Transpose(shuffle) => single(matrix::transpose(r(1), shuffle)),
        Reshape => single(matrix::reshape(r(1), dest_dims)),
        // Conversions happen in `real`/`store`.
        Quantize | Dequantize | RescaleQuantized => single(Ok(r(1).clone())),
        LocalResponseNormalization(params) => {
            single(normalization::local_response_normalization(r(1), params))
        }
        ReluGrad => single(elementwise::relu_grad(r(1), r(2))),
        SoftMaxGrad => single(normalization::softmax_grad(r(1), r(2))),
        ConvolutionInputGrad(window) => single(convolution::convolution_input_grad(
            dest_dims,
            r(1),
            r(2),
            *window,
        )),
        ConvolutionFilterGrad(window) => single(convolution::convolution_filter_grad(
            r(1),
            dest_dims,
            r(2),
            *window,
        )),
        PoolMaxGrad(window) => single(pooling::pool_max_grad(r(1), r(2), *window)),
        PoolAvgGrad(window) => single(pooling::pool_avg_grad(dest_dims, r(1), *window)),
        LocalResponseNormalizationGrad(params) => single(
            normalization::local_response_normalization_grad(r(1), r(2), r(3), params),
        ),
        Sgd(params) => sgd::sgd(r(0), r(1), r(2), params)
            .map(|(weight, velocity)| vec![weight, velocity])
            .map_err(|reason| Error::kernel(&instr.name, reason)),
    }
}

/// Store results into the written operands, converting to each destination's
/// element representation. Constant locations are refused here too, so a
/// function whose tags changed after lowering cannot corrupt frozen storage.
fn write_results(
    instr: &Instruction,
    results: Vec<ArrayD<f32>>,
    activations: &mut StorageArena,
    weights: &mut StorageArena,
) -> Result<()> {
    let written = instr.operands.iter().filter(|op| op.dir.writes());
    for (op, values) in written.zip(results) {
        let location = match op.value {
            Value::Weight(id) => weights.get_mut(id)?,
            Value::Activation(id) => activations.get_mut(id)?,
        };
        let initializer = instr.kind.is_initializer() && matches!(op.value, Value::Activation(_));
        if location.is_constant() && !initializer {
            return Err(Error::ConstantWrite {
                instr: instr.name.clone(),
                location: location.name().to_string(),
            });
        }
        if values.shape() != location.ty().dims() {
            return Err(Error::kernel(
                &instr.name,
                format!(
                    "result of shape {:?} does not fit '{}' of type {}",
                    values.shape(),
                    location.name(),
                    location.ty()
                ),
            ));
        }
        let stored = store(values, location.ty());
        *location.payload_mut().data_mut() = stored;
    }
    Ok(())
}
