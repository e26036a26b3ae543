use crate::graph::{LrnParams, SgdParams, Window};
use crate::ir::storage::Value;
use std::fmt;

/// How an instruction accesses an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
    InOut,
}

impl Direction {
    pub fn reads(self) -> bool {
        matches!(self, Direction::In | Direction::InOut)
    }

    pub fn writes(self) -> bool {
        matches!(self, Direction::Out | Direction::InOut)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "in"),
            Direction::Out => write!(f, "out"),
            Direction::InOut => write!(f, "inout"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Operand {
    pub value: Value,
    pub dir: Direction,
}

impl Operand {
    pub fn input(value: Value) -> Self {
        Self {
            value,
            dir: Direction::In,
        }
    }

    pub fn output(value: Value) -> Self {
        Self {
            value,
            dir: Direction::Out,
        }
    }

    pub fn in_out(value: Value) -> Self {
        Self {
            value,
            dir: Direction::InOut,
        }
    }
}

/// Instruction opcodes with their scalar parameters.
///
/// Operand order is fixed per kind: written operands come first, then the
/// inputs in the order listed on each variant.
#[derive(Debug, Clone, PartialEq)]
pub enum InstrKind {
    /// dest, src
    Copy,
    /// dest
    Splat(f32),
    /// dest, lhs, rhs
    ElementAdd,
    ElementSub,
    ElementMul,
    ElementDiv,
    ElementMax,
    ElementMin,
    /// dest, cond, lhs, rhs
    ElementSelect,
    /// dest, src
    Relu,
    Sigmoid,
    Tanh,
    /// dest, lhs, rhs
    MatMul,
    /// dest, src, weights, bias
    FullyConnected,
    /// dest, batch, slice
    BatchedAdd,
    /// dest, batch
    BatchedReduceAdd,
    /// dest, src, filter, bias
    Convolution(Window),
    /// dest, src
    PoolMax(Window),
    PoolAvg(Window),
    /// dest, src, selected
    SoftMax,
    /// dest, data, indices
    Gather,
    /// dest, src
    Transpose(Vec<usize>),
    Reshape,
    Quantize,
    Dequantize,
    RescaleQuantized,
    LocalResponseNormalization(LrnParams),
    /// src_grad, dest, dest_grad
    ReluGrad,
    /// src_grad, dest, selected
    SoftMaxGrad,
    /// src_grad, filter, dest_grad
    ConvolutionInputGrad(Window),
    /// filter_grad, src, dest_grad
    ConvolutionFilterGrad(Window),
    /// src_grad, src, dest_grad
    PoolMaxGrad(Window),
    /// src_grad, dest_grad
    PoolAvgGrad(Window),
    /// src_grad, src, dest, dest_grad
    LocalResponseNormalizationGrad(LrnParams),
    /// weight (inout), gradient, velocity (inout)
    Sgd(SgdParams),
}

use Direction::{In, InOut, Out};

impl InstrKind {
    /// Expected operand directions, in order.
    pub fn layout(&self) -> &'static [Direction] {
        use InstrKind::*;
        match self {
            Splat(_) => &[Out],
            Copy | Relu | Sigmoid | Tanh | BatchedReduceAdd | PoolMax(_) | PoolAvg(_)
            | Transpose(_) | Reshape | Quantize | Dequantize | RescaleQuantized
            | LocalResponseNormalization(_) | PoolAvgGrad(_) => &[Out, In],
            ElementAdd | ElementSub | ElementMul | ElementDiv | ElementMax | ElementMin
            | MatMul | BatchedAdd | SoftMax | Gather | ReluGrad | SoftMaxGrad
            | ConvolutionInputGrad(_) | ConvolutionFilterGrad(_) | PoolMaxGrad(_) => {
                &[Out, In, In]
            }
            ElementSelect | FullyConnected | Convolution(_) | LocalResponseNormalizationGrad(_) => {
                &[Out, In, In, In]
            }
            Sgd(_) => &[InOut, In, InOut],
        }
    }

    pub fn name(&self) -> &'static str {
        use InstrKind::*;
        match self {
            Copy => "copy",
            Splat(_) => "splat",
            ElementAdd => "element_add",
            ElementSub => "element_sub",
            ElementMul => "element_mul",
            ElementDiv => "element_div",
            ElementMax => "element_max",
            ElementMin => "element_min",
            ElementSelect => "element_select",
            Relu => "relu",
            Sigmoid => "sigmoid",
            Tanh => "tanh",
            MatMul => "matmul",
            FullyConnected => "fully_connected",
            BatchedAdd => "batched_add",
            BatchedReduceAdd => "batched_reduce_add",
            Convolution(_) => "convolution",
            PoolMax(_) => "pool_max",
            PoolAvg(_) => "pool_avg",
            SoftMax => "softmax",
            Gather => "gather",
            Transpose(_) => "transpose",
            Reshape => "reshape",
            Quantize => "quantize",
            Dequantize => "dequantize",
            RescaleQuantized => "rescale_quantized",
            LocalResponseNormalization(_) => "local_response_normalization",
            ReluGrad => "relu_grad",
            SoftMaxGrad => "softmax_grad",
            ConvolutionInputGrad(_) => "convolution_input_grad",
            ConvolutionFilterGrad(_) => "convolution_filter_grad",
            PoolMaxGrad(_) => "pool_max_grad",
            PoolAvgGrad(_) => "pool_avg_grad",
            LocalResponseNormalizationGrad(_) => "local_response_normalization_grad",
            Sgd(_) => "sgd",
        }
    }

    /// Initializers may define a constant location once.
    pub fn is_initializer(&self) -> bool {
        matches!(self, InstrKind::Splat(_))
    }
}

impl fmt::Display for InstrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use InstrKind::*;
        match self {
            Splat(v) => write!(f, "splat({v})"),
            Convolution(w) | PoolMax(w) | PoolAvg(w) | ConvolutionInputGrad(w)
            | ConvolutionFilterGrad(w) | PoolMaxGrad(w) | PoolAvgGrad(w) => {
                write!(f, "{}({w})", self.name())
            }
            Transpose(shuffle) => write!(f, "transpose({shuffle:?})"),
            LocalResponseNormalization(p) | LocalResponseNormalizationGrad(p) => write!(
                f,
                "{}(half_window={}, alpha={}, beta={}, k={})",
                self.name(),
                p.half_window,
                p.alpha,
                p.beta,
                p.k
            ),
            Sgd(p) => write!(
                f,
                "sgd(lr={}, momentum={}, l2={})",
                p.learning_rate, p.momentum, p.l2_decay
            ),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// One step of a compiled function.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub name: String,
    pub kind: InstrKind,
    pub operands: Vec<Operand>,
}

impl Instruction {
    /// Build an instruction whose operand directions follow the kind's layout.
    /// Extra or missing values are reported later by `IrFunction::push`.
    pub fn new(name: impl Into<String>, kind: InstrKind, values: &[Value]) -> Self {
        let layout = kind.layout();
        let operands = values
            .iter()
            .enumerate()
            .map(|(i, &value)| Operand {
                value,
                dir: layout.get(i).copied().unwrap_or(In),
            })
            .collect();
        Self {
            name: name.into(),
            kind,
            operands,
        }
    }

    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.operands.iter().map(|op| op.value)
    }

    pub fn reads(&self, value: Value) -> bool {
        self.operands
            .iter()
            .any(|op| op.value == value && op.dir.reads())
    }

    pub fn writes(&self, value: Value) -> bool {
        self.operands
            .iter()
            .any(|op| op.value == value && op.dir.writes())
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let operands: Vec<String> = self
            .operands
            .iter()
            .map(|op| format!("{}:{}", op.value, op.dir))
            .collect();
        write!(f, "{} = {} {}", self.name, self.kind, operands.join(", "))
    }
}
