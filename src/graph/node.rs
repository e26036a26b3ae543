use crate::tensor::Type;
use std::fmt;

/// Id of a node inside its function. Nodes are stored in insertion order, so
/// the id is also the node's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Id of a variable inside its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub usize);

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A value consumed by a node: either a module variable (leaf) or the output
/// of another node of the same function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeRef {
    Variable(VarId),
    Node(NodeId),
}

impl From<VarId> for NodeRef {
    fn from(id: VarId) -> Self {
        NodeRef::Variable(id)
    }
}

impl From<NodeId> for NodeRef {
    fn from(id: NodeId) -> Self {
        NodeRef::Node(id)
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRef::Variable(v) => write!(f, "{v}"),
            NodeRef::Node(n) => write!(f, "{n}"),
        }
    }
}

/// Window parameters shared by convolution and pooling (square kernels,
/// NHWC layout).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Window {
    pub kernel: usize,
    pub stride: usize,
    pub pad: usize,
}

impl Window {
    pub fn new(kernel: usize, stride: usize, pad: usize) -> Self {
        Self {
            kernel,
            stride,
            pad,
        }
    }

    /// Output extent of one spatial dimension, or `None` when the window does
    /// not fit.
    pub fn output_extent(&self, input: usize) -> Option<usize> {
        if self.stride == 0 || self.kernel == 0 || input + 2 * self.pad < self.kernel {
            return None;
        }
        Some((input + 2 * self.pad - self.kernel) / self.stride + 1)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "k={}, s={}, p={}", self.kernel, self.stride, self.pad)
    }
}

/// Local response normalization parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LrnParams {
    pub half_window: usize,
    pub alpha: f32,
    pub beta: f32,
    pub k: f32,
}

/// SGD hyper-parameters baked into an update node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SgdParams {
    pub learning_rate: f32,
    pub momentum: f32,
    pub l2_decay: f32,
}

/// Operator of a node. The set is closed: every kind has exactly one lowering
/// rule (see `lower`) and at most one gradient rule (see `autodiff`).
///
/// Input conventions are listed per kind, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// input, weights `[K, D]`, bias `[D]`
    FullyConnected,
    /// lhs `[N, K]`, rhs `[K, M]`
    MatMul,
    /// batch `[N, ...]`, slice `[...]`
    BatchedAdd,
    /// batch `[N, ...]`
    BatchedReduceAdd,
    /// input NHWC, filter `[D, k, k, C]`, bias `[D]`
    Convolution(Window),
    /// input NHWC
    PoolMax(Window),
    /// input NHWC
    PoolAvg(Window),
    Relu,
    Sigmoid,
    Tanh,
    /// input `[N, C]`, selected labels `[N, 1]`
    SoftMax,
    /// input, expected
    Regression,
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    /// cond, lhs, rhs
    Select,
    Reshape(Vec<usize>),
    Transpose(Vec<usize>),
    /// data `[R, ...]`, indices
    Gather,
    /// input NHWC
    LocalResponseNormalization(LrnParams),
    Quantize,
    Dequantize,
    RescaleQuantized,
    /// no inputs; constant of the node's type
    Splat(f32),
    /// value, destination variable
    Save,
    /// Operator known to the graph layer but not to this compiler.
    Custom(String),

    // Nodes synthesized by differentiation.
    /// output of the relu, gradient of the output
    ReluGrad,
    /// output of the softmax, selected labels
    SoftMaxGrad,
    /// filter, gradient of the output
    ConvolutionInputGrad(Window),
    /// input, gradient of the output
    ConvolutionFilterGrad(Window),
    /// input, gradient of the output
    PoolMaxGrad(Window),
    /// gradient of the output
    PoolAvgGrad(Window),
    /// input, output, gradient of the output
    LocalResponseNormalizationGrad(LrnParams),
    /// Sum of gradient contributions, in input order.
    GradientSum,
    /// weight variable, gradient, velocity variable
    Sgd(SgdParams),
}

impl NodeKind {
    /// Whether the node produces a value (and therefore needs a resolved type).
    pub fn produces_value(&self) -> bool {
        !matches!(self, NodeKind::Save | NodeKind::Sgd(_))
    }

    /// Loss-producing terminal kinds: their gradient is derived from labels
    /// rather than from an incoming gradient.
    pub fn is_loss(&self) -> bool {
        matches!(self, NodeKind::SoftMax | NodeKind::Regression)
    }

    /// Expected number of inputs, `None` when variadic.
    pub fn arity(&self) -> Option<usize> {
        use NodeKind::*;
        match self {
            Splat(_) => Some(0),
            Relu | Sigmoid | Tanh | BatchedReduceAdd | Reshape(_) | Transpose(_) | PoolMax(_)
            | PoolAvg(_) | LocalResponseNormalization(_) | Quantize | Dequantize
            | RescaleQuantized | PoolAvgGrad(_) => Some(1),
            MatMul | BatchedAdd | SoftMax | Regression | Add | Sub | Mul | Div | Max | Min
            | Gather | Save | ReluGrad | SoftMaxGrad | ConvolutionInputGrad(_)
            | ConvolutionFilterGrad(_) | PoolMaxGrad(_) => Some(2),
            FullyConnected | Convolution(_) | Select | LocalResponseNormalizationGrad(_)
            | Sgd(_) => Some(3),
            GradientSum | Custom(_) => None,
        }
    }

    pub fn name(&self) -> &str {
        use NodeKind::*;
        match self {
            FullyConnected => "fully_connected",
            MatMul => "matmul",
            BatchedAdd => "batched_add",
            BatchedReduceAdd => "batched_reduce_add",
            Convolution(_) => "convolution",
            PoolMax(_) => "pool_max",
            PoolAvg(_) => "pool_avg",
            Relu => "relu",
            Sigmoid => "sigmoid",
            Tanh => "tanh",
            SoftMax => "softmax",
            Regression => "regression",
            Add => "add",
            Sub => "sub",
            Mul => "mul",
            Div => "div",
            Max => "max",
            Min => "min",
            Select => "select",
            Reshape(_) => "reshape",
            Transpose(_) => "transpose",
            Gather => "gather",
            LocalResponseNormalization(_) => "local_response_normalization",
            Quantize => "quantize",
            Dequantize => "dequantize",
            RescaleQuantized => "rescale_quantized",
            Splat(_) => "splat",
            Save => "save",
            Custom(name) => name.as_str(),
            ReluGrad => "relu_grad",
            SoftMaxGrad => "softmax_grad",
            ConvolutionInputGrad(_) => "convolution_input_grad",
            ConvolutionFilterGrad(_) => "convolution_filter_grad",
            PoolMaxGrad(_) => "pool_max_grad",
            PoolAvgGrad(_) => "pool_avg_grad",
            LocalResponseNormalizationGrad(_) => "local_response_normalization_grad",
            GradientSum => "gradient_sum",
            Sgd(_) => "sgd",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Convolution(w)
            | NodeKind::PoolMax(w)
            | NodeKind::PoolAvg(w)
            | NodeKind::ConvolutionInputGrad(w)
            | NodeKind::ConvolutionFilterGrad(w)
            | NodeKind::PoolMaxGrad(w)
            | NodeKind::PoolAvgGrad(w) => write!(f, "{}({w})", self.name()),
            NodeKind::Reshape(dims) => write!(f, "reshape({dims:?})"),
            NodeKind::Transpose(shuffle) => write!(f, "transpose({shuffle:?})"),
            NodeKind::Splat(v) => write!(f, "splat({v})"),
            NodeKind::Sgd(p) => write!(
                f,
                "sgd(lr={}, momentum={}, l2={})",
                p.learning_rate, p.momentum, p.l2_decay
            ),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// A node of a function.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: NodeId,
    /// Name, unique inside the function.
    pub name: String,
    pub kind: NodeKind,
    pub inputs: Vec<NodeRef>,
    /// Resolved output type; `None` for nodes that produce no value, or when
    /// the graph layer could not resolve it.
    pub ty: Option<Type>,
}
