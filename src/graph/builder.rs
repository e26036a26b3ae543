use crate::error::{Error, Result};
use crate::graph::module::{FunctionId, Module, TrainKind};
use crate::graph::node::{LrnParams, NodeId, NodeKind, NodeRef, VarId, Window};
use crate::ir::Visibility;
use crate::tensor::{ElemKind, Type};

fn invalid(node: &str, reason: impl Into<String>) -> Error {
    Error::InvalidNode {
        node: node.to_string(),
        reason: reason.into(),
    }
}

/// Node factory for one function of a module.
///
/// Every `create_*` method infers the output type from its inputs and rejects
/// incompatible shapes with `Error::InvalidNode`, so the nodes it produces are
/// always fully typed. Layers with parameters (fully connected, convolution)
/// create their trainable variables in the module as a side effect.
pub struct Builder<'a> {
    module: &'a mut Module,
    function: FunctionId,
}

impl Module {
    pub fn builder(&mut self, function: FunctionId) -> Result<Builder<'_>> {
        self.function(function)?;
        Ok(Builder {
            module: self,
            function,
        })
    }
}

impl<'a> Builder<'a> {
    pub fn module(&mut self) -> &mut Module {
        self.module
    }

    pub fn function_id(&self) -> FunctionId {
        self.function
    }

    /// Type of a value visible to this function.
    pub fn type_of(&self, value: impl Into<NodeRef>) -> Result<Type> {
        let function = self.module.function(self.function)?;
        self.module.type_of(function, value.into())
    }

    pub fn create_variable(
        &mut self,
        name: impl Into<String>,
        ty: Type,
        visibility: Visibility,
        train: TrainKind,
    ) -> Result<VarId> {
        self.module.create_variable(name, ty, visibility, train)
    }

    /// Raw node insertion. The caller is responsible for the output type.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        kind: NodeKind,
        inputs: Vec<NodeRef>,
        ty: Option<Type>,
    ) -> Result<NodeId> {
        for input in &inputs {
            if let NodeRef::Variable(id) = input {
                self.module.variable(*id)?;
            }
        }
        self.module
            .function_mut(self.function)?
            .add_node(name, kind, inputs, ty)
    }

    fn push(
        &mut self,
        name: &str,
        kind: NodeKind,
        inputs: Vec<NodeRef>,
        ty: Type,
    ) -> Result<NodeRef> {
        Ok(NodeRef::Node(self.add_node(name, kind, inputs, Some(ty))?))
    }

    // ---- Layers with parameters --------------------------------------------

    /// Fully connected layer with freshly created parameters: `<name>.weights`
    /// `[K, depth]` (Xavier, fan-in K) and `<name>.bias` `[depth]` (0.1).
    pub fn create_fully_connected(
        &mut self,
        name: &str,
        input: impl Into<NodeRef>,
        depth: usize,
    ) -> Result<NodeRef> {
        let input = input.into();
        let in_ty = self.type_of(input)?;
        if in_ty.rank() < 2 {
            return Err(invalid(name, format!("input {in_ty} needs a batch dimension")));
        }
        let k = in_ty.slice_size();
        let weights = self.module.create_variable(
            format!("{name}.weights"),
            Type::float(&[k, depth]),
            Visibility::Private,
            TrainKind::Xavier(k),
        )?;
        let bias = self.module.create_variable(
            format!("{name}.bias"),
            Type::float(&[depth]),
            Visibility::Private,
            TrainKind::Broadcast(0.1),
        )?;
        self.create_fully_connected_with(name, input, weights, bias)
    }

    /// Fully connected layer over existing parameters. The input is flattened
    /// to `[N, K]`; weights must be `[K, D]` and bias `[D]`.
    pub fn create_fully_connected_with(
        &mut self,
        name: &str,
        input: impl Into<NodeRef>,
        weights: impl Into<NodeRef>,
        bias: impl Into<NodeRef>,
    ) -> Result<NodeRef> {
        let (input, weights, bias) = (input.into(), weights.into(), bias.into());
        let in_ty = self.type_of(input)?;
        let w_ty = self.type_of(weights)?;
        let b_ty = self.type_of(bias)?;
        if in_ty.rank() < 2 || w_ty.rank() != 2 || b_ty.rank() != 1 {
            return Err(invalid(name, "expected input [N, ...], weights [K, D], bias [D]"));
        }
        let (k, d) = (w_ty.dims[0], w_ty.dims[1]);
        if in_ty.slice_size() != k || b_ty.dims[0] != d {
            return Err(invalid(
                name,
                format!("input {in_ty}, weights {w_ty} and bias {b_ty} do not agree"),
            ));
        }
        let out = in_ty.with_dims(&[in_ty.dims[0], d]);
        self.push(name, NodeKind::FullyConnected, vec![input, weights, bias], out)
    }

    /// Convolution with freshly created parameters: `<name>.filter`
    /// `[depth, k, k, C]` (Xavier, fan-in k*k*C) and `<name>.bias` `[depth]` (0.1).
    pub fn create_conv(
        &mut self,
        name: &str,
        input: impl Into<NodeRef>,
        depth: usize,
        window: Window,
    ) -> Result<NodeRef> {
        let input = input.into();
        let in_ty = self.type_of(input)?;
        if in_ty.rank() != 4 {
            return Err(invalid(name, format!("convolution input {in_ty} must be NHWC")));
        }
        let channels = in_ty.dims[3];
        let k = window.kernel;
        let filter = self.module.create_variable(
            format!("{name}.filter"),
            Type::float(&[depth, k, k, channels]),
            Visibility::Private,
            TrainKind::Xavier(k * k * channels),
        )?;
        let bias = self.module.create_variable(
            format!("{name}.bias"),
            Type::float(&[depth]),
            Visibility::Private,
            TrainKind::Broadcast(0.1),
        )?;
        self.create_conv_with(name, input, filter, bias, window)
    }

    pub fn create_conv_with(
        &mut self,
        name: &str,
        input: impl Into<NodeRef>,
        filter: impl Into<NodeRef>,
        bias: impl Into<NodeRef>,
        window: Window,
    ) -> Result<NodeRef> {
        let (input, filter, bias) = (input.into(), filter.into(), bias.into());
        let in_ty = self.type_of(input)?;
        let f_ty = self.type_of(filter)?;
        let b_ty = self.type_of(bias)?;
        if in_ty.rank() != 4 || f_ty.rank() != 4 || b_ty.rank() != 1 {
            return Err(invalid(name, "expected input NHWC, filter [D, k, k, C], bias [D]"));
        }
        let depth = f_ty.dims[0];
        if f_ty.dims[1] != window.kernel
            || f_ty.dims[2] != window.kernel
            || f_ty.dims[3] != in_ty.dims[3]
            || b_ty.dims[0] != depth
        {
            return Err(invalid(
                name,
                format!("filter {f_ty} and bias {b_ty} do not fit input {in_ty} with {window}"),
            ));
        }
        let (oh, ow) = self.window_extent(name, &in_ty, window)?;
        let out = in_ty.with_dims(&[in_ty.dims[0], oh, ow, depth]);
        self.push(name, NodeKind::Convolution(window), vec![input, filter, bias], out)
    }

    fn window_extent(&self, name: &str, in_ty: &Type, window: Window) -> Result<(usize, usize)> {
        match (
            window.output_extent(in_ty.dims[1]),
            window.output_extent(in_ty.dims[2]),
        ) {
            (Some(oh), Some(ow)) => Ok((oh, ow)),
            _ => Err(invalid(name, format!("window {window} does not fit input {in_ty}"))),
        }
    }

    // ---- Matrix and batch ops ----------------------------------------------

    pub fn create_matmul(
        &mut self,
        name: &str,
        lhs: impl Into<NodeRef>,
        rhs: impl Into<NodeRef>,
    ) -> Result<NodeRef> {
        let (lhs, rhs) = (lhs.into(), rhs.into());
        let l_ty = self.type_of(lhs)?;
        let r_ty = self.type_of(rhs)?;
        let out = l_ty.with_dims(&self.matmul_dims(name, &l_ty, &r_ty)?);
        self.push(name, NodeKind::MatMul, vec![lhs, rhs], out)
    }

    /// Matrix product with an explicit output type (quantized results).
    pub fn create_matmul_typed(
        &mut self,
        name: &str,
        out: Type,
        lhs: impl Into<NodeRef>,
        rhs: impl Into<NodeRef>,
    ) -> Result<NodeRef> {
        let (lhs, rhs) = (lhs.into(), rhs.into());
        let l_ty = self.type_of(lhs)?;
        let r_ty = self.type_of(rhs)?;
        if out.dims != self.matmul_dims(name, &l_ty, &r_ty)? {
            return Err(invalid(name, format!("output type {out} has the wrong shape")));
        }
        self.push(name, NodeKind::MatMul, vec![lhs, rhs], out)
    }

    fn matmul_dims(&self, name: &str, l_ty: &Type, r_ty: &Type) -> Result<Vec<usize>> {
        if l_ty.rank() != 2 || r_ty.rank() != 2 || l_ty.dims[1] != r_ty.dims[0] {
            return Err(invalid(name, format!("cannot multiply {l_ty} by {r_ty}")));
        }
        Ok(vec![l_ty.dims[0], r_ty.dims[1]])
    }

    /// Adds `slice` to every row of `batch`.
    pub fn create_batched_add(
        &mut self,
        name: &str,
        batch: impl Into<NodeRef>,
        slice: impl Into<NodeRef>,
    ) -> Result<NodeRef> {
        let batch = batch.into();
        let out = self.type_of(batch)?;
        self.create_batched_add_typed(name, out, batch, slice)
    }

    pub fn create_batched_add_typed(
        &mut self,
        name: &str,
        out: Type,
        batch: impl Into<NodeRef>,
        slice: impl Into<NodeRef>,
    ) -> Result<NodeRef> {
        let (batch, slice) = (batch.into(), slice.into());
        let b_ty = self.type_of(batch)?;
        let s_ty = self.type_of(slice)?;
        if b_ty.rank() < 1 || b_ty.dims[1..] != s_ty.dims[..] || out.dims != b_ty.dims {
            return Err(invalid(
                name,
                format!("slice {s_ty} does not match the rows of {b_ty} (output {out})"),
            ));
        }
        self.push(name, NodeKind::BatchedAdd, vec![batch, slice], out)
    }

    /// Sums `batch` over its leading dimension.
    pub fn create_batched_reduce_add(
        &mut self,
        name: &str,
        batch: impl Into<NodeRef>,
    ) -> Result<NodeRef> {
        let batch = batch.into();
        let b_ty = self.type_of(batch)?;
        if b_ty.rank() < 1 {
            return Err(invalid(name, "cannot reduce a scalar"));
        }
        let out = b_ty.with_dims(&b_ty.dims[1..]);
        self.push(name, NodeKind::BatchedReduceAdd, vec![batch], out)
    }

    // ---- Pooling and normalization -----------------------------------------

    pub fn create_pool_max(
        &mut self,
        name: &str,
        input: impl Into<NodeRef>,
        window: Window,
    ) -> Result<NodeRef> {
        self.create_pool(name, input.into(), NodeKind::PoolMax(window), window)
    }

    pub fn create_pool_avg(
        &mut self,
        name: &str,
        input: impl Into<NodeRef>,
        window: Window,
    ) -> Result<NodeRef> {
        self.create_pool(name, input.into(), NodeKind::PoolAvg(window), window)
    }

    fn create_pool(
        &mut self,
        name: &str,
        input: NodeRef,
        kind: NodeKind,
        window: Window,
    ) -> Result<NodeRef> {
        let in_ty = self.type_of(input)?;
        if in_ty.rank() != 4 {
            return Err(invalid(name, format!("pooling input {in_ty} must be NHWC")));
        }
        let (oh, ow) = self.window_extent(name, &in_ty, window)?;
        let out = in_ty.with_dims(&[in_ty.dims[0], oh, ow, in_ty.dims[3]]);
        self.push(name, kind, vec![input], out)
    }

    pub fn create_local_response_normalization(
        &mut self,
        name: &str,
        input: impl Into<NodeRef>,
        params: LrnParams,
    ) -> Result<NodeRef> {
        let input = input.into();
        let in_ty = self.type_of(input)?;
        if in_ty.rank() != 4 {
            return Err(invalid(name, format!("normalization input {in_ty} must be NHWC")));
        }
        self.push(
            name,
            NodeKind::LocalResponseNormalization(params),
            vec![input],
            in_ty,
        )
    }

    // ---- Activations and losses --------------------------------------------

    pub fn create_relu(&mut self, name: &str, input: impl Into<NodeRef>) -> Result<NodeRef> {
        self.create_unary(name, input.into(), NodeKind::Relu)
    }

    pub fn create_sigmoid(&mut self, name: &str, input: impl Into<NodeRef>) -> Result<NodeRef> {
        self.create_unary(name, input.into(), NodeKind::Sigmoid)
    }

    pub fn create_tanh(&mut self, name: &str, input: impl Into<NodeRef>) -> Result<NodeRef> {
        self.create_unary(name, input.into(), NodeKind::Tanh)
    }

    fn create_unary(&mut self, name: &str, input: NodeRef, kind: NodeKind) -> Result<NodeRef> {
        let ty = self.type_of(input)?;
        self.push(name, kind, vec![input], ty)
    }

    /// Softmax over `[N, C]` with integer labels `[N, 1]` used by training.
    pub fn create_softmax(
        &mut self,
        name: &str,
        input: impl Into<NodeRef>,
        selected: impl Into<NodeRef>,
    ) -> Result<NodeRef> {
        let (input, selected) = (input.into(), selected.into());
        let in_ty = self.type_of(input)?;
        let sel_ty = self.type_of(selected)?;
        if in_ty.rank() != 2 {
            return Err(invalid(name, format!("softmax input {in_ty} must be [N, C]")));
        }
        if sel_ty.elem != ElemKind::Index || sel_ty.dims != [in_ty.dims[0], 1] {
            return Err(invalid(name, format!("labels {sel_ty} must be index [N, 1]")));
        }
        self.push(name, NodeKind::SoftMax, vec![input, selected], in_ty)
    }

    /// Identity in the forward direction; its gradient is `input - expected`.
    pub fn create_regression(
        &mut self,
        name: &str,
        input: impl Into<NodeRef>,
        expected: impl Into<NodeRef>,
    ) -> Result<NodeRef> {
        let (input, expected) = (input.into(), expected.into());
        let in_ty = self.type_of(input)?;
        let ex_ty = self.type_of(expected)?;
        if in_ty.dims != ex_ty.dims {
            return Err(invalid(name, format!("expected values {ex_ty} do not match {in_ty}")));
        }
        self.push(name, NodeKind::Regression, vec![input, expected], in_ty)
    }

    // ---- Elementwise arithmetic --------------------------------------------

    pub fn create_add(
        &mut self,
        name: &str,
        lhs: impl Into<NodeRef>,
        rhs: impl Into<NodeRef>,
    ) -> Result<NodeRef> {
        self.create_binary(name, lhs.into(), rhs.into(), NodeKind::Add)
    }

    pub fn create_sub(
        &mut self,
        name: &str,
        lhs: impl Into<NodeRef>,
        rhs: impl Into<NodeRef>,
    ) -> Result<NodeRef> {
        self.create_binary(name, lhs.into(), rhs.into(), NodeKind::Sub)
    }

    pub fn create_mul(
        &mut self,
        name: &str,
        lhs: impl Into<NodeRef>,
        rhs: impl Into<NodeRef>,
    ) -> Result<NodeRef> {
        self.create_binary(name, lhs.into(), rhs.into(), NodeKind::Mul)
    }

    pub fn create_div(
        &mut self,
        name: &str,
        lhs: impl Into<NodeRef>,
        rhs: impl Into<NodeRef>,
    ) -> Result<NodeRef> {
        self.create_binary(name, lhs.into(), rhs.into(), NodeKind::Div)
    }

    pub fn create_max(
        &mut self,
        name: &str,
        lhs: impl Into<NodeRef>,
        rhs: impl Into<NodeRef>,
    ) -> Result<NodeRef> {
        self.create_binary(name, lhs.into(), rhs.into(), NodeKind::Max)
    }

    pub fn create_min(
        &mut self,
        name: &str,
        lhs: impl Into<NodeRef>,
        rhs: impl Into<NodeRef>,
    ) -> Result<NodeRef> {
        self.create_binary(name, lhs.into(), rhs.into(), NodeKind::Min)
    }

    fn create_binary(
        &mut self,
        name: &str,
        lhs: NodeRef,
        rhs: NodeRef,
        kind: NodeKind,
    ) -> Result<NodeRef> {
        let l_ty = self.type_of(lhs)?;
        let r_ty = self.type_of(rhs)?;
        if l_ty.dims != r_ty.dims {
            return Err(invalid(name, format!("operands {l_ty} and {r_ty} differ in shape")));
        }
        self.push(name, kind, vec![lhs, rhs], l_ty)
    }

    /// `cond != 0 ? lhs : rhs`, elementwise.
    pub fn create_select(
        &mut self,
        name: &str,
        cond: impl Into<NodeRef>,
        lhs: impl Into<NodeRef>,
        rhs: impl Into<NodeRef>,
    ) -> Result<NodeRef> {
        let (cond, lhs, rhs) = (cond.into(), lhs.into(), rhs.into());
        let c_ty = self.type_of(cond)?;
        let l_ty = self.type_of(lhs)?;
        let r_ty = self.type_of(rhs)?;
        if c_ty.dims != l_ty.dims || l_ty.dims != r_ty.dims {
            return Err(invalid(name, "condition and branches must share a shape"));
        }
        self.push(name, NodeKind::Select, vec![cond, lhs, rhs], l_ty)
    }

    // ---- Shape manipulation ------------------------------------------------

    pub fn create_reshape(
        &mut self,
        name: &str,
        input: impl Into<NodeRef>,
        dims: &[usize],
    ) -> Result<NodeRef> {
        let input = input.into();
        let in_ty = self.type_of(input)?;
        if in_ty.size() != dims.iter().product::<usize>() {
            return Err(invalid(name, format!("cannot reshape {in_ty} to {dims:?}")));
        }
        let out = in_ty.with_dims(dims);
        self.push(name, NodeKind::Reshape(dims.to_vec()), vec![input], out)
    }

    /// Output dimension `i` is input dimension `shuffle[i]`.
    pub fn create_transpose(
        &mut self,
        name: &str,
        input: impl Into<NodeRef>,
        shuffle: &[usize],
    ) -> Result<NodeRef> {
        let input = input.into();
        let in_ty = self.type_of(input)?;
        let mut seen = vec![false; in_ty.rank()];
        let valid = shuffle.len() == in_ty.rank()
            && shuffle.iter().all(|&axis| {
                axis < seen.len() && !std::mem::replace(&mut seen[axis], true)
            });
        if !valid {
            return Err(invalid(name, format!("{shuffle:?} is not a permutation of {in_ty}")));
        }
        let dims: Vec<usize> = shuffle.iter().map(|&axis| in_ty.dims[axis]).collect();
        let out = in_ty.with_dims(&dims);
        self.push(name, NodeKind::Transpose(shuffle.to_vec()), vec![input], out)
    }

    /// Rows of `data` picked by `indices`; the result has shape
    /// `indices.dims ++ data.dims[1..]`.
    pub fn create_gather(
        &mut self,
        name: &str,
        data: impl Into<NodeRef>,
        indices: impl Into<NodeRef>,
    ) -> Result<NodeRef> {
        let (data, indices) = (data.into(), indices.into());
        let d_ty = self.type_of(data)?;
        let i_ty = self.type_of(indices)?;
        if d_ty.rank() < 1 || i_ty.elem != ElemKind::Index {
            return Err(invalid(name, format!("cannot gather {d_ty} with {i_ty}")));
        }
        let mut dims = i_ty.dims.clone();
        dims.extend_from_slice(&d_ty.dims[1..]);
        let out = d_ty.with_dims(&dims);
        self.push(name, NodeKind::Gather, vec![data, indices], out)
    }

    // ---- Quantization ------------------------------------------------------

    pub fn create_quantize(
        &mut self,
        name: &str,
        input: impl Into<NodeRef>,
        out: Type,
    ) -> Result<NodeRef> {
        let input = input.into();
        let in_ty = self.type_of(input)?;
        if in_ty.elem != ElemKind::Float || !out.is_quantized() || out.dims != in_ty.dims {
            return Err(invalid(name, format!("cannot quantize {in_ty} to {out}")));
        }
        self.push(name, NodeKind::Quantize, vec![input], out)
    }

    pub fn create_dequantize(&mut self, name: &str, input: impl Into<NodeRef>) -> Result<NodeRef> {
        let input = input.into();
        let in_ty = self.type_of(input)?;
        if !in_ty.is_quantized() {
            return Err(invalid(name, format!("cannot dequantize {in_ty}")));
        }
        self.push(name, NodeKind::Dequantize, vec![input], Type::float(&in_ty.dims))
    }

    pub fn create_rescale_quantized(
        &mut self,
        name: &str,
        input: impl Into<NodeRef>,
        out: Type,
    ) -> Result<NodeRef> {
        let input = input.into();
        let in_ty = self.type_of(input)?;
        if !in_ty.is_quantized() || !out.is_quantized() || out.dims != in_ty.dims {
            return Err(invalid(name, format!("cannot rescale {in_ty} to {out}")));
        }
        self.push(name, NodeKind::RescaleQuantized, vec![input], out)
    }

    // ---- Constants and outputs ---------------------------------------------

    pub fn create_splat(&mut self, name: &str, ty: Type, value: f32) -> Result<NodeRef> {
        self.push(name, NodeKind::Splat(value), vec![], ty)
    }

    /// Store `value` into a new public variable called `name` and return it.
    pub fn create_save(&mut self, name: &str, value: impl Into<NodeRef>) -> Result<VarId> {
        let value = value.into();
        let ty = self.type_of(value)?;
        let dest = self
            .module
            .create_variable(name, ty, Visibility::Public, TrainKind::None)?;
        self.create_save_to(name, value, dest)?;
        Ok(dest)
    }

    /// Store `value` into an existing variable of the same type.
    pub fn create_save_to(
        &mut self,
        name: &str,
        value: impl Into<NodeRef>,
        dest: VarId,
    ) -> Result<NodeId> {
        let value = value.into();
        let ty = self.type_of(value)?;
        let dest_ty = self.module.variable(dest)?.ty.clone();
        if ty != dest_ty {
            return Err(invalid(
                name,
                format!("cannot save {ty} into a variable of type {dest_ty}"),
            ));
        }
        self.add_node(name, NodeKind::Save, vec![value, NodeRef::Variable(dest)], None)
    }
}
