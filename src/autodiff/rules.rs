use crate::error::{Error, Result};
use crate::graph::{Function, Module, Node, NodeKind, NodeRef};
use crate::tensor::Type;

/// Appends gradient nodes to the training function being built.
pub(crate) struct Emitter<'a> {
    pub module: &'a Module,
    pub function: &'a mut Function,
}

impl Emitter<'_> {
    pub fn ty(&self, value: NodeRef) -> Result<Type> {
        self.module.type_of(self.function, value)
    }

    pub fn node(
        &mut self,
        name: String,
        kind: NodeKind,
        inputs: Vec<NodeRef>,
        ty: Type,
    ) -> Result<NodeRef> {
        let id = self.function.add_node(name, kind, inputs, Some(ty))?;
        Ok(NodeRef::Node(id))
    }

    fn splat(&mut self, name: String, ty: Type, value: f32) -> Result<NodeRef> {
        self.node(name, NodeKind::Splat(value), vec![], ty)
    }

    fn binary(
        &mut self,
        name: String,
        kind: NodeKind,
        lhs: NodeRef,
        rhs: NodeRef,
    ) -> Result<NodeRef> {
        let ty = self.ty(lhs)?;
        self.node(name, kind, vec![lhs, rhs], ty)
    }

    /// Type of `value`, which must have between `min` and `max` dimensions for
    /// the rule emitting `name` to apply. Raw-built nodes are only checked here.
    fn ranked(&self, name: &str, value: NodeRef, min: usize, max: usize) -> Result<Type> {
        let ty = self.ty(value)?;
        if ty.rank() < min || ty.rank() > max {
            let expected = if min == max {
                format!("rank {min}")
            } else if max == usize::MAX {
                format!("rank of at least {min}")
            } else {
                format!("rank {min} to {max}")
            };
            return Err(Error::InvalidNode {
                node: name.to_string(),
                reason: format!("operand {ty} needs {expected}"),
            });
        }
        Ok(ty)
    }

    fn transpose_2d(&mut self, name: String, input: NodeRef) -> Result<NodeRef> {
        let ty = self.ranked(&name, input, 2, 2)?;
        let out = ty.with_dims(&[ty.dims[1], ty.dims[0]]);
        self.node(name, NodeKind::Transpose(vec![1, 0]), vec![input], out)
    }

    fn matmul(&mut self, name: String, lhs: NodeRef, rhs: NodeRef) -> Result<NodeRef> {
        let l = self.ranked(&name, lhs, 2, 2)?;
        let r = self.ranked(&name, rhs, 2, 2)?;
        let out = l.with_dims(&[l.dims[0], r.dims[1]]);
        self.node(name, NodeKind::MatMul, vec![lhs, rhs], out)
    }

    /// Reshape unless the value already has the requested dimensions.
    fn reshape(&mut self, name: String, input: NodeRef, dims: &[usize]) -> Result<NodeRef> {
        let ty = self.ty(input)?;
        if ty.dims == dims {
            return Ok(input);
        }
        self.node(name, NodeKind::Reshape(dims.to_vec()), vec![input], ty.with_dims(dims))
    }

    fn reduce_rows(&mut self, name: String, input: NodeRef) -> Result<NodeRef> {
        let ty = self.ranked(&name, input, 1, usize::MAX)?;
        let out = ty.with_dims(&ty.dims[1..]);
        self.node(name, NodeKind::BatchedReduceAdd, vec![input], out)
    }
}

/// Inputs of `kind` that gradients flow into. Labels and expected values are
/// data, not parameters.
pub(crate) fn differentiable_inputs(kind: &NodeKind, arity: usize) -> Vec<usize> {
    match kind {
        NodeKind::SoftMax | NodeKind::Regression => vec![0],
        _ => (0..arity).collect(),
    }
}

/// Emit the gradient of `node` with respect to each wanted input.
///
/// `out_grad` is the summed gradient flowing into the node's output; loss
/// nodes ignore it. Returns `(input position, gradient value)` pairs.
pub(crate) fn gradient(
    em: &mut Emitter<'_>,
    node: &Node,
    out_grad: Option<NodeRef>,
    wants: &[bool],
) -> Result<Vec<(usize, NodeRef)>> {
    let this = NodeRef::Node(node.id);
    let name = &node.name;
    let want = |i: usize| wants.get(i).copied().unwrap_or(false);
    let missing = || Error::MissingGradient {
        op: node.kind.name().to_string(),
        node: node.name.clone(),
    };
    let mut grads = Vec::new();

    // Loss nodes seed the backward pass themselves.
    match &node.kind {
        NodeKind::SoftMax => {
            let ty = em.ty(node.inputs[0])?;
            let g = em.node(
                format!("{name}.grad"),
                NodeKind::SoftMaxGrad,
                vec![this, node.inputs[1]],
                ty,
            )?;
            grads.push((0, g));
            return Ok(grads);
        }
        NodeKind::Regression => {
            let g = em.binary(
                format!("{name}.grad"),
                NodeKind::Sub,
                node.inputs[0],
                node.inputs[1],
            )?;
            grads.push((0, g));
            return Ok(grads);
        }
        _ => {}
    }

    let g = out_grad.ok_or_else(missing)?;

    match &node.kind {
        NodeKind::FullyConnected => {
            let (x, w) = (node.inputs[0], node.inputs[1]);
            let x_ty = em.ranked(name, x, 2, usize::MAX)?;
            let (n, k) = (x_ty.dims[0], x_ty.slice_size());
            if want(0) {
                let wt = em.transpose_2d(format!("{name}.weights_t"), w)?;
                let gx = em.matmul(format!("{name}.input_grad"), g, wt)?;
                let gx = em.reshape(format!("{name}.input_grad.reshape"), gx, &x_ty.dims)?;
                grads.push((0, gx));
            }
            if want(1) {
                let x2 = em.reshape(format!("{name}.input_2d"), x, &[n, k])?;
                let xt = em.transpose_2d(format!("{name}.input_t"), x2)?;
                grads.push((1, em.matmul(format!("{name}.weights_grad"), xt, g)?));
            }
            if want(2) {
                grads.push((2, em.reduce_rows(format!("{name}.bias_grad"), g)?));
            }
        }
        NodeKind::MatMul => {
            let (a, b) = (node.inputs[0], node.inputs[1]);
            if want(0) {
                let bt = em.transpose_2d(format!("{name}.rhs_t"), b)?;
                grads.push((0, em.matmul(format!("{name}.lhs_grad"), g, bt)?));
            }
            if want(1) {
                let at = em.transpose_2d(format!("{name}.lhs_t"), a)?;
                grads.push((1, em.matmul(format!("{name}.rhs_grad"), at, g)?));
            }
        }
        NodeKind::BatchedAdd => {
            if want(0) {
                grads.push((0, g));
            }
            if want(1) {
                grads.push((1, em.reduce_rows(format!("{name}.slice_grad"), g)?));
            }
        }
        NodeKind::BatchedReduceAdd => {
            if want(0) {
                let batch_ty = em.ty(node.inputs[0])?;
                let zero = em.splat(format!("{name}.zero"), batch_ty.clone(), 0.0)?;
                let gx = em.node(
                    format!("{name}.batch_grad"),
                    NodeKind::BatchedAdd,
                    vec![zero, g],
                    batch_ty,
                )?;
                grads.push((0, gx));
            }
        }
        NodeKind::Add => {
            for i in 0..2 {
                if want(i) {
                    grads.push((i, g));
                }
            }
        }
        NodeKind::Sub => {
            if want(0) {
                grads.push((0, g));
            }
            if want(1) {
                let ty = em.ty(g)?;
                let zero = em.splat(format!("{name}.zero"), ty, 0.0)?;
                grads.push((1, em.binary(format!("{name}.rhs_grad"), NodeKind::Sub, zero, g)?));
            }
        }
        NodeKind::Mul => {
            let (a, b) = (node.inputs[0], node.inputs[1]);
            if want(0) {
                grads.push((0, em.binary(format!("{name}.lhs_grad"), NodeKind::Mul, g, b)?));
            }
            if want(1) {
                grads.push((1, em.binary(format!("{name}.rhs_grad"), NodeKind::Mul, g, a)?));
            }
        }
        NodeKind::Relu => {
            if want(0) {
                let ty = em.ty(node.inputs[0])?;
                let gx = em.node(format!("{name}.grad"), NodeKind::ReluGrad, vec![this, g], ty)?;
                grads.push((0, gx));
            }
        }
        NodeKind::Sigmoid => {
            // d/dx = y * (1 - y)
            if want(0) {
                let ty = em.ty(this)?;
                let one = em.splat(format!("{name}.one"), ty, 1.0)?;
                let one_minus = em.binary(format!("{name}.one_minus"), NodeKind::Sub, one, this)?;
                let slope = em.binary(format!("{name}.slope"), NodeKind::Mul, this, one_minus)?;
                grads.push((0, em.binary(format!("{name}.grad"), NodeKind::Mul, g, slope)?));
            }
        }
        NodeKind::Tanh => {
            // d/dx = 1 - y^2
            if want(0) {
                let ty = em.ty(this)?;
                let one = em.splat(format!("{name}.one"), ty, 1.0)?;
                let square = em.binary(format!("{name}.square"), NodeKind::Mul, this, this)?;
                let slope = em.binary(format!("{name}.slope"), NodeKind::Sub, one, square)?;
                grads.push((0, em.binary(format!("{name}.grad"), NodeKind::Mul, g, slope)?));
            }
        }
        NodeKind::Reshape(_) => {
            if want(0) {
                let dims = em.ty(node.inputs[0])?.dims;
                grads.push((0, em.reshape(format!("{name}.grad"), g, &dims)?));
            }
        }
        NodeKind::Transpose(shuffle) => {
            if want(0) {
                let rank = shuffle.len();
                let ty = em.ranked(name, node.inputs[0], rank, rank)?;
                let mut inverse = vec![usize::MAX; rank];
                for (i, &axis) in shuffle.iter().enumerate() {
                    match inverse.get_mut(axis) {
                        Some(slot) if *slot == usize::MAX => *slot = i,
                        _ => {
                            return Err(Error::InvalidNode {
                                node: name.clone(),
                                reason: format!("{shuffle:?} is not a permutation"),
                            });
                        }
                    }
                }
                let kind = NodeKind::Transpose(inverse);
                let gx = em.node(format!("{name}.grad"), kind, vec![g], ty)?;
                grads.push((0, gx));
            }
        }
        NodeKind::Convolution(window) => {
            let (x, filter) = (node.inputs[0], node.inputs[1]);
            if want(0) {
                let ty = em.ty(x)?;
                let gx = em.node(
                    format!("{name}.input_grad"),
                    NodeKind::ConvolutionInputGrad(*window),
                    vec![filter, g],
                    ty,
                )?;
                grads.push((0, gx));
            }
            if want(1) {
                let ty = em.ty(filter)?;
                let gf = em.node(
                    format!("{name}.filter_grad"),
                    NodeKind::ConvolutionFilterGrad(*window),
                    vec![x, g],
                    ty,
                )?;
                grads.push((1, gf));
            }
            if want(2) {
                let out = em.ranked(name, g, 4, 4)?;
                let depth = out.dims[3];
                let rows = out.size() / depth.max(1);
                let flat = em.reshape(format!("{name}.grad_2d"), g, &[rows, depth])?;
                grads.push((2, em.reduce_rows(format!("{name}.bias_grad"), flat)?));
            }
        }
        NodeKind::PoolMax(window) => {
            if want(0) {
                let x = node.inputs[0];
                let ty = em.ty(x)?;
                let gx = em.node(
                    format!("{name}.grad"),
                    NodeKind::PoolMaxGrad(*window),
                    vec![x, g],
                    ty,
                )?;
                grads.push((0, gx));
            }
        }
        NodeKind::PoolAvg(window) => {
            if want(0) {
                let ty = em.ty(node.inputs[0])?;
                let kind = NodeKind::PoolAvgGrad(*window);
                let gx = em.node(format!("{name}.grad"), kind, vec![g], ty)?;
                grads.push((0, gx));
            }
        }
        NodeKind::LocalResponseNormalization(params) => {
            if want(0) {
                let x = node.inputs[0];
                let ty = em.ty(x)?;
                let gx = em.node(
                    format!("{name}.grad"),
                    NodeKind::LocalResponseNormalizationGrad(*params),
                    vec![x, this, g],
                    ty,
                )?;
                grads.push((0, gx));
            }
        }

        // Seeded above.
        NodeKind::SoftMax | NodeKind::Regression => {}

        NodeKind::Div
        | NodeKind::Max
        | NodeKind::Min
        | NodeKind::Select
        | NodeKind::Gather
        | NodeKind::Quantize
        | NodeKind::Dequantize
        | NodeKind::RescaleQuantized
        | NodeKind::Splat(_)
        | NodeKind::Save
        | NodeKind::Custom(_)
        | NodeKind::ReluGrad
        | NodeKind::SoftMaxGrad
        | NodeKind::ConvolutionInputGrad(_)
        | NodeKind::ConvolutionFilterGrad(_)
        | NodeKind::PoolMaxGrad(_)
        | NodeKind::PoolAvgGrad(_)
        | NodeKind::LocalResponseNormalizationGrad(_)
        | NodeKind::GradientSum
        | NodeKind::Sgd(_) => return Err(missing()),
    }

    Ok(grads)
}
