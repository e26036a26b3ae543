//! Reverse-mode differentiation over graph functions.
//!
//! `differentiate` copies an inference function and appends, after its
//! forward nodes, the gradient nodes of every operator between the trainable
//! variables and the loss, one `GradientSum` per trainable variable
//! (`<weight>.grad`) and one `Sgd` update per trainable variable
//! (with its `<weight>.velocity` buffer).

mod rules;

use crate::config::TrainingConfig;
use crate::error::{Error, Result};
use crate::graph::{Function, FunctionId, Module, NodeKind, NodeRef, SgdParams, TrainKind, VarId};
use crate::ir::Visibility;
use rules::{Emitter, differentiable_inputs, gradient};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

/// Build the training function of `function`.
///
/// The returned function is not registered in the module, but velocity
/// variables it needs are created there (or reused when they already exist).
pub fn differentiate(
    module: &mut Module,
    function: FunctionId,
    config: &TrainingConfig,
) -> Result<Function> {
    let forward = module.function(function)?.clone();
    let order = forward.topo_order()?;
    let n = forward.len();

    // Losses are the softmax/regression nodes whose value is saved.
    let mut is_loss = vec![false; n];
    for node in forward.nodes() {
        if let (NodeKind::Save, Some(NodeRef::Node(src))) = (&node.kind, node.inputs.first()) {
            if forward.node(*src)?.kind.is_loss() {
                is_loss[src.0] = true;
            }
        }
    }
    if !is_loss.iter().any(|&l| l) {
        return Err(Error::NoLoss(forward.name().to_string()));
    }

    let trainable = |r: &NodeRef| -> bool {
        match r {
            NodeRef::Variable(v) => module.variable(*v).map(|v| v.is_trainable()).unwrap_or(false),
            NodeRef::Node(_) => false,
        }
    };

    // Nodes that depend on a trainable variable.
    let mut needs_grad = vec![false; n];
    for &id in &order {
        let node = forward.node(id)?;
        let flows = differentiable_inputs(&node.kind, node.inputs.len());
        needs_grad[id.0] = flows.iter().any(|&i| match &node.inputs[i] {
            NodeRef::Node(src) => needs_grad[src.0],
            var => trainable(var),
        });
    }

    // Nodes whose value flows into a loss.
    let mut reaches_loss = is_loss.clone();
    for &id in order.iter().rev() {
        if !reaches_loss[id.0] {
            continue;
        }
        let node = forward.node(id)?;
        for i in differentiable_inputs(&node.kind, node.inputs.len()) {
            if let NodeRef::Node(src) = node.inputs[i] {
                reaches_loss[src.0] = true;
            }
        }
    }

    let in_backward: Vec<bool> = (0..n).map(|i| needs_grad[i] && reaches_loss[i]).collect();

    let mut train = forward.clone();
    train.set_name(format!("{}.train", forward.name()));

    // Gradient contributions per value, in the order they were produced. The
    // backward walk visits consumers in reverse forward order, which pins the
    // summation order.
    let mut contributions: HashMap<NodeRef, Vec<NodeRef>> = HashMap::new();
    let mut weight_grads: BTreeMap<VarId, Vec<NodeRef>> = BTreeMap::new();

    {
        let mut em = Emitter {
            module,
            function: &mut train,
        };
        for &id in order.iter().rev() {
            if !in_backward[id.0] {
                continue;
            }
            let node = forward.node(id)?;
            let this = NodeRef::Node(id);

            let out_grad = if node.kind.is_loss() {
                None
            } else {
                match contributions.remove(&this) {
                    Some(parts) if parts.len() == 1 => Some(parts[0]),
                    Some(parts) => {
                        let ty = em.ty(this)?;
                        let name = format!("{}.grad", node.name);
                        Some(em.node(name, NodeKind::GradientSum, parts, ty)?)
                    }
                    None => None,
                }
            };

            let flows = differentiable_inputs(&node.kind, node.inputs.len());
            let mut wants = vec![false; node.inputs.len()];
            for i in flows {
                wants[i] = match &node.inputs[i] {
                    NodeRef::Node(src) => in_backward[src.0],
                    var => trainable(var),
                };
            }

            for (i, grad) in gradient(&mut em, node, out_grad, &wants)? {
                match node.inputs[i] {
                    NodeRef::Variable(v) => weight_grads.entry(v).or_default().push(grad),
                    input => contributions.entry(input).or_default().push(grad),
                }
            }
            debug!(node = %node.name, kind = %node.kind, "differentiated node");
        }
    }

    // All accumulators first, then the updates, so no weight changes while a
    // gradient that reads it is still pending.
    let mut sums = Vec::with_capacity(weight_grads.len());
    for (var, parts) in weight_grads {
        let (name, ty) = {
            let v = module.variable(var)?;
            (v.name.clone(), v.ty.clone())
        };
        let sum = train.add_node(
            format!("{name}.grad"),
            NodeKind::GradientSum,
            parts,
            Some(ty.clone()),
        )?;
        sums.push((var, name, ty, sum));
    }

    let params = SgdParams {
        learning_rate: config.learning_rate,
        momentum: config.momentum,
        l2_decay: config.l2_decay,
    };
    for (var, name, ty, sum) in sums {
        let velocity = module.ensure_variable(
            &format!("{name}.velocity"),
            ty,
            Visibility::Private,
            TrainKind::None,
        )?;
        train.add_node(
            format!("{name}.sgd"),
            NodeKind::Sgd(params),
            vec![NodeRef::Variable(var), NodeRef::Node(sum), NodeRef::Variable(velocity)],
            None,
        )?;
    }

    info!(
        function = forward.name(),
        forward_nodes = n,
        total_nodes = train.len(),
        "differentiated function"
    );
    Ok(train)
}
