//! Graph lowering: turns a finalized `Function` into an `IrFunction`.

use crate::error::{Error, Result};
use crate::graph::{Function, Module, Node, NodeKind, NodeRef, VarId, Variable};
use crate::ir::{InstrKind, Instruction, IrFunction, LocationId, Mutability, StorageArena, Value};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Persistent storage for module variables.
///
/// Every variable gets one location the first time it is lowered, and every
/// later lowering (inference or training, before or after recompilation) reuses
/// it. This is what lets a training unit update the weights an inference unit
/// reads.
#[derive(Debug, Default)]
pub struct WeightStore {
    arena: StorageArena,
    by_variable: HashMap<VarId, LocationId>,
}

impl WeightStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arena(&self) -> &StorageArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut StorageArena {
        &mut self.arena
    }

    pub fn location_of(&self, var: VarId) -> Option<LocationId> {
        self.by_variable.get(&var).copied()
    }

    /// Location of `var`, created on first use with the variable's visibility
    /// and initializer. Tags of an existing location are left alone.
    pub fn ensure(&mut self, var: &Variable, mutable: bool) -> Result<LocationId> {
        if let Some(id) = self.location_of(var.id) {
            return Ok(id);
        }
        let mutability = if mutable {
            Mutability::Mutable
        } else {
            Mutability::Constant
        };
        let id = self.arena.create_with_payload(
            var.name.clone(),
            var.ty.clone(),
            mutability,
            var.visibility,
            var.payload().clone(),
        )?;
        debug!(variable = %var.name, %mutability, visibility = %var.visibility, "allocated weight");
        self.by_variable.insert(var.id, id);
        Ok(id)
    }
}

/// Lower `function` into a new instruction sequence whose weight operands point
/// into `weights`.
pub fn lower(
    module: &Module,
    function: &Function,
    weights: &mut WeightStore,
) -> Result<IrFunction> {
    let order = function.topo_order()?;

    // A variable written by any function of the module is mutable from its
    // first lowering on, whichever function is compiled first.
    let mut written = HashSet::new();
    for other in module.functions().iter().chain(std::iter::once(function)) {
        collect_written(other, &mut written);
    }

    let mut lowerer = Lowerer {
        module,
        function,
        weights,
        ir: IrFunction::new(function.name()),
        values: HashMap::new(),
        uses: function.use_counts(),
        written,
    };
    for id in order {
        let node = function.node(id)?;
        lowerer.lower_node(node)?;
        debug!(node = %node.name, kind = %node.kind, "lowered node");
    }

    let ir = lowerer.ir;
    info!(
        function = function.name(),
        instructions = ir.len(),
        activations = ir.activations().len(),
        "lowered function"
    );
    Ok(ir)
}

/// Variables `function` stores into: save destinations, updated weights and
/// their velocities.
fn collect_written(function: &Function, written: &mut HashSet<VarId>) {
    for node in function.nodes() {
        match node.kind {
            NodeKind::Save => {
                if let Some(NodeRef::Variable(v)) = node.inputs.get(1) {
                    written.insert(*v);
                }
            }
            NodeKind::Sgd(_) => {
                for input in [node.inputs.first(), node.inputs.get(2)].into_iter().flatten() {
                    if let NodeRef::Variable(v) = input {
                        written.insert(*v);
                    }
                }
            }
            _ => {}
        }
    }
}

struct Lowerer<'a> {
    module: &'a Module,
    function: &'a Function,
    weights: &'a mut WeightStore,
    ir: IrFunction,
    values: HashMap<NodeRef, Value>,
    uses: Vec<usize>,
    written: HashSet<VarId>,
}

impl Lowerer<'_> {
    fn value_of(&mut self, input: NodeRef) -> Result<Value> {
        if let Some(&value) = self.values.get(&input) {
            return Ok(value);
        }
        let value = match input {
            NodeRef::Variable(id) => {
                let var = self.module.variable(id)?;
                let mutable = var.is_trainable() || self.written.contains(&id);
                Value::Weight(self.weights.ensure(var, mutable)?)
            }
            NodeRef::Node(id) => {
                return Err(Error::InvalidNode {
                    node: self.module.name_of(self.function, input),
                    reason: format!("{id} is used before it is lowered"),
                });
            }
        };
        self.values.insert(input, value);
        Ok(value)
    }

    fn inputs(&mut self, node: &Node) -> Result<Vec<Value>> {
        node.inputs.iter().map(|&input| self.value_of(input)).collect()
    }

    /// Fresh activation holding the node's result.
    fn output(&mut self, node: &Node) -> Result<Value> {
        let ty = node
            .ty
            .clone()
            .ok_or_else(|| Error::UnresolvedType(node.name.clone()))?;
        let value = self.ir.create_activation(node.name.clone(), ty)?;
        self.values.insert(NodeRef::Node(node.id), value);
        Ok(value)
    }

    /// Output location for an elementwise unary node, reusing the input's
    /// activation when the function allows it and nobody else reads the input.
    fn unary_output(&mut self, node: &Node, input: Value) -> Result<Value> {
        let single_use = match node.inputs.first() {
            Some(NodeRef::Node(id)) => self.uses[id.0] == 1,
            _ => false,
        };
        if self.function.is_in_place() && single_use && matches!(input, Value::Activation(_)) {
            node.ty
                .as_ref()
                .ok_or_else(|| Error::UnresolvedType(node.name.clone()))?;
            self.values.insert(NodeRef::Node(node.id), input);
            return Ok(input);
        }
        self.output(node)
    }

    fn emit(&mut self, node: &Node, kind: InstrKind, values: &[Value]) -> Result<()> {
        let instr = Instruction::new(node.name.clone(), kind, values);
        self.ir.push(self.weights.arena(), instr)
    }

    fn lower_node(&mut self, node: &Node) -> Result<()> {
        let kind = match &node.kind {
            NodeKind::FullyConnected => InstrKind::FullyConnected,
            NodeKind::MatMul => InstrKind::MatMul,
            NodeKind::BatchedAdd => InstrKind::BatchedAdd,
            NodeKind::BatchedReduceAdd => InstrKind::BatchedReduceAdd,
            NodeKind::Convolution(w) => InstrKind::Convolution(*w),
            NodeKind::PoolMax(w) => InstrKind::PoolMax(*w),
            NodeKind::PoolAvg(w) => InstrKind::PoolAvg(*w),
            NodeKind::SoftMax => InstrKind::SoftMax,
            NodeKind::Add => InstrKind::ElementAdd,
            NodeKind::Sub => InstrKind::ElementSub,
            NodeKind::Mul => InstrKind::ElementMul,
            NodeKind::Div => InstrKind::ElementDiv,
            NodeKind::Max => InstrKind::ElementMax,
            NodeKind::Min => InstrKind::ElementMin,
            NodeKind::Select => InstrKind::ElementSelect,
            NodeKind::Reshape(_) => InstrKind::Reshape,
            NodeKind::Transpose(shuffle) => InstrKind::Transpose(shuffle.clone()),
            NodeKind::Gather => InstrKind::Gather,
            NodeKind::LocalResponseNormalization(p) => InstrKind::LocalResponseNormalization(*p),
            NodeKind::Quantize => InstrKind::Quantize,
            NodeKind::Dequantize => InstrKind::Dequantize,
            NodeKind::RescaleQuantized => InstrKind::RescaleQuantized,
            NodeKind::ReluGrad => InstrKind::ReluGrad,
            NodeKind::SoftMaxGrad => InstrKind::SoftMaxGrad,
            NodeKind::ConvolutionInputGrad(w) => InstrKind::ConvolutionInputGrad(*w),
            NodeKind::ConvolutionFilterGrad(w) => InstrKind::ConvolutionFilterGrad(*w),
            NodeKind::PoolMaxGrad(w) => InstrKind::PoolMaxGrad(*w),
            NodeKind::PoolAvgGrad(w) => InstrKind::PoolAvgGrad(*w),
            NodeKind::LocalResponseNormalizationGrad(p) => {
                InstrKind::LocalResponseNormalizationGrad(*p)
            }

            NodeKind::Relu | NodeKind::Sigmoid | NodeKind::Tanh => {
                let kind = match node.kind {
                    NodeKind::Relu => InstrKind::Relu,
                    NodeKind::Sigmoid => InstrKind::Sigmoid,
                    _ => InstrKind::Tanh,
                };
                let src = self.value_of(node.inputs[0])?;
                let dest = self.unary_output(node, src)?;
                return self.emit(node, kind, &[dest, src]);
            }
            NodeKind::Regression => {
                // Forward pass is the identity; the expected values are only
                // read by the gradient, but stay bindable in every mode.
                let inputs = self.inputs(node)?;
                let dest = self.output(node)?;
                return self.emit(node, InstrKind::Copy, &[dest, inputs[0]]);
            }
            NodeKind::Splat(value) => {
                let dest = self.output(node)?;
                return self.emit(node, InstrKind::Splat(*value), &[dest]);
            }
            NodeKind::Save => {
                let inputs = self.inputs(node)?;
                return self.emit(node, InstrKind::Copy, &[inputs[1], inputs[0]]);
            }
            NodeKind::GradientSum => {
                let contributions = self.inputs(node)?;
                let acc = self.output(node)?;
                self.emit(node, InstrKind::Splat(0.0), &[acc])?;
                for contribution in contributions {
                    self.emit(node, InstrKind::ElementAdd, &[acc, acc, contribution])?;
                }
                return Ok(());
            }
            NodeKind::Sgd(params) => {
                let inputs = self.inputs(node)?;
                return self.emit(node, InstrKind::Sgd(*params), &inputs);
            }
            NodeKind::Custom(op) => {
                return Err(Error::MissingLowering {
                    op: op.clone(),
                    node: node.name.clone(),
                });
            }
        };

        let mut values = self.inputs(node)?;
        let dest = self.output(node)?;
        values.insert(0, dest);
        self.emit(node, kind, &values)
    }
}
