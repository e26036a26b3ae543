use crate::error::{Error, Result};
use crate::graph::Window;
use crate::ir::instr::{InstrKind, Instruction, Operand};
use crate::ir::storage::{LocationId, Mutability, StorageArena, StorageLocation, Value, Visibility};
use crate::tensor::{ElemKind, Type};
use std::collections::HashSet;

/// Flat, append-only instruction sequence plus the activation storage it
/// owns. Weight operands point into an arena owned by someone else (the
/// engine), which is passed in whenever locations must be resolved.
#[derive(Debug, Clone, Default)]
pub struct IrFunction {
    name: String,
    instrs: Vec<Instruction>,
    activations: StorageArena,
    defined: HashSet<LocationId>,
}

/// Resolve a handle against the two arenas.
pub fn resolve<'a>(
    activations: &'a StorageArena,
    weights: &'a StorageArena,
    value: Value,
) -> Result<&'a StorageLocation> {
    match value {
        Value::Weight(id) => weights.get(id),
        Value::Activation(id) => activations.get(id),
    }
}

impl IrFunction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instrs
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn activations(&self) -> &StorageArena {
        &self.activations
    }

    pub fn activations_mut(&mut self) -> &mut StorageArena {
        &mut self.activations
    }

    /// Allocate a mutable, private activation. It is undefined until an
    /// instruction writes it.
    pub fn create_activation(&mut self, name: impl Into<String>, ty: Type) -> Result<Value> {
        let id = self
            .activations
            .create(name, ty, Mutability::Mutable, Visibility::Private)?;
        Ok(Value::Activation(id))
    }

    /// Instructions and activation storage borrowed separately, for backends
    /// that read the program while writing results.
    pub fn split_mut(&mut self) -> (&[Instruction], &mut StorageArena) {
        (&self.instrs, &mut self.activations)
    }

    pub fn location<'a>(
        &'a self,
        weights: &'a StorageArena,
        value: Value,
    ) -> Result<&'a StorageLocation> {
        resolve(&self.activations, weights, value)
    }

    /// Append an instruction after checking operand definition order, the
    /// operand signature of its kind and constant protection.
    pub fn push(&mut self, weights: &StorageArena, instr: Instruction) -> Result<()> {
        check_instruction(&instr, &self.activations, weights, &self.defined)?;
        for op in &instr.operands {
            if let (Value::Activation(id), true) = (op.value, op.dir.writes()) {
                self.defined.insert(id);
            }
        }
        self.instrs.push(instr);
        Ok(())
    }

    /// Re-check the whole sequence from scratch.
    pub fn verify(&self, weights: &StorageArena) -> Result<()> {
        let mut defined = HashSet::new();
        for instr in &self.instrs {
            check_instruction(instr, &self.activations, weights, &defined)?;
            for op in &instr.operands {
                if let (Value::Activation(id), true) = (op.value, op.dir.writes()) {
                    defined.insert(id);
                }
            }
        }
        Ok(())
    }

    pub fn operands_of(&self, index: usize) -> Option<&[Operand]> {
        self.instrs.get(index).map(|i| i.operands.as_slice())
    }

    /// Indices of the instructions reading `value`.
    pub fn users_of(&self, value: Value) -> Vec<usize> {
        self.instrs
            .iter()
            .enumerate()
            .filter(|(_, instr)| instr.reads(value))
            .map(|(i, _)| i)
            .collect()
    }

    /// Indices of the instructions writing `value`.
    pub fn writers_of(&self, value: Value) -> Vec<usize> {
        self.instrs
            .iter()
            .enumerate()
            .filter(|(_, instr)| instr.writes(value))
            .map(|(i, _)| i)
            .collect()
    }

    /// Instruction kinds and operand topology, one line per instruction.
    /// Two lowerings of the same graph produce equal signatures.
    pub fn signature(&self) -> Vec<String> {
        self.instrs
            .iter()
            .map(|instr| {
                let operands: Vec<String> = instr
                    .operands
                    .iter()
                    .map(|op| format!("{}:{}", op.value, op.dir))
                    .collect();
                format!("{} {}", instr.kind, operands.join(" "))
            })
            .collect()
    }

    pub fn dump(&self, weights: &StorageArena) -> String {
        let mut out = format!("=== IR: {} ({} instructions) ===\n", self.name, self.instrs.len());
        out.push_str("declare {\n");
        for (id, loc) in weights.iter() {
            out.push_str(&format!(
                "  {} {} {} {} : {}\n",
                Value::Weight(id),
                loc.mutability(),
                loc.visibility(),
                loc.name(),
                loc.ty()
            ));
        }
        for (id, loc) in self.activations.iter() {
            out.push_str(&format!(
                "  {} {} : {}\n",
                Value::Activation(id),
                loc.name(),
                loc.ty()
            ));
        }
        out.push_str("}\n\ncode {\n");
        for (i, instr) in self.instrs.iter().enumerate() {
            out.push_str(&format!("  {i} {instr}\n"));
        }
        out.push_str("}\n");
        out
    }
}

fn signature_error(instr: &Instruction, reason: impl Into<String>) -> Error {
    Error::InstrSignature {
        instr: instr.name.clone(),
        kind: instr.kind.name().to_string(),
        reason: reason.into(),
    }
}

fn check_instruction(
    instr: &Instruction,
    activations: &StorageArena,
    weights: &StorageArena,
    defined: &HashSet<LocationId>,
) -> Result<()> {
    let layout = instr.kind.layout();
    if instr.operands.len() != layout.len() {
        return Err(signature_error(
            instr,
            format!("expected {} operands, got {}", layout.len(), instr.operands.len()),
        ));
    }

    let mut types = Vec::with_capacity(layout.len());
    for (i, (op, &dir)) in instr.operands.iter().zip(layout).enumerate() {
        if op.dir != dir {
            return Err(signature_error(
                instr,
                format!("operand {i} must be {dir}, got {}", op.dir),
            ));
        }
        let loc = resolve(activations, weights, op.value)
            .map_err(|_| {
                signature_error(instr, format!("operand {i} ({}) is dangling", op.value))
            })?;

        let is_defined = match op.value {
            Value::Weight(_) => true,
            Value::Activation(id) => defined.contains(&id),
        };
        if op.dir.reads() && !is_defined {
            return Err(Error::UndefinedOperand {
                instr: instr.name.clone(),
                value: op.value,
                location: loc.name().to_string(),
            });
        }
        if op.dir.writes() && loc.is_constant() {
            let defines_constant = instr.kind.is_initializer()
                && matches!(op.value, Value::Activation(_))
                && !is_defined;
            if !defines_constant {
                return Err(Error::ConstantWrite {
                    instr: instr.name.clone(),
                    location: loc.name().to_string(),
                });
            }
        }
        types.push(loc.ty());
    }

    check_shapes(&instr.kind, &types).map_err(|reason| signature_error(instr, reason))
}

fn same_dims(types: &[&Type]) -> std::result::Result<(), String> {
    match types.split_first() {
        Some((first, rest)) if rest.iter().all(|t| t.dims == first.dims) => Ok(()),
        Some(_) => Err(format!(
            "operand shapes differ: {}",
            types
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )),
        None => Ok(()),
    }
}

fn expect(cond: bool, reason: impl FnOnce() -> String) -> std::result::Result<(), String> {
    if cond { Ok(()) } else { Err(reason()) }
}

fn pooled_dims(src: &Type, window: Window, channels: usize) -> Option<Vec<usize>> {
    if src.rank() != 4 {
        return None;
    }
    let oh = window.output_extent(src.dims[1])?;
    let ow = window.output_extent(src.dims[2])?;
    Some(vec![src.dims[0], oh, ow, channels])
}

fn check_conv(
    src: &Type,
    filter: &Type,
    dest: &Type,
    window: Window,
) -> std::result::Result<(), String> {
    expect(src.rank() == 4 && filter.rank() == 4, || {
        format!("convolution needs NHWC input and [D, k, k, C] filter, got {src} and {filter}")
    })?;
    expect(
        filter.dims[1] == window.kernel
            && filter.dims[2] == window.kernel
            && filter.dims[3] == src.dims[3],
        || format!("filter {filter} does not fit input {src} with {window}"),
    )?;
    let expected = pooled_dims(src, window, filter.dims[0]);
    expect(expected.as_deref() == Some(dest.dims.as_slice()), || {
        format!("output {dest} does not match input {src} and filter {filter}")
    })
}

fn check_shapes(kind: &InstrKind, t: &[&Type]) -> std::result::Result<(), String> {
    use InstrKind::*;
    match kind {
        Splat(_) => Ok(()),
        Copy => expect(t[0] == t[1], || format!("cannot copy {} into {}", t[1], t[0])),
        ElementAdd | ElementSub | ElementMul | ElementDiv | ElementMax | ElementMin
        | ElementSelect | Relu | Sigmoid | Tanh | ReluGrad | LocalResponseNormalizationGrad(_) => {
            same_dims(t)
        }
        LocalResponseNormalization(_) => {
            same_dims(t)?;
            expect(t[0].rank() == 4, || format!("{} must be NHWC", t[0]))
        }
        Sgd(_) => {
            same_dims(t)?;
            expect(t.iter().all(|ty| ty.elem == ElemKind::Float), || {
                "sgd operates on float operands".to_string()
            })
        }
        MatMul => expect(
            t[1].rank() == 2
                && t[2].rank() == 2
                && t[1].dims[1] == t[2].dims[0]
                && t[0].dims == [t[1].dims[0], t[2].dims[1]],
            || format!("{} = {} x {} is not a matrix product", t[0], t[1], t[2]),
        ),
        FullyConnected => expect(
            t[1].rank() >= 2
                && t[2].rank() == 2
                && t[3].rank() == 1
                && t[1].slice_size() == t[2].dims[0]
                && t[2].dims[1] == t[3].dims[0]
                && t[0].dims == [t[1].dims[0], t[2].dims[1]],
            || format!(
                "fully connected {} <- {}, weights {}, bias {} disagree",
                t[0], t[1], t[2], t[3]
            ),
        ),
        BatchedAdd => expect(
            t[0].dims == t[1].dims && t[1].rank() >= 1 && t[1].dims[1..] == t[2].dims[..],
            || format!("cannot add slice {} to the rows of {}", t[2], t[1]),
        ),
        BatchedReduceAdd => expect(
            t[1].rank() >= 1 && t[1].dims[1..] == t[0].dims[..],
            || format!("cannot reduce {} into {}", t[1], t[0]),
        ),
        Convolution(window) => {
            check_conv(t[1], t[2], t[0], *window)?;
            expect(t[3].dims == [t[2].dims[0]], || format!("bias {} does not fit {}", t[3], t[2]))
        }
        ConvolutionInputGrad(window) => check_conv(t[0], t[1], t[2], *window),
        ConvolutionFilterGrad(window) => check_conv(t[1], t[0], t[2], *window),
        PoolMax(window) | PoolAvg(window) => {
            let expected = pooled_dims(t[1], *window, t[1].dims.get(3).copied().unwrap_or(0));
            expect(expected.as_deref() == Some(t[0].dims.as_slice()), || {
                format!("pooled output {} does not match input {}", t[0], t[1])
            })
        }
        PoolMaxGrad(window) => {
            same_dims(&t[..2])?;
            let expected = pooled_dims(t[1], *window, t[1].dims.get(3).copied().unwrap_or(0));
            expect(expected.as_deref() == Some(t[2].dims.as_slice()), || {
                format!("output gradient {} does not match input {}", t[2], t[1])
            })
        }
        PoolAvgGrad(window) => {
            let expected = pooled_dims(t[0], *window, t[0].dims.get(3).copied().unwrap_or(0));
            expect(expected.as_deref() == Some(t[1].dims.as_slice()), || {
                format!("output gradient {} does not match input {}", t[1], t[0])
            })
        }
        SoftMax | SoftMaxGrad => {
            same_dims(&t[..2])?;
            expect(
                t[0].rank() == 2 && t[2].elem == ElemKind::Index && t[2].dims == [t[0].dims[0], 1],
                || format!("softmax over {} needs index labels [N, 1], got {}", t[0], t[2]),
            )
        }
        Gather => {
            let mut dims = t[2].dims.clone();
            dims.extend_from_slice(t[1].dims.get(1..).unwrap_or(&[]));
            expect(
                t[2].elem == ElemKind::Index && t[1].rank() >= 1 && t[0].dims == dims,
                || format!("gather of {} by {} cannot produce {}", t[1], t[2], t[0]),
            )
        }
        Transpose(shuffle) => {
            let permuted: Option<Vec<usize>> =
                shuffle.iter().map(|&axis| t[1].dims.get(axis).copied()).collect();
            expect(
                shuffle.len() == t[1].rank() && permuted.as_deref() == Some(t[0].dims.as_slice()),
                || format!("{} is not {} transposed by {shuffle:?}", t[0], t[1]),
            )
        }
        Reshape => expect(t[0].size() == t[1].size(), || {
            format!("cannot reshape {} into {}", t[1], t[0])
        }),
        Quantize => {
            same_dims(t)?;
            expect(t[0].is_quantized() && t[1].elem == ElemKind::Float, || {
                format!("cannot quantize {} into {}", t[1], t[0])
            })
        }
        Dequantize => {
            same_dims(t)?;
            expect(t[0].elem == ElemKind::Float && t[1].is_quantized(), || {
                format!("cannot dequantize {} into {}", t[1], t[0])
            })
        }
        RescaleQuantized => {
            same_dims(t)?;
            expect(t[0].is_quantized() && t[1].is_quantized(), || {
                format!("cannot rescale {} into {}", t[1], t[0])
            })
        }
    }
}
