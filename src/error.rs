use crate::ir::Value;

/// All errors that can occur while building, lowering, differentiating or
/// running a graph.
///
/// Three families live here. Configuration errors come from the graph author
/// (duplicate names, bad bindings). Compiler-internal errors mean the graph or
/// the pipeline is malformed (unresolved types, missing rules, writes to
/// constant storage). Kernel errors are raised by a backend while executing an
/// instruction. None of them is retried: the current operation is aborted.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two storage locations, variables or functions share a name in one scope.
    #[error("duplicate name '{name}' in {scope}")]
    DuplicateName { name: String, scope: &'static str },

    /// An external tensor does not match the type of the location it is bound to.
    #[error("cannot bind tensor of type {got} to '{name}' of type {expected}")]
    BindingMismatch {
        name: String,
        expected: String,
        got: String,
    },

    /// A payload handed to a variable or location has the wrong type.
    #[error("payload of type {got} does not fit '{name}' of type {expected}")]
    PayloadMismatch {
        name: String,
        expected: String,
        got: String,
    },

    /// A private location was used as an external input or result.
    #[error("location '{name}' is private and cannot be {action} externally")]
    VisibilityViolation { name: String, action: &'static str },

    /// No storage location with that name exists.
    #[error("unknown storage location '{0}'")]
    UnknownLocation(String),

    /// No variable with that name or id exists in the module.
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    /// No function with that id exists in the module.
    #[error("unknown function #{0}")]
    UnknownFunction(usize),

    /// `run`/`run_batch` was called before anything was compiled.
    #[error("no compiled unit is active; call compile() first")]
    NotCompiled,

    /// A node references something that does not exist or has the wrong arity.
    #[error("invalid node '{node}': {reason}")]
    InvalidNode { node: String, reason: String },

    /// A value-producing node carries no resolved output type.
    #[error("cannot resolve the output type of node '{0}'")]
    UnresolvedType(String),

    /// The operator has no lowering rule.
    #[error("no lowering rule for operator '{op}' (node '{node}')")]
    MissingLowering { op: String, node: String },

    /// The operator sits on a gradient path but has no gradient rule.
    #[error("no gradient rule for operator '{op}' (node '{node}')")]
    MissingGradient { op: String, node: String },

    /// Differentiation found no loss-producing node feeding a save.
    #[error("function '{0}' has no loss node (softmax or regression) feeding a save")]
    NoLoss(String),

    /// The graph contains a cycle.
    #[error("function '{0}' is not acyclic")]
    Cycle(String),

    /// An instruction writes a location tagged `Constant`.
    #[error("instruction '{instr}' writes constant location '{location}'")]
    ConstantWrite { instr: String, location: String },

    /// An instruction reads a value before any instruction defined it.
    #[error("instruction '{instr}' reads {value:?} ('{location}') before it is defined")]
    UndefinedOperand {
        instr: String,
        value: Value,
        location: String,
    },

    /// Operand count, direction, type or shape disagrees with the instruction kind.
    #[error("instruction '{instr}' ({kind}): {reason}")]
    InstrSignature {
        instr: String,
        kind: String,
        reason: String,
    },

    /// A kernel failed while executing an instruction.
    #[error("kernel failure in '{instr}': {reason}")]
    Kernel { instr: String, reason: String },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub(crate) fn kernel(instr: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Kernel {
            instr: instr.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
