pub mod interpreter;
pub mod kernels;

mod tests;

pub use interpreter::Interpreter;

use crate::error::Result;
use crate::ir::{IrFunction, StorageArena};

/// Something that can execute a lowered function.
///
/// Weights live in the engine's arena and are shared by every compiled unit;
/// activations belong to the function being executed.
pub trait Backend {
    fn name(&self) -> &str;

    /// Execute every instruction of `function` in order. The first failing
    /// instruction aborts the run.
    fn execute(&mut self, function: &mut IrFunction, weights: &mut StorageArena) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BackendKind {
    #[default]
    Interpreter,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Interpreter => write!(f, "interpreter"),
        }
    }
}

// Backend selection
pub fn create_backend(kind: BackendKind) -> Box<dyn Backend> {
    match kind {
        BackendKind::Interpreter => Box::new(Interpreter::new()),
    }
}
