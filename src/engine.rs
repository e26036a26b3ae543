//! Execution engine: owns the module, the persistent weights and one compiled
//! unit per mode, and drives a backend over them.

use crate::autodiff::differentiate;
use crate::backend::{Backend, BackendKind, create_backend};
use crate::config::TrainingConfig;
use crate::error::{Error, Result};
use crate::graph::{FunctionId, Module};
use crate::ir::{IrFunction, StorageLocation};
use crate::lower::{WeightStore, lower};
use crate::tensor::{Tensor, Type};
use std::fmt;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompilationMode {
    /// Forward pass only.
    Infer,
    /// Forward pass, gradients and one SGD update per run.
    Train,
}

impl fmt::Display for CompilationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompilationMode::Infer => write!(f, "infer"),
            CompilationMode::Train => write!(f, "train"),
        }
    }
}

/// A lowered function ready to run, with the mode it was compiled for.
#[derive(Debug)]
pub struct CompiledUnit {
    mode: CompilationMode,
    source: FunctionId,
    function: IrFunction,
}

impl CompiledUnit {
    pub fn mode(&self) -> CompilationMode {
        self.mode
    }

    /// Graph function this unit was compiled from.
    pub fn source(&self) -> FunctionId {
        self.source
    }

    pub fn function(&self) -> &IrFunction {
        &self.function
    }
}

pub struct ExecutionEngine {
    module: Module,
    config: TrainingConfig,
    weights: WeightStore,
    backend: Box<dyn Backend>,
    infer: Option<CompiledUnit>,
    train: Option<CompiledUnit>,
    active: Option<CompilationMode>,
}

impl fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .field("weights", &self.weights.arena().len())
            .field("active", &self.active)
            .finish()
    }
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        Self::new(BackendKind::default())
    }
}

impl ExecutionEngine {
    pub fn new(kind: BackendKind) -> Self {
        Self::with_module(kind, Module::new())
    }

    /// Engine over an already built module.
    pub fn with_module(kind: BackendKind, module: Module) -> Self {
        Self {
            module,
            config: TrainingConfig::default(),
            weights: WeightStore::new(),
            backend: create_backend(kind),
            infer: None,
            train: None,
            active: None,
        }
    }

    pub fn with_config(mut self, config: TrainingConfig) -> Self {
        self.config = config;
        self
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn module_mut(&mut self) -> &mut Module {
        &mut self.module
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Changes take effect at the next `compile(Train, ..)`.
    pub fn config_mut(&mut self) -> &mut TrainingConfig {
        &mut self.config
    }

    pub fn weights(&self) -> &WeightStore {
        &self.weights
    }

    pub fn weights_mut(&mut self) -> &mut WeightStore {
        &mut self.weights
    }

    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    pub fn unit(&self, mode: CompilationMode) -> Option<&CompiledUnit> {
        match mode {
            CompilationMode::Infer => self.infer.as_ref(),
            CompilationMode::Train => self.train.as_ref(),
        }
    }

    pub fn active_mode(&self) -> Option<CompilationMode> {
        self.active
    }

    /// Switch to the retained unit of `mode` without recompiling it.
    pub fn set_active(&mut self, mode: CompilationMode) -> Result<()> {
        self.unit(mode).ok_or(Error::NotCompiled)?;
        self.active = Some(mode);
        debug!(%mode, "activated unit");
        Ok(())
    }

    /// Compile `function` for `mode`, replacing any earlier unit of that mode
    /// and making the new one active.
    ///
    /// Training differentiates the function with the current config first.
    /// Weights already allocated by an earlier compilation are reused, so a
    /// training unit updates exactly what an inference unit reads.
    pub fn compile(&mut self, mode: CompilationMode, function: FunctionId) -> Result<()> {
        let function_ir = match mode {
            CompilationMode::Infer => {
                let graph = self.module.function(function)?;
                lower(&self.module, graph, &mut self.weights)?
            }
            CompilationMode::Train => {
                let graph = differentiate(&mut self.module, function, &self.config)?;
                lower(&self.module, &graph, &mut self.weights)?
            }
        };
        info!(
            %mode,
            function = function_ir.name(),
            instructions = function_ir.len(),
            weights = self.weights.arena().len(),
            backend = self.backend.name(),
            "compiled"
        );

        let unit = CompiledUnit {
            mode,
            source: function,
            function: function_ir,
        };
        match mode {
            CompilationMode::Infer => self.infer = Some(unit),
            CompilationMode::Train => self.train = Some(unit),
        }
        self.active = Some(mode);
        Ok(())
    }

    /// Bind `bindings` to their public weight locations and run the active
    /// unit once.
    pub fn run(&mut self, bindings: &[(&str, &Tensor)]) -> Result<()> {
        self.active.ok_or(Error::NotCompiled)?;
        for (name, tensor) in bindings {
            let location = self.public_location(name, "bound")?;
            if tensor.ty() != location.ty() {
                return Err(binding_mismatch(name, location.ty(), tensor.ty()));
            }
        }
        for (name, tensor) in bindings {
            self.payload_mut(name)?.copy_from(tensor)?;
        }
        self.execute()
    }

    /// Run the active unit `iterations` times. Before iteration `i`, each
    /// location with leading dimension `b` receives the `b` rows of its
    /// tensor starting at `(i * b) % N`, wrapping around the tensor's `N`
    /// rows.
    pub fn run_batch(&mut self, iterations: usize, bindings: &[(&str, &Tensor)]) -> Result<()> {
        self.active.ok_or(Error::NotCompiled)?;
        for (name, tensor) in bindings {
            let location = self.public_location(name, "bound")?;
            if !rows_compatible(location.ty(), tensor.ty()) {
                return Err(binding_mismatch(name, location.ty(), tensor.ty()));
            }
        }

        for i in 0..iterations {
            for (name, tensor) in bindings {
                let payload = self.payload_mut(name)?;
                let batch = payload.dims()[0];
                let start = (i * batch) % tensor.dims()[0];
                payload.copy_rows_from(tensor, start)?;
            }
            self.execute()?;
            debug!(iteration = i, of = iterations, "ran batch");
        }
        Ok(())
    }

    /// Contents of a public weight location.
    pub fn read(&self, name: &str) -> Result<&Tensor> {
        Ok(self.public_location(name, "read")?.payload())
    }

    /// Overwrite a public weight location outside of a run.
    pub fn write(&mut self, name: &str, tensor: &Tensor) -> Result<()> {
        let location = self.public_location(name, "written")?;
        if tensor.ty() != location.ty() {
            return Err(binding_mismatch(name, location.ty(), tensor.ty()));
        }
        self.payload_mut(name)?.copy_from(tensor)
    }

    fn execute(&mut self) -> Result<()> {
        let mode = self.active.ok_or(Error::NotCompiled)?;
        let unit = match mode {
            CompilationMode::Infer => self.infer.as_mut(),
            CompilationMode::Train => self.train.as_mut(),
        }
        .ok_or(Error::NotCompiled)?;
        self.backend
            .execute(&mut unit.function, self.weights.arena_mut())
    }

    fn public_location(&self, name: &str, action: &'static str) -> Result<&StorageLocation> {
        let location = self
            .weights
            .arena()
            .by_name(name)
            .ok_or_else(|| Error::UnknownLocation(name.to_string()))?;
        if !location.is_public() {
            return Err(Error::VisibilityViolation {
                name: name.to_string(),
                action,
            });
        }
        Ok(location)
    }

    fn payload_mut(&mut self, name: &str) -> Result<&mut Tensor> {
        let arena = self.weights.arena_mut();
        let id = arena
            .id_of(name)
            .ok_or_else(|| Error::UnknownLocation(name.to_string()))?;
        Ok(arena.get_mut(id)?.payload_mut())
    }
}

fn binding_mismatch(name: &str, expected: &Type, got: &Type) -> Error {
    Error::BindingMismatch {
        name: name.to_string(),
        expected: expected.to_string(),
        got: got.to_string(),
    }
}

/// Whether rows of `src` can be copied into `dest`: same element type and
/// rank, equal trailing dimensions and a non-empty source.
fn rows_compatible(dest: &Type, src: &Type) -> bool {
    dest.rank() > 0
        && dest.rank() == src.rank()
        && dest.dims[1..] == src.dims[1..]
        && src.dims[0] > 0
        && dest.elem == src.elem
        && dest.scale == src.scale
        && dest.offset == src.offset
}
