//! # Ferrox IR
//!
//! A small neural-network graph compiler and execution engine, written on top
//! of `ndarray`.
//!
//! A network is declared as a [`graph::Function`] over module variables,
//! lowered into a flat, memory-explicit instruction sequence over tagged
//! storage locations ([`ir`]), and executed by a [`backend::Backend`].
//! Training differentiates the graph first ([`autodiff`]), appending gradient
//! nodes and one SGD update per trainable weight.
//!
//! ## Features
//!
//! - Storage classification: every location is `Constant` or `Mutable`, and
//!   `Public` or `Private`
//! - Shape-checked graph builder for the usual layers (fully connected,
//!   convolution, pooling, LRN, softmax, regression)
//! - Deterministic lowering with optional in-place activations
//! - Reverse-mode differentiation with SGD, momentum and L2 decay
//! - Int8 quantized tensors
//! - Reference CPU interpreter
//!
//! ## Example
//!
//! ```
//! use ferrox_ir::{CompilationMode, ExecutionEngine, Tensor, TrainKind, Type, Visibility};
//!
//! let mut engine = ExecutionEngine::default();
//! let module = engine.module_mut();
//! let f = module.create_function("net").unwrap();
//! let x = module
//!     .create_variable("x", Type::float(&[1, 3]), Visibility::Public, TrainKind::None)
//!     .unwrap();
//! let mut b = module.builder(f).unwrap();
//! let y = b.create_relu("relu", x).unwrap();
//! b.create_save("y", y).unwrap();
//!
//! engine.compile(CompilationMode::Infer, f).unwrap();
//! let input = Tensor::from_f32(&[1, 3], vec![-1.0, 0.5, 2.0]).unwrap();
//! engine.run(&[("x", &input)]).unwrap();
//! assert_eq!(engine.read("y").unwrap().to_vec(), vec![0.0, 0.5, 2.0]);
//! ```

pub mod autodiff;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod initializers;
pub mod ir;
pub mod lower;
pub mod tensor;

// Re-export commonly used types for convenience
pub use backend::{Backend, BackendKind, Interpreter};
pub use config::TrainingConfig;
pub use engine::{CompilationMode, CompiledUnit, ExecutionEngine};
pub use error::{Error, Result};
pub use graph::{Builder, FunctionId, Module, NodeKind, NodeRef, TrainKind, VarId, Window};
pub use ir::{Mutability, Visibility};
pub use tensor::{ElemKind, Tensor, Type};
