pub mod builder;
pub mod module;
pub mod node;
mod tests;

pub use builder::Builder;
pub use module::{DEFAULT_SEED, Function, FunctionId, Module, TrainKind, Variable};
pub use node::{LrnParams, Node, NodeId, NodeKind, NodeRef, SgdParams, VarId, Window};
