//! Low-level IR: tagged storage locations and a flat, memory-explicit
//! instruction sequence over them.

pub mod function;
pub mod instr;
pub mod storage;

pub use function::IrFunction;
pub use instr::{Direction, InstrKind, Instruction, Operand};
pub use storage::{LocationId, Mutability, StorageArena, StorageLocation, Value, Visibility};
