pub mod cputensor;
pub mod types;


pub use cputensor::Tensor;
pub use types::{ElemKind, Type};
