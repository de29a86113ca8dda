pub mod types;
pub mod value;

pub use types::{AddrOperator, Kind, Operator, Type};
pub use value::{ClosureData, ErrValue, StructData, Value, ValueRef, coerce};
