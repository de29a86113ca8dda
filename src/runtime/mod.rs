pub mod context;
pub mod ops;
pub mod runtime_error;

pub use context::{Context, Frame, GoTask, Scheduler, Stack};
pub use runtime_error::RuntimeError;
