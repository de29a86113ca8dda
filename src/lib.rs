//! Quill execution core: a bit-packed bytecode format, a builder that emits
//! and backpatches instructions, and a stack-machine interpreter.
//!
//! The crate is the back half of a dynamic-language toolchain. A front end
//! lowers its AST through the [`Builder`] API; [`Builder::resolve`] produces
//! an immutable [`Code`] object; a [`Context`] interprets it. Closures keep a
//! chain of enclosing frames alive, so a variable defined at lexical depth
//! `d` stays reachable from bodies nested below it.

pub mod bytecode;
pub mod lang;
pub mod runtime;

pub use bytecode::{BuildError, Builder, Code, FuncRef, Label, Reserved, Var};
pub use lang::{AddrOperator, Kind, Operator, Type, Value};
pub use runtime::{Context, RuntimeError, Stack};
