use thiserror::Error;

/// Defects detected while emitting or resolving bytecode.
///
/// Every variant is a front-end bug, not a property of the program being
/// compiled: a well-behaved front end never sees these.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("label {index} was referenced but never placed")]
    UnresolvedLabel { index: usize },

    #[error("label {index} placed twice")]
    RedefinedLabel { index: usize },

    #[error("reserved slot at {pos} never filled in")]
    UnresolvedReserved { pos: usize },

    #[error("jump offset {offset} does not fit in {bits} bits")]
    OffsetOverflow { offset: i64, bits: u32 },

    #[error("function {name:?} referenced but never defined")]
    UndefinedFunc { name: String },

    #[error("function {name:?} defined twice")]
    RedefinedFunc { name: String },

    #[error("function {name:?} still open at resolve")]
    UnclosedFunc { name: String },

    #[error("function {name:?} declared both fixed-arity and variadic")]
    ArityConflict { name: String },

    #[error("function {name:?} closed without an arity declaration")]
    ArityUndetermined { name: String },

    #[error("variadic function {name:?} must take at least the sequence parameter")]
    BadVariadicSignature { name: String },

    #[error("function table index {index} for {name:?} exceeds the call operand width")]
    FuncIndexOverflow { name: String, index: u32 },

    #[error("variable {name:?} addressed twice")]
    RedefinedVar { name: String },

    #[error("variable {name:?} used before it was defined")]
    UndefinedVar { name: String },

    #[error("variable address (scope {scope}, index {index}) out of encodable range")]
    InvalidVarAddr { scope: u32, index: u32 },

    #[error("variable {name:?} defined outside any open function or the global scope")]
    ScopeMismatch { name: String },

    #[error("leave_block without a matching enter_block")]
    UnbalancedBlock,
}
