use thiserror::Error;

/// Interpreter fault.
///
/// Faults halt execution and unwind to the caller; program-level error
/// values travel on the stack instead and never raise one of these.
#[derive(Debug, Error, PartialEq)]
pub enum RuntimeError {
    #[error("operand stack underflow")]
    StackUnderflow,

    #[error("invalid instruction {instr:#010x} at {ip}")]
    InvalidInstr { instr: u32, ip: usize },

    #[error("no executor for instruction {instr:#010x}")]
    DispatchMiss { instr: u32 },

    #[error("type error: {message}")]
    TypeError { message: String },

    #[error("cannot convert {from} to {to}")]
    BadCoercion { from: String, to: String },

    #[error("division by zero")]
    DivisionByZero,

    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("no variable slot {idx} in frame")]
    BadVarSlot { idx: u32 },

    #[error("instruction pointer {ip} out of range")]
    IpOutOfRange { ip: usize },

    #[error("wrong number of arguments: expected {expected}, got {got}")]
    ArityMismatch { expected: usize, got: usize },

    #[error("value is not callable")]
    NotCallable,
}
