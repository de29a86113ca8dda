pub mod build_error;
pub mod builder;
pub mod code;
pub mod disasm;
pub mod func;
pub mod instr;
pub mod var;

pub use build_error::BuildError;
pub use builder::{Builder, CompRef, ForRef, Label, Reserved};
pub use code::{Code, Comprehension, ForPhrase, FuncInfo, HostCall, HostFun, Lit, StructInfo};
pub use disasm::{DisasmLine, disasm, dump};
pub use func::FuncRef;
pub use instr::{CodecError, Decoded, Instr, decode_instr, encode_instr};
pub use var::Var;
