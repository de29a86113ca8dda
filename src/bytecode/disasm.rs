use serde::Serialize;

use crate::bytecode::code::Code;
use crate::bytecode::instr::{CodecError, decode_instr};

// =============================================================================
// DISASSEMBLER
// =============================================================================

/// One decoded instruction line, ready for display or serialization.
#[derive(Debug, Clone, Serialize)]
pub struct DisasmLine {
    pub pc: usize,
    pub name: &'static str,
    pub arg1: Option<(&'static str, i32)>,
    pub arg2: Option<(&'static str, i32)>,
}

impl std::fmt::Display for DisasmLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:05} {}", self.pc, self.name)?;
        if let Some((n, v)) = self.arg1 {
            write!(f, " {}={}", n, v)?;
        }
        if let Some((n, v)) = self.arg2 {
            write!(f, " {}={}", n, v)?;
        }
        Ok(())
    }
}

/// Decode every instruction of a code object.
pub fn disasm(code: &Code) -> Result<Vec<DisasmLine>, CodecError> {
    code.data
        .iter()
        .enumerate()
        .map(|(pc, &i)| {
            let d = decode_instr(i)?;
            Ok(DisasmLine {
                pc,
                name: d.name,
                arg1: d.arg1,
                arg2: d.arg2,
            })
        })
        .collect()
}

/// Render the whole instruction stream as text, one line per word.
pub fn dump(code: &Code) -> Result<String, CodecError> {
    let mut out = String::new();
    for line in disasm(code)? {
        out.push_str(&line.to_string());
        out.push('\n');
    }
    Ok(out)
}
