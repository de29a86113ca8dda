use thiserror::Error;

// =============================================================================
// INSTRUCTION WORD LAYOUT
// =============================================================================
//
// Every instruction is one 32-bit word:
//
//   | 31 .. 26 | 25 .............. 0 |
//   |  opcode  |      operands       |
//
// The 26 operand bits are split per opcode, widest field first. Signed
// operands (jump offsets, small literals) are recovered by shifting the word
// left to the field boundary and arithmetic-shifting back down.

/// One encoded instruction word.
pub type Instr = u32;

pub const BITS_OP: u32 = 6;
pub const BITS_OP_SHIFT: u32 = 32 - BITS_OP;
/// Mask for the full 26-bit operand area.
pub const BITS_OPERAND: u32 = (1 << BITS_OP_SHIFT) - 1;

/// Width of the scope field in `loadVar`/`storeVar`/`addrVar`.
pub const BITS_VAR_SCOPE: u32 = 6;
pub const BITS_OP_VAR_SHIFT: u32 = BITS_OP_SHIFT - BITS_VAR_SCOPE;
/// Largest slot index addressable inside a single frame.
pub const BITS_OP_VAR_OPERAND: u32 = (1 << BITS_OP_VAR_SHIFT) - 1;

/// Width of the arity field in variadic call instructions.
pub const BITS_FUNCV_ARITY: u32 = 10;
pub const BITS_OP_CALLV_SHIFT: u32 = BITS_OP_SHIFT - BITS_FUNCV_ARITY;
pub const FUNCV_ARITY_OPERAND: u32 = (1 << BITS_FUNCV_ARITY) - 1;
/// Arity sentinel: the argument sequence was already collected on the stack.
pub const FUNCV_ARITY_VAR: u32 = FUNCV_ARITY_OPERAND;
/// Largest argument count encodable in the arity field. One past it, the
/// excess count is pushed as an int and the field holds `FUNCV_ARITY_MAX`.
pub const FUNCV_ARITY_MAX: u32 = FUNCV_ARITY_OPERAND - 1;

/// Width of the kind field in operator-dispatch instructions.
pub const BITS_KIND: u32 = 5;

// =============================================================================
// OPCODES
// =============================================================================

/// Placeholder word left by `reserve`; decoding one is a build defect.
pub const OP_INVALID: u32 = 0;
pub const OP_PUSH_INT: u32 = 1;
pub const OP_PUSH_CONST: u32 = 2;
pub const OP_PUSH_SPEC: u32 = 3;
pub const OP_POP: u32 = 4;
pub const OP_BUILTIN: u32 = 5;
pub const OP_ADDR_OP: u32 = 6;
pub const OP_TYPE_CAST: u32 = 7;
pub const OP_ZERO: u32 = 8;
pub const OP_JMP: u32 = 9;
pub const OP_JMP_IF: u32 = 10;
pub const OP_CASE_NE: u32 = 11;
pub const OP_LOAD_VAR: u32 = 12;
pub const OP_STORE_VAR: u32 = 13;
pub const OP_ADDR_VAR: u32 = 14;
pub const OP_LOAD: u32 = 15;
pub const OP_STORE: u32 = 16;
pub const OP_CALL_FUNC: u32 = 17;
pub const OP_CALL_FUNCV: u32 = 18;
pub const OP_RETURN: u32 = 19;
pub const OP_CLOSURE: u32 = 20;
pub const OP_CALL_CLOSURE: u32 = 21;
pub const OP_CALL_HOST: u32 = 22;
pub const OP_CALL_HOSTV: u32 = 23;
pub const OP_MAKE_LIST: u32 = 24;
pub const OP_INDEX: u32 = 25;
pub const OP_STRUCT: u32 = 26;
pub const OP_LOAD_FIELD: u32 = 27;
pub const OP_STORE_FIELD: u32 = 28;
pub const OP_ADDR_FIELD: u32 = 29;
pub const OP_FOR_ITER: u32 = 30;
pub const OP_LIST_COMP: u32 = 31;
pub const OP_ERR_WRAP: u32 = 32;
pub const OP_WRAP_IF_ERR: u32 = 33;
pub const OP_DEFER: u32 = 34;
pub const OP_GO: u32 = 35;

pub const OP_COUNT: usize = 36;

// =============================================================================
// INSTRUCTION INFO
// =============================================================================

/// Static description of an opcode's mnemonic and operand layout.
///
/// `params` packs the two field widths as `(bits1 << 8) | bits2`. A
/// single-operand opcode declares its width in the low byte with `bits1 = 0`,
/// so the operand occupies the low bits of the word.
#[derive(Debug, Clone, Copy)]
pub struct InstrInfo {
    pub name: &'static str,
    pub arg1: &'static str,
    pub arg2: &'static str,
    pub params: u16,
}

const fn info(name: &'static str, arg1: &'static str, arg2: &'static str, params: u16) -> InstrInfo {
    InstrInfo { name, arg1, arg2, params }
}

pub static INSTR_INFOS: [InstrInfo; OP_COUNT] = [
    info("invalid", "", "", 0),
    info("pushInt", "", "val", 26),
    info("pushConst", "", "idx", 26),
    info("pushSpec", "", "spec", 26),
    info("pop", "", "n", 26),
    info("builtinOp", "kind", "op", (21 << 8) | 5),
    info("addrOp", "op", "kind", (21 << 8) | 5),
    info("typeCast", "", "type", 26),
    info("zero", "", "type", 26),
    info("jmp", "", "offset", 26),
    info("jmpIf", "flag", "offset", (4 << 8) | 22),
    info("caseNE", "n", "offset", (10 << 8) | 16),
    info("loadVar", "scope", "addr", (6 << 8) | 20),
    info("storeVar", "scope", "addr", (6 << 8) | 20),
    info("addrVar", "scope", "addr", (6 << 8) | 20),
    info("load", "", "idx", 26),
    info("store", "", "idx", 26),
    info("callFunc", "", "addr", 26),
    info("callFuncv", "arity", "addr", (10 << 8) | 16),
    info("return", "", "", 0),
    info("closure", "kind", "addr", (2 << 8) | 24),
    info("callClosure", "", "arity", 26),
    info("callHost", "", "addr", 26),
    info("callHostv", "arity", "addr", (10 << 8) | 16),
    info("makeList", "arity", "type", (10 << 8) | 16),
    info("index", "op", "idx", (2 << 8) | 24),
    info("struct", "arity", "layout", (10 << 8) | 16),
    info("loadField", "", "idx", 26),
    info("storeField", "", "idx", 26),
    info("addrField", "", "idx", 26),
    info("forIter", "", "addr", 26),
    info("listComp", "", "addr", 26),
    info("errWrap", "", "idx", 26),
    info("wrapIfErr", "", "offset", 26),
    info("defer", "", "", 0),
    info("go", "", "arity", 26),
];

// =============================================================================
// CODEC
// =============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unknown opcode {op} in instruction {instr:#010x}")]
    UnknownOpcode { op: u32, instr: Instr },
}

const fn mask(bits: u32) -> u32 {
    (1 << bits) - 1
}

/// Pack an instruction word from its opcode and up to two operands.
///
/// Operands are truncated to their declared widths; range checks belong to
/// the emitting layer, which knows whether a field is signed.
pub fn encode_instr(op: u32, p1: i32, p2: i32) -> Instr {
    let inf = &INSTR_INFOS[op as usize];
    let bits1 = (inf.params >> 8) as u32;
    let bits2 = (inf.params & 0xff) as u32;
    let mut i = op << BITS_OP_SHIFT;
    if bits1 > 0 {
        i |= (p1 as u32 & mask(bits1)) << (BITS_OP_SHIFT - bits1);
    }
    if bits2 > 0 {
        i |= p2 as u32 & mask(bits2);
    }
    i
}

/// Extract the next sign-extended field of `bits` width from `v`, whose
/// leftmost bit is already at bit 31. Returns the field and the shifted
/// remainder.
fn get_param(v: i32, bits: u32) -> (i32, i32) {
    if bits == 0 {
        return (0, v);
    }
    (v >> (32 - bits), v << bits)
}

/// A decoded instruction: mnemonic plus sign-extended operand fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub op: u32,
    pub name: &'static str,
    pub arg1: Option<(&'static str, i32)>,
    pub arg2: Option<(&'static str, i32)>,
}

/// Unpack an instruction word.
///
/// All fields come back sign-extended; unsigned consumers reapply their
/// masks. Words whose opcode falls outside the table are rejected.
pub fn decode_instr(i: Instr) -> Result<Decoded, CodecError> {
    let op = i >> BITS_OP_SHIFT;
    if op as usize >= OP_COUNT {
        return Err(CodecError::UnknownOpcode { op, instr: i });
    }
    let inf = &INSTR_INFOS[op as usize];
    let bits1 = (inf.params >> 8) as u32;
    let bits2 = (inf.params & 0xff) as u32;
    let mut v = (i << BITS_OP) as i32;
    let mut arg1 = None;
    let mut arg2 = None;
    if bits1 > 0 {
        let (p1, rest) = get_param(v, bits1);
        arg1 = Some((inf.arg1, p1));
        v = rest;
    }
    if bits2 > 0 {
        let (p2, _) = get_param(v, bits2);
        arg2 = Some((inf.arg2, p2));
    }
    Ok(Decoded { op, name: inf.name, arg1, arg2 })
}
