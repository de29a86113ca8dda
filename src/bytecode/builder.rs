use std::collections::{BTreeSet, HashMap};

use crate::bytecode::build_error::BuildError;
use crate::bytecode::code::{Code, Comprehension, ForPhrase, HostCall, HostFun, Lit, StructInfo};
use crate::bytecode::func::{FuncBuild, FuncRef, SiteKind, Variadic};
use crate::bytecode::instr::{
    BITS_OP_SHIFT, FUNCV_ARITY_MAX, Instr, OP_ADDR_OP, OP_ADDR_FIELD, OP_BUILTIN, OP_CALL_HOST,
    OP_CALL_HOSTV, OP_CASE_NE, OP_DEFER, OP_ERR_WRAP, OP_GO, OP_INDEX, OP_JMP, OP_JMP_IF,
    OP_LOAD, OP_LOAD_FIELD, OP_MAKE_LIST, OP_POP, OP_PUSH_CONST, OP_PUSH_INT, OP_PUSH_SPEC,
    OP_RETURN, OP_STORE, OP_STORE_FIELD, OP_STRUCT, OP_TYPE_CAST, OP_WRAP_IF_ERR, OP_ZERO,
    encode_instr,
};
use crate::bytecode::var::{Var, VarManager};
use crate::lang::types::{AddrOperator, Kind, Operator, Type};

// =============================================================================
// HANDLES
// =============================================================================

/// Forward-reference jump target. Place it with [`Builder::label`]; every
/// jump emitted against it is backpatched at resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(pub(crate) usize);

/// A reserved instruction slot, filled in later with [`Builder::emit_reserved`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reserved(pub(crate) usize);

/// An open iteration phrase; closed by [`Builder::end_for_phrase`].
#[derive(Debug)]
pub struct ForRef {
    skip: usize,
    start: usize,
    key: Option<u32>,
    value: Option<u32>,
}

/// An open comprehension body; closed by [`Builder::end_comprehension`].
#[derive(Debug)]
pub struct CompRef {
    skip: usize,
    start: usize,
}

#[derive(Debug, Default)]
pub(crate) struct LabelState {
    pub(crate) pos: Option<usize>,
    pub(crate) uses: Vec<usize>,
}

/// `pushSpec` operand values.
const SPEC_FALSE: i32 = 0;
const SPEC_TRUE: i32 = 1;
const SPEC_NIL: i32 = 2;

/// `index` operand sentinel: the element index is on the stack.
const INDEX_ON_STACK: u32 = (1 << 24) - 1;

// =============================================================================
// BUILDER
// =============================================================================

/// Two-phase bytecode emitter.
///
/// The front end emits instructions and records forward references through
/// [`Label`], [`FuncRef`] and [`Reserved`] handles; [`Builder::resolve`]
/// backpatches every reference and produces the immutable [`Code`]. Any
/// reference still dangling at resolve is reported as a [`BuildError`].
#[derive(Debug, Default)]
pub struct Builder {
    pub(crate) code: Code,
    pub(crate) labels: Vec<LabelState>,
    pub(crate) funcs: Vec<FuncBuild>,
    pub(crate) active: Vec<FuncRef>,
    pub(crate) globals: VarManager,
    pub(crate) blocks: Vec<usize>,
    pub(crate) const_idx: HashMap<Lit, u32>,
    pub(crate) type_idx: HashMap<Type, u32>,
    pending_reserved: BTreeSet<usize>,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Current emit position, in instruction words.
    pub fn here(&self) -> usize {
        self.code.data.len()
    }

    pub(crate) fn emit(&mut self, i: Instr) {
        self.code.data.push(i);
    }

    /// Nesting depth of the innermost open scope; 0 is the global scope.
    pub(crate) fn nest_depth(&self) -> u32 {
        match self.active.last() {
            Some(f) => self.funcs[f.0].vars.nest_depth,
            None => 0,
        }
    }

    pub(crate) fn scope_vars(&self) -> &VarManager {
        match self.active.last() {
            Some(f) => &self.funcs[f.0].vars,
            None => &self.globals,
        }
    }

    pub(crate) fn scope_vars_mut(&mut self) -> &mut VarManager {
        match self.active.last() {
            Some(f) => &mut self.funcs[f.0].vars,
            None => &mut self.globals,
        }
    }

    // =========================================================================
    // LITERALS
    // =========================================================================

    fn const_index(&mut self, lit: Lit) -> u32 {
        if let Some(&idx) = self.const_idx.get(&lit) {
            return idx;
        }
        let idx = self.code.consts.len() as u32;
        self.code.consts.push(lit.clone());
        self.const_idx.insert(lit, idx);
        idx
    }

    pub(crate) fn type_index(&mut self, t: &Type) -> u32 {
        if let Some(&idx) = self.type_idx.get(t) {
            return idx;
        }
        let idx = self.code.types.len() as u32;
        self.code.types.push(t.clone());
        self.type_idx.insert(t.clone(), idx);
        idx
    }

    /// Push an int. Small values pack into the instruction word; the rest
    /// go through the constant pool.
    pub fn push_int(&mut self, v: i64) -> &mut Self {
        const MAX: i64 = (1 << 25) - 1;
        const MIN: i64 = -(1 << 25);
        if (MIN..=MAX).contains(&v) {
            self.emit(encode_instr(OP_PUSH_INT, 0, v as i32));
        } else {
            let idx = self.const_index(Lit::Int(v));
            self.emit(encode_instr(OP_PUSH_CONST, 0, idx as i32));
        }
        self
    }

    pub fn push_uint(&mut self, v: u64) -> &mut Self {
        let idx = self.const_index(Lit::Uint(v));
        self.emit(encode_instr(OP_PUSH_CONST, 0, idx as i32));
        self
    }

    pub fn push_float(&mut self, v: f64) -> &mut Self {
        let idx = self.const_index(Lit::Float(v.to_bits()));
        self.emit(encode_instr(OP_PUSH_CONST, 0, idx as i32));
        self
    }

    pub fn push_rune(&mut self, v: char) -> &mut Self {
        let idx = self.const_index(Lit::Rune(v));
        self.emit(encode_instr(OP_PUSH_CONST, 0, idx as i32));
        self
    }

    pub fn push_str(&mut self, v: &str) -> &mut Self {
        let idx = self.const_index(Lit::Str(v.to_string()));
        self.emit(encode_instr(OP_PUSH_CONST, 0, idx as i32));
        self
    }

    pub fn push_bool(&mut self, v: bool) -> &mut Self {
        let spec = if v { SPEC_TRUE } else { SPEC_FALSE };
        self.emit(encode_instr(OP_PUSH_SPEC, 0, spec));
        self
    }

    pub fn push_nil(&mut self) -> &mut Self {
        self.emit(encode_instr(OP_PUSH_SPEC, 0, SPEC_NIL));
        self
    }

    /// Drop the top `n` stack values.
    pub fn pop(&mut self, n: u32) -> &mut Self {
        self.emit(encode_instr(OP_POP, 0, n as i32));
        self
    }

    // =========================================================================
    // OPERATORS
    // =========================================================================

    /// Apply a value operator to operands of the given kind.
    pub fn builtin_op(&mut self, kind: Kind, op: Operator) -> &mut Self {
        self.emit(encode_instr(OP_BUILTIN, kind as i32, op as i32));
        self
    }

    /// Apply an assignment-family operator through the reference under the
    /// operand.
    pub fn addr_op(&mut self, op: AddrOperator, kind: Kind) -> &mut Self {
        self.emit(encode_instr(OP_ADDR_OP, op as i32, kind as i32));
        self
    }

    /// Convert the stack top to the given type.
    pub fn type_cast(&mut self, t: &Type) -> &mut Self {
        let idx = self.type_index(t);
        self.emit(encode_instr(OP_TYPE_CAST, 0, idx as i32));
        self
    }

    /// Push the zero value of the given type.
    pub fn zero(&mut self, t: &Type) -> &mut Self {
        let idx = self.type_index(t);
        self.emit(encode_instr(OP_ZERO, 0, idx as i32));
        self
    }

    // =========================================================================
    // CONTROL FLOW
    // =========================================================================

    pub fn new_label(&mut self) -> Label {
        let l = Label(self.labels.len());
        self.labels.push(LabelState::default());
        l
    }

    /// Place the label at the current position.
    pub fn label(&mut self, l: Label) -> Result<&mut Self, BuildError> {
        let state = &mut self.labels[l.0];
        if state.pos.is_some() {
            return Err(BuildError::RedefinedLabel { index: l.0 });
        }
        state.pos = Some(self.code.data.len());
        Ok(self)
    }

    pub fn jmp(&mut self, l: Label) -> &mut Self {
        let off = self.here();
        self.labels[l.0].uses.push(off);
        self.emit(encode_instr(OP_JMP, 0, 0));
        self
    }

    /// Pop a bool; jump when it matches `when`.
    pub fn jmp_if(&mut self, when: bool, l: Label) -> &mut Self {
        let off = self.here();
        self.labels[l.0].uses.push(off);
        self.emit(encode_instr(OP_JMP_IF, when as i32, 0));
        self
    }

    /// Pop `n` case values; jump unless one of them equals the switch value
    /// beneath. On a match the switch value is popped too.
    pub fn case_ne(&mut self, l: Label, n: u32) -> &mut Self {
        let off = self.here();
        self.labels[l.0].uses.push(off);
        self.emit(encode_instr(OP_CASE_NE, n as i32, 0));
        self
    }

    /// Return from the current function body.
    pub fn ret(&mut self) -> &mut Self {
        self.emit(encode_instr(OP_RETURN, 0, 0));
        self
    }

    /// Append a placeholder word to fill in later.
    pub fn reserve(&mut self) -> Reserved {
        let pos = self.here();
        self.pending_reserved.insert(pos);
        self.emit(0);
        Reserved(pos)
    }

    pub fn emit_reserved(&mut self, r: Reserved, i: Instr) -> &mut Self {
        self.pending_reserved.remove(&r.0);
        self.code.data[r.0] = i;
        self
    }

    // =========================================================================
    // FRAME-RELATIVE ACCESS
    // =========================================================================

    /// Push the frame slot at `idx` relative to the frame base; negative
    /// indices reach the caller's argument area below it.
    pub fn load(&mut self, idx: i32) -> &mut Self {
        self.emit(encode_instr(OP_LOAD, 0, idx));
        self
    }

    pub fn store(&mut self, idx: i32) -> &mut Self {
        self.emit(encode_instr(OP_STORE, 0, idx));
        self
    }

    // =========================================================================
    // SEQUENCES, STRUCTS, INDEXING
    // =========================================================================

    /// Collect `arity` stack values into a list of the given type.
    pub fn make_list(&mut self, t: &Type, arity: u32) -> &mut Self {
        let field = self.spill_arity(arity);
        let idx = self.type_index(t);
        self.emit(encode_instr(OP_MAKE_LIST, field as i32, idx as i32));
        self
    }

    /// Register a struct layout.
    pub fn define_struct(&mut self, name: impl Into<String>, fields: Vec<(String, Type)>) -> u32 {
        let idx = self.code.structs.len() as u32;
        self.code.structs.push(StructInfo {
            name: name.into(),
            fields,
        });
        idx
    }

    /// Collect the field values on the stack into a struct of the layout.
    pub fn make_struct(&mut self, layout: u32, arity: u32) -> &mut Self {
        let field = self.spill_arity(arity);
        self.emit(encode_instr(OP_STRUCT, field as i32, layout as i32));
        self
    }

    pub fn load_field(&mut self, idx: u32) -> &mut Self {
        self.emit(encode_instr(OP_LOAD_FIELD, 0, idx as i32));
        self
    }

    pub fn store_field(&mut self, idx: u32) -> &mut Self {
        self.emit(encode_instr(OP_STORE_FIELD, 0, idx as i32));
        self
    }

    pub fn addr_field(&mut self, idx: u32) -> &mut Self {
        self.emit(encode_instr(OP_ADDR_FIELD, 0, idx as i32));
        self
    }

    /// Read an element: a constant index packs into the word, `None` takes
    /// the index from the stack.
    pub fn index_get(&mut self, idx: Option<u32>) -> &mut Self {
        self.emit_index(0, idx)
    }

    pub fn index_set(&mut self, idx: Option<u32>) -> &mut Self {
        self.emit_index(1, idx)
    }

    pub fn index_addr(&mut self, idx: Option<u32>) -> &mut Self {
        self.emit_index(2, idx)
    }

    fn emit_index(&mut self, op: i32, idx: Option<u32>) -> &mut Self {
        let idx = idx.unwrap_or(INDEX_ON_STACK);
        self.emit(encode_instr(OP_INDEX, op, idx as i32));
        self
    }

    // =========================================================================
    // ITERATION AND COMPREHENSIONS
    // =========================================================================

    /// Open an iteration body. `key`/`value` name the frame slots that
    /// receive the element index and the element; both are optional.
    ///
    /// The body's instructions follow inline; straight-line execution jumps
    /// over them, and `for_iter` runs them once per element.
    pub fn begin_for_phrase(
        &mut self,
        key: Option<&Var>,
        value: Option<&Var>,
    ) -> Result<ForRef, BuildError> {
        let key = key.map(|v| self.loop_slot(v)).transpose()?;
        let value = value.map(|v| self.loop_slot(v)).transpose()?;
        let skip = self.reserve().0;
        Ok(ForRef {
            skip,
            start: self.here(),
            key,
            value,
        })
    }

    /// Close the iteration body; returns its pool index for `for_iter`.
    pub fn end_for_phrase(&mut self, r: ForRef) -> Result<u32, BuildError> {
        let end = self.here();
        self.patch_skip(r.skip, end)?;
        let idx = self.code.fors.len() as u32;
        self.code.fors.push(ForPhrase {
            key: r.key,
            value: r.value,
            start: r.start,
            end,
        });
        Ok(idx)
    }

    /// Pop a sequence and run the iteration body once per element.
    pub fn for_iter(&mut self, phrase: u32) -> &mut Self {
        self.emit(encode_instr(crate::bytecode::instr::OP_FOR_ITER, 0, phrase as i32));
        self
    }

    /// Open a comprehension body. The values it leaves on the stack become
    /// the elements of the collected list.
    pub fn begin_comprehension(&mut self) -> CompRef {
        let skip = self.reserve().0;
        CompRef {
            skip,
            start: self.here(),
        }
    }

    pub fn end_comprehension(&mut self, r: CompRef) -> Result<u32, BuildError> {
        let end = self.here();
        self.patch_skip(r.skip, end)?;
        let idx = self.code.comprehens.len() as u32;
        self.code.comprehens.push(Comprehension {
            start: r.start,
            end,
        });
        Ok(idx)
    }

    /// Run a comprehension body and collect its deposits into a list.
    pub fn list_comp(&mut self, comp: u32) -> &mut Self {
        self.emit(encode_instr(crate::bytecode::instr::OP_LIST_COMP, 0, comp as i32));
        self
    }

    fn loop_slot(&self, v: &Var) -> Result<u32, BuildError> {
        if !v.is_addressed() || v.nest_depth() != self.nest_depth() {
            return Err(BuildError::UndefinedVar {
                name: v.name().to_string(),
            });
        }
        Ok(v.idx())
    }

    // =========================================================================
    // ERRORS, DEFER, GO
    // =========================================================================

    /// If the stack top is an error value, prefix its message with `ctx`.
    pub fn err_wrap(&mut self, ctx: &str) -> &mut Self {
        let idx = self.code.err_wraps.len() as u32;
        self.code.err_wraps.push(ctx.to_string());
        self.emit(encode_instr(OP_ERR_WRAP, 0, idx as i32));
        self
    }

    /// Jump when the stack top is an error value, leaving it in place.
    pub fn wrap_if_err(&mut self, l: Label) -> &mut Self {
        let off = self.here();
        self.labels[l.0].uses.push(off);
        self.emit(encode_instr(OP_WRAP_IF_ERR, 0, 0));
        self
    }

    /// Pop a closure and schedule it to run when the enclosing invocation
    /// finishes.
    pub fn defer_call(&mut self) -> &mut Self {
        self.emit(encode_instr(OP_DEFER, 0, 0));
        self
    }

    /// Pop a closure and `arity` arguments; hand them to the task hook.
    pub fn go_call(&mut self, arity: u32) -> &mut Self {
        self.emit(encode_instr(OP_GO, 0, arity as i32));
        self
    }

    // =========================================================================
    // HOST FUNCTIONS
    // =========================================================================

    pub fn host_func(&mut self, name: impl Into<String>, n_in: usize, f: HostCall) -> u32 {
        let idx = self.code.host_funs.len() as u32;
        self.code.host_funs.push(HostFun {
            name: name.into(),
            n_in,
            variadic: false,
            f,
        });
        idx
    }

    pub fn host_funcv(&mut self, name: impl Into<String>, n_in: usize, f: HostCall) -> u32 {
        let idx = self.code.host_funvs.len() as u32;
        self.code.host_funvs.push(HostFun {
            name: name.into(),
            n_in,
            variadic: true,
            f,
        });
        idx
    }

    pub fn call_host(&mut self, idx: u32) -> &mut Self {
        self.emit(encode_instr(OP_CALL_HOST, 0, idx as i32));
        self
    }

    pub fn call_hostv(&mut self, idx: u32, arity: u32) -> &mut Self {
        let field = self.spill_arity(arity);
        self.emit(encode_instr(OP_CALL_HOSTV, field as i32, idx as i32));
        self
    }

    /// Saturate an arity into its 10-bit field. A saturated field always
    /// means spilled: the excess count (possibly zero) is pushed as an int
    /// literal the interpreter pops back.
    pub(crate) fn spill_arity(&mut self, arity: u32) -> u32 {
        if arity >= FUNCV_ARITY_MAX {
            self.push_int((arity - FUNCV_ARITY_MAX) as i64);
            FUNCV_ARITY_MAX
        } else {
            arity
        }
    }

    // =========================================================================
    // RESOLVE
    // =========================================================================

    /// Backpatch every label, call site and reserved slot and seal the code.
    pub fn resolve(mut self) -> Result<Code, BuildError> {
        if let Some(f) = self.active.last() {
            return Err(BuildError::UnclosedFunc {
                name: self.funcs[f.0].name.clone(),
            });
        }
        if !self.blocks.is_empty() {
            return Err(BuildError::UnbalancedBlock);
        }

        // labels
        for i in 0..self.labels.len() {
            let pos = match self.labels[i].pos {
                Some(p) => p,
                None if self.labels[i].uses.is_empty() => continue,
                None => return Err(BuildError::UnresolvedLabel { index: i }),
            };
            let uses = std::mem::take(&mut self.labels[i].uses);
            for off in uses {
                self.patch_offset(off, pos)?;
            }
        }

        // function tables and call sites
        self.resolve_funcs()?;

        if let Some(&pos) = self.pending_reserved.iter().next() {
            return Err(BuildError::UnresolvedReserved { pos });
        }

        self.code.n_globals = self.globals.len();
        tracing::debug!(
            words = self.code.data.len(),
            consts = self.code.consts.len(),
            funs = self.code.funs.len(),
            funvs = self.code.funvs.len(),
            globals = self.code.n_globals,
            "resolve"
        );
        Ok(self.code)
    }

    fn resolve_funcs(&mut self) -> Result<(), BuildError> {
        use crate::bytecode::code::FuncInfo;

        for fnc in &mut self.funcs {
            let (entry, end) = match (fnc.entry, fnc.end) {
                (Some(entry), Some(end)) => (entry, end),
                _ if fnc.sites.is_empty() => continue,
                _ => {
                    return Err(BuildError::UndefinedFunc {
                        name: fnc.name.clone(),
                    });
                }
            };
            let variadic = fnc.variadic == Variadic::Variadic;
            let table = if variadic {
                &mut self.code.funvs
            } else {
                &mut self.code.funs
            };
            let idx = table.len() as u32;
            fnc.table_idx = Some(idx);
            table.push(FuncInfo {
                name: fnc.name.clone(),
                entry,
                end,
                n_vars: fnc.vars.len(),
                n_in: fnc.arg_vars.len(),
                n_out: fnc.out_vars.len(),
                in_types: fnc.in_types.clone(),
                variadic,
            });

            for &(off, kind) in &fnc.sites {
                match (kind, variadic) {
                    (SiteKind::Fixed, true) | (SiteKind::Variadic, false) => {
                        return Err(BuildError::ArityConflict {
                            name: fnc.name.clone(),
                        });
                    }
                    // callFuncv shares its operand with the 10-bit arity
                    // field, leaving 16 bits for the table index.
                    (SiteKind::Variadic, true) if idx >= 1 << 16 => {
                        return Err(BuildError::FuncIndexOverflow {
                            name: fnc.name.clone(),
                            index: idx,
                        });
                    }
                    (SiteKind::Closure, _) if idx >= 1 << 24 => {
                        return Err(BuildError::FuncIndexOverflow {
                            name: fnc.name.clone(),
                            index: idx,
                        });
                    }
                    (SiteKind::Closure, _) => {
                        self.code.data[off] |= ((variadic as u32) << 24) | idx;
                    }
                    _ => {
                        self.code.data[off] |= idx;
                    }
                }
            }
        }
        Ok(())
    }

    /// Patch a jump-family instruction at `off` to land on `target`. The
    /// offset width is read back from the opcode already in the word.
    fn patch_offset(&mut self, off: usize, target: usize) -> Result<(), BuildError> {
        let op = self.code.data[off] >> BITS_OP_SHIFT;
        let bits: u32 = match op {
            OP_JMP_IF => 22,
            OP_CASE_NE => 16,
            _ => 26,
        };
        let delta = target as i64 - (off as i64 + 1);
        let max = (1i64 << (bits - 1)) - 1;
        let min = -(1i64 << (bits - 1));
        if delta < min || delta > max {
            return Err(BuildError::OffsetOverflow {
                offset: delta,
                bits,
            });
        }
        self.code.data[off] |= (delta as u32) & ((1 << bits) - 1);
        Ok(())
    }

    fn patch_skip(&mut self, skip: usize, target: usize) -> Result<(), BuildError> {
        self.pending_reserved.remove(&skip);
        let delta = target as i64 - (skip as i64 + 1);
        let max = (1i64 << 25) - 1;
        if delta < -(1i64 << 25) || delta > max {
            return Err(BuildError::OffsetOverflow {
                offset: delta,
                bits: 26,
            });
        }
        self.code.data[skip] = encode_instr(OP_JMP, 0, delta as i32);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::instr::decode_instr;

    #[test]
    fn test_forward_and_backward_jumps() {
        let mut b = Builder::new();
        let top = b.new_label();
        let done = b.new_label();
        b.label(top).unwrap();
        b.push_bool(true);
        b.jmp_if(false, done);
        b.jmp(top);
        b.label(done).unwrap();
        let code = b.resolve().unwrap();

        let d = decode_instr(code.data[1]).unwrap();
        assert_eq!(d.arg2, Some(("offset", 1)));
        let d = decode_instr(code.data[2]).unwrap();
        assert_eq!(d.arg2, Some(("offset", -3)));
    }

    #[test]
    fn test_unresolved_label() {
        let mut b = Builder::new();
        let l = b.new_label();
        b.jmp(l);
        assert_eq!(
            b.resolve().unwrap_err(),
            BuildError::UnresolvedLabel { index: 0 }
        );
    }

    #[test]
    fn test_unused_unplaced_label_is_fine() {
        let mut b = Builder::new();
        let _ = b.new_label();
        assert!(b.resolve().is_ok());
    }

    #[test]
    fn test_redefined_label() {
        let mut b = Builder::new();
        let l = b.new_label();
        b.label(l).unwrap();
        assert_eq!(
            b.label(l).unwrap_err(),
            BuildError::RedefinedLabel { index: 0 }
        );
    }

    #[test]
    fn test_const_pool_dedup() {
        let mut b = Builder::new();
        b.push_str("hello").push_str("world").push_str("hello");
        let code = b.resolve().unwrap();
        assert_eq!(code.consts.len(), 2);
        assert_eq!(code.data[0], code.data[2]);
    }

    #[test]
    fn test_small_int_packs_inline() {
        let mut b = Builder::new();
        b.push_int(42).push_int(1 << 30);
        let code = b.resolve().unwrap();
        assert_eq!(decode_instr(code.data[0]).unwrap().name, "pushInt");
        assert_eq!(decode_instr(code.data[1]).unwrap().name, "pushConst");
        assert_eq!(code.consts, vec![Lit::Int(1 << 30)]);
    }

    #[test]
    fn test_unfilled_reserved_slot() {
        let mut b = Builder::new();
        let _ = b.reserve();
        assert_eq!(
            b.resolve().unwrap_err(),
            BuildError::UnresolvedReserved { pos: 0 }
        );
    }

    #[test]
    fn test_unclosed_func() {
        let mut b = Builder::new();
        let f = b.new_func("f");
        b.func_args(f, &[]).unwrap();
        b.define_func(f).unwrap();
        assert_eq!(
            b.resolve().unwrap_err(),
            BuildError::UnclosedFunc { name: "f".into() }
        );
    }

    #[test]
    fn test_call_before_define_is_patched() {
        let mut b = Builder::new();
        let f = b.new_func("f");
        b.call_func(f);
        b.ret();
        b.func_args(f, &[]).unwrap();
        b.define_func(f).unwrap();
        b.end_func(f).unwrap();
        let code = b.resolve().unwrap();
        assert_eq!(decode_instr(code.data[0]).unwrap().arg2, Some(("addr", 0)));
        assert_eq!(code.funs.len(), 1);
        assert_eq!(code.funs[0].entry, 2);
    }

    #[test]
    fn test_variadic_table_index_overflow() {
        let mut b = Builder::new();
        let mut last = None;
        for k in 0..=(1u32 << 16) {
            let f = b.new_func(format!("f{}", k));
            let rest = Var::new(Type::List(Box::new(Type::Any)), "rest");
            b.func_vargs(f, &[rest]).unwrap();
            b.define_func(f).unwrap();
            b.end_func(f).unwrap();
            last = Some(f);
        }
        b.call_funcv(last.unwrap(), Some(0));
        assert_eq!(
            b.resolve().unwrap_err(),
            BuildError::FuncIndexOverflow {
                name: format!("f{}", 1u32 << 16),
                index: 1 << 16,
            }
        );
    }

    #[test]
    fn test_undefined_func_with_call_site() {
        let mut b = Builder::new();
        let f = b.new_func("ghost");
        b.call_func(f);
        assert_eq!(
            b.resolve().unwrap_err(),
            BuildError::UndefinedFunc {
                name: "ghost".into()
            }
        );
    }
}
