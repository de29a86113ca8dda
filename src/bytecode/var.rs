use std::cell::Cell;
use std::rc::Rc;

use crate::bytecode::build_error::BuildError;
use crate::bytecode::builder::Builder;
use crate::bytecode::instr::{
    BITS_OP_VAR_OPERAND, BITS_OP_VAR_SHIFT, BITS_VAR_SCOPE, OP_ADDR_VAR, OP_LOAD_VAR,
    OP_STORE_VAR, encode_instr,
};
use crate::lang::types::Type;

// =============================================================================
// VAR - a lexically scoped variable
// =============================================================================

/// Index value of a variable that has not been addressed yet.
const UNADDRESSED: u32 = u32::MAX;

/// A variable handle created by the front end.
///
/// The handle starts unaddressed; `define_var` assigns it a
/// `(nest_depth, index)` address exactly once. Emitting a load or store for
/// an unaddressed variable is a build defect.
#[derive(Debug)]
pub struct Var {
    typ: Type,
    name: String,
    nest_depth: Cell<u32>,
    idx: Cell<u32>,
}

impl Var {
    pub fn new(typ: Type, name: impl Into<String>) -> Rc<Var> {
        Rc::new(Var {
            typ,
            name: name.into(),
            nest_depth: Cell::new(0),
            idx: Cell::new(UNADDRESSED),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn typ(&self) -> &Type {
        &self.typ
    }

    pub fn is_addressed(&self) -> bool {
        self.idx.get() != UNADDRESSED
    }

    pub(crate) fn set_addr(&self, nest_depth: u32, idx: u32) -> Result<(), BuildError> {
        if self.is_addressed() {
            return Err(BuildError::RedefinedVar {
                name: self.name.clone(),
            });
        }
        self.nest_depth.set(nest_depth);
        self.idx.set(idx);
        Ok(())
    }

    pub(crate) fn nest_depth(&self) -> u32 {
        self.nest_depth.get()
    }

    pub(crate) fn idx(&self) -> u32 {
        self.idx.get()
    }
}

// =============================================================================
// VAR MANAGER - one per lexical function scope
// =============================================================================

/// Slot allocator for one function scope (or the global scope).
///
/// Slot indices are monotonic within a scope: results, then parameters, then
/// locals in definition order. Inner blocks share the frame; `enter_block` /
/// `leave_block` only delimit definition regions for the front end.
#[derive(Debug, Default)]
pub struct VarManager {
    pub(crate) vlist: Vec<Rc<Var>>,
    pub(crate) nest_depth: u32,
}

impl VarManager {
    pub(crate) fn new(nest_depth: u32) -> VarManager {
        VarManager {
            vlist: Vec::new(),
            nest_depth,
        }
    }

    pub(crate) fn add_var(&mut self, v: &Rc<Var>) -> Result<u32, BuildError> {
        let idx = self.vlist.len() as u32;
        v.set_addr(self.nest_depth, idx)?;
        self.vlist.push(v.clone());
        Ok(idx)
    }

    pub(crate) fn len(&self) -> usize {
        self.vlist.len()
    }
}

/// Pack a `(scope hops, slot index)` pair into the 26-bit operand of the
/// variable instructions.
pub(crate) fn make_addr(scope: u32, idx: u32) -> Result<u32, BuildError> {
    if scope >= (1 << BITS_VAR_SCOPE) || idx > BITS_OP_VAR_OPERAND {
        return Err(BuildError::InvalidVarAddr { scope, index: idx });
    }
    Ok((scope << BITS_OP_VAR_SHIFT) | idx)
}

// =============================================================================
// BUILDER - variable operations
// =============================================================================

impl Builder {
    /// Bind a variable to the next slot of the innermost open scope.
    pub fn define_var(&mut self, v: &Rc<Var>) -> Result<&mut Self, BuildError> {
        let scope = self.scope_vars_mut();
        let idx = scope.add_var(v)?;
        tracing::debug!(name = v.name(), depth = v.nest_depth(), idx, "define_var");
        Ok(self)
    }

    /// Push the variable's current value.
    pub fn load_var(&mut self, v: &Var) -> Result<&mut Self, BuildError> {
        let (scope, idx) = self.var_addr(v)?;
        self.emit(encode_instr(OP_LOAD_VAR, scope as i32, idx as i32));
        Ok(self)
    }

    /// Pop the stack top into the variable.
    pub fn store_var(&mut self, v: &Var) -> Result<&mut Self, BuildError> {
        let (scope, idx) = self.var_addr(v)?;
        self.emit(encode_instr(OP_STORE_VAR, scope as i32, idx as i32));
        Ok(self)
    }

    /// Push a reference to the variable's slot.
    pub fn addr_var(&mut self, v: &Var) -> Result<&mut Self, BuildError> {
        let (scope, idx) = self.var_addr(v)?;
        self.emit(encode_instr(OP_ADDR_VAR, scope as i32, idx as i32));
        Ok(self)
    }

    /// Open a definition block inside the current scope. Blocks delimit
    /// name regions for the front end; they do not allocate a frame.
    pub fn enter_block(&mut self) -> &mut Self {
        let mark = self.scope_vars().len();
        self.blocks.push(mark);
        self
    }

    pub fn leave_block(&mut self) -> Result<&mut Self, BuildError> {
        if self.blocks.pop().is_none() {
            return Err(BuildError::UnbalancedBlock);
        }
        Ok(self)
    }

    /// Scope hops and slot index for a variable instruction, range-checked
    /// against the scope(6)|addr(20) operand split.
    fn var_addr(&self, v: &Var) -> Result<(u32, u32), BuildError> {
        if !v.is_addressed() {
            return Err(BuildError::UndefinedVar {
                name: v.name().to_string(),
            });
        }
        let depth = self.nest_depth();
        if v.nest_depth() > depth {
            return Err(BuildError::ScopeMismatch {
                name: v.name().to_string(),
            });
        }
        let scope = depth - v.nest_depth();
        make_addr(scope, v.idx())?;
        Ok((scope, v.idx()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_var_starts_unaddressed() {
        let v = Var::new(Type::Int, "x");
        assert!(!v.is_addressed());
        v.set_addr(2, 5).unwrap();
        assert!(v.is_addressed());
        assert_eq!((v.nest_depth(), v.idx()), (2, 5));
    }

    #[test]
    fn test_double_address_is_defect() {
        let v = Var::new(Type::Int, "x");
        v.set_addr(0, 0).unwrap();
        assert_eq!(
            v.set_addr(0, 1),
            Err(BuildError::RedefinedVar { name: "x".into() })
        );
    }

    #[test]
    fn test_manager_slots_are_monotonic() {
        let mut m = VarManager::new(1);
        for i in 0..4 {
            let v = Var::new(Type::Any, format!("v{}", i));
            assert_eq!(m.add_var(&v).unwrap(), i);
        }
        assert_eq!(m.len(), 4);
    }

    #[test]
    fn test_make_addr_packing() {
        assert_eq!(make_addr(0, 7).unwrap(), 7);
        assert_eq!(make_addr(2, 7).unwrap(), (2 << BITS_OP_VAR_SHIFT) | 7);
        assert!(make_addr(1 << BITS_VAR_SCOPE, 0).is_err());
        assert!(make_addr(0, BITS_OP_VAR_OPERAND + 1).is_err());
    }

    #[test]
    fn test_nonlocal_access_encodes_scope_hops() {
        use crate::bytecode::instr::decode_instr;

        let mut b = Builder::new();
        let g = Var::new(Type::Int, "g");
        b.define_var(&g).unwrap();
        let f = b.new_func("f");
        b.func_args(f, &[]).unwrap();
        b.define_func(f).unwrap();
        let local = Var::new(Type::Int, "local");
        b.define_var(&local).unwrap();
        let load_at = b.here();
        b.load_var(&g).unwrap();
        b.store_var(&local).unwrap();
        b.end_func(f).unwrap();
        let code = b.resolve().unwrap();

        let d = decode_instr(code.data[load_at]).unwrap();
        assert_eq!(d.name, "loadVar");
        assert_eq!(d.arg1, Some(("scope", 1)));
        assert_eq!(d.arg2, Some(("addr", 0)));
        let d = decode_instr(code.data[load_at + 1]).unwrap();
        assert_eq!(d.arg1, Some(("scope", 0)));
        assert_eq!(d.arg2, Some(("addr", 0)));
    }
}
