use std::rc::Rc;

use crate::bytecode::build_error::BuildError;
use crate::bytecode::builder::Builder;
use crate::bytecode::instr::{
    FUNCV_ARITY_VAR, OP_CALL_CLOSURE, OP_CALL_FUNC, OP_CALL_FUNCV, OP_CLOSURE, OP_RETURN,
    encode_instr,
};
use crate::bytecode::var::{Var, VarManager};
use crate::lang::types::Type;

// =============================================================================
// FUNCTION BUILD STATE
// =============================================================================

/// Handle to a function being built. Cheap to copy; valid for the builder
/// that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuncRef(pub(crate) usize);

/// Arity declaration state. A function starts undetermined; the first
/// `func_args`/`func_vargs` call decides it, and the opposite declaration
/// afterwards is a defect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Variadic {
    Undetermined,
    Fixed,
    Variadic,
}

/// Which instruction referenced the function, for call-site patching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SiteKind {
    Fixed,
    Variadic,
    Closure,
}

#[derive(Debug)]
pub(crate) struct FuncBuild {
    pub(crate) name: String,
    pub(crate) entry: Option<usize>,
    pub(crate) end: Option<usize>,
    pub(crate) out_vars: Vec<Rc<Var>>,
    pub(crate) arg_vars: Vec<Rc<Var>>,
    pub(crate) in_types: Vec<Type>,
    pub(crate) variadic: Variadic,
    pub(crate) vars: VarManager,
    pub(crate) table_idx: Option<u32>,
    pub(crate) sites: Vec<(usize, SiteKind)>,
}

impl FuncBuild {
    pub(crate) fn new(name: String) -> FuncBuild {
        FuncBuild {
            name,
            entry: None,
            end: None,
            out_vars: Vec::new(),
            arg_vars: Vec::new(),
            in_types: Vec::new(),
            variadic: Variadic::Undetermined,
            vars: VarManager::default(),
            table_idx: None,
            sites: Vec::new(),
        }
    }
}

// =============================================================================
// BUILDER - function operations
// =============================================================================

impl Builder {
    /// Allocate a function handle. The signature and body come later, so
    /// call sites may reference the handle before the body exists.
    pub fn new_func(&mut self, name: impl Into<String>) -> FuncRef {
        let r = FuncRef(self.funcs.len());
        self.funcs.push(FuncBuild::new(name.into()));
        r
    }

    /// Declare the result variables. Their frame slots come first, so a
    /// body stores into them and the caller reads them back after return.
    pub fn func_return(&mut self, f: FuncRef, out: &[Rc<Var>]) -> Result<&mut Self, BuildError> {
        let fnc = &mut self.funcs[f.0];
        if fnc.entry.is_some() {
            return Err(BuildError::RedefinedFunc {
                name: fnc.name.clone(),
            });
        }
        fnc.out_vars = out.to_vec();
        Ok(self)
    }

    /// Declare a fixed-arity parameter list.
    pub fn func_args(&mut self, f: FuncRef, args: &[Rc<Var>]) -> Result<&mut Self, BuildError> {
        let fnc = &mut self.funcs[f.0];
        if fnc.variadic == Variadic::Variadic {
            return Err(BuildError::ArityConflict {
                name: fnc.name.clone(),
            });
        }
        fnc.variadic = Variadic::Fixed;
        fnc.in_types = args.iter().map(|v| v.typ().clone()).collect();
        fnc.arg_vars = args.to_vec();
        Ok(self)
    }

    /// Declare a variadic parameter list. The last parameter is the
    /// collected sequence and must be a list-typed variable.
    pub fn func_vargs(&mut self, f: FuncRef, args: &[Rc<Var>]) -> Result<&mut Self, BuildError> {
        let fnc = &mut self.funcs[f.0];
        if fnc.variadic == Variadic::Fixed {
            return Err(BuildError::ArityConflict {
                name: fnc.name.clone(),
            });
        }
        let last_is_list = args
            .last()
            .map(|v| matches!(v.typ(), Type::List(_)))
            .unwrap_or(false);
        if !last_is_list {
            return Err(BuildError::BadVariadicSignature {
                name: fnc.name.clone(),
            });
        }
        fnc.variadic = Variadic::Variadic;
        fnc.in_types = args.iter().map(|v| v.typ().clone()).collect();
        fnc.arg_vars = args.to_vec();
        Ok(self)
    }

    /// Open the function body at the current emit position.
    ///
    /// Results and parameters are bound to the leading frame slots here, so
    /// the signature must be declared first.
    pub fn define_func(&mut self, f: FuncRef) -> Result<&mut Self, BuildError> {
        let depth = self.nest_depth() + 1;
        let entry = self.here();
        let fnc = &mut self.funcs[f.0];
        if fnc.entry.is_some() {
            return Err(BuildError::RedefinedFunc {
                name: fnc.name.clone(),
            });
        }
        if fnc.variadic == Variadic::Undetermined {
            return Err(BuildError::ArityUndetermined {
                name: fnc.name.clone(),
            });
        }
        fnc.entry = Some(entry);
        fnc.vars = VarManager::new(depth);
        let bind: Vec<Rc<Var>> = fnc
            .out_vars
            .iter()
            .chain(fnc.arg_vars.iter())
            .cloned()
            .collect();
        tracing::debug!(name = %fnc.name, entry, depth, "define_func");
        for v in &bind {
            self.funcs[f.0].vars.add_var(v)?;
        }
        self.active.push(f);
        Ok(self)
    }

    /// Close the innermost open function body.
    pub fn end_func(&mut self, f: FuncRef) -> Result<&mut Self, BuildError> {
        match self.active.last() {
            Some(top) if *top == f => {}
            _ => {
                return Err(BuildError::UnclosedFunc {
                    name: self.funcs[f.0].name.clone(),
                });
            }
        }
        self.active.pop();
        self.emit(encode_instr(OP_RETURN, 0, 0));
        let end = self.here();
        self.funcs[f.0].end = Some(end);
        Ok(self)
    }

    /// Call a fixed-arity function; the table index is patched at resolve.
    pub fn call_func(&mut self, f: FuncRef) -> &mut Self {
        let off = self.here();
        self.funcs[f.0].sites.push((off, SiteKind::Fixed));
        self.emit(encode_instr(OP_CALL_FUNC, 0, 0));
        self
    }

    /// Call a variadic function with `arity` arguments on the stack, or with
    /// `None` when the argument sequence was already collected into a list.
    ///
    /// An arity past the field's range spills: the excess count is pushed as
    /// an int literal and the field saturates at its maximum.
    pub fn call_funcv(&mut self, f: FuncRef, arity: Option<u32>) -> &mut Self {
        let field = match arity {
            None => FUNCV_ARITY_VAR,
            Some(n) => self.spill_arity(n),
        };
        let off = self.here();
        self.funcs[f.0].sites.push((off, SiteKind::Variadic));
        self.emit(encode_instr(OP_CALL_FUNCV, field as i32, 0));
        self
    }

    /// Push a closure value binding the function to the frame live at this
    /// instruction.
    pub fn closure(&mut self, f: FuncRef) -> &mut Self {
        let off = self.here();
        self.funcs[f.0].sites.push((off, SiteKind::Closure));
        self.emit(encode_instr(OP_CLOSURE, 0, 0));
        self
    }

    /// Call the closure on the stack top, `arity` arguments beneath it.
    pub fn call_closure(&mut self, arity: u32) -> &mut Self {
        self.emit(encode_instr(OP_CALL_CLOSURE, 0, arity as i32));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::types::Type;

    #[test]
    fn test_arity_conflict() {
        let mut b = Builder::new();
        let f = b.new_func("f");
        let x = Var::new(Type::Int, "x");
        b.func_args(f, std::slice::from_ref(&x)).unwrap();
        let rest = Var::new(Type::List(Box::new(Type::Any)), "rest");
        let err = b.func_vargs(f, &[x, rest]).unwrap_err();
        assert_eq!(err, BuildError::ArityConflict { name: "f".into() });
    }

    #[test]
    fn test_variadic_needs_list_parameter() {
        let mut b = Builder::new();
        let f = b.new_func("f");
        let err = b.func_vargs(f, &[Var::new(Type::Int, "x")]).unwrap_err();
        assert_eq!(err, BuildError::BadVariadicSignature { name: "f".into() });
    }

    #[test]
    fn test_define_requires_arity() {
        let mut b = Builder::new();
        let f = b.new_func("f");
        let err = b.define_func(f).unwrap_err();
        assert_eq!(err, BuildError::ArityUndetermined { name: "f".into() });
    }

    #[test]
    fn test_redefine_body_is_defect() {
        let mut b = Builder::new();
        let f = b.new_func("f");
        b.func_args(f, &[]).unwrap();
        b.define_func(f).unwrap();
        b.end_func(f).unwrap();
        let err = b.define_func(f).unwrap_err();
        assert_eq!(err, BuildError::RedefinedFunc { name: "f".into() });
    }

    #[test]
    fn test_param_slots_follow_results() {
        let mut b = Builder::new();
        let f = b.new_func("f");
        let ret = Var::new(Type::Int, "ret");
        let x = Var::new(Type::Int, "x");
        let y = Var::new(Type::Int, "y");
        b.func_return(f, std::slice::from_ref(&ret)).unwrap();
        b.func_args(f, &[x.clone(), y.clone()]).unwrap();
        b.define_func(f).unwrap();
        assert_eq!((ret.nest_depth(), ret.idx()), (1, 0));
        assert_eq!(x.idx(), 1);
        assert_eq!(y.idx(), 2);
        b.end_func(f).unwrap();
    }
}
