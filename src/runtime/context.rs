use std::cell::RefCell;
use std::mem;
use std::rc::Rc;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bytecode::code::{Code, FuncInfo};
use crate::bytecode::instr::{
    BITS_KIND, BITS_OP_CALLV_SHIFT, BITS_OP_SHIFT, BITS_OP_VAR_OPERAND, BITS_OP_VAR_SHIFT,
    BITS_OPERAND, FUNCV_ARITY_MAX, FUNCV_ARITY_OPERAND, FUNCV_ARITY_VAR, Instr, OP_BUILTIN,
    OP_CALL_HOST, OP_COUNT, OP_PUSH_CONST, OP_PUSH_INT,
};
use crate::bytecode::var::Var;
use crate::lang::types::Type;
use crate::lang::value::{ClosureData, ErrValue, StructData, Value, ValueRef, coerce};
use crate::runtime::ops::{ADDR_OPS, BUILTIN_OPS, addr_key, exec_addr_val, exec_assign};
use crate::runtime::runtime_error::RuntimeError;

// =============================================================================
// STACK
// =============================================================================

/// The operand stack, shared by every nested invocation of a context.
#[derive(Debug, Default)]
pub struct Stack {
    data: Vec<Value>,
}

impl Stack {
    pub fn new() -> Stack {
        Stack::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn push(&mut self, v: Value) {
        self.data.push(v);
    }

    pub fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.data.pop().ok_or(RuntimeError::StackUnderflow)
    }

    pub fn top(&self) -> Option<&Value> {
        self.data.last()
    }

    /// Pop `n` values, preserving their stack order.
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, RuntimeError> {
        if self.data.len() < n {
            return Err(RuntimeError::StackUnderflow);
        }
        let at = self.data.len() - n;
        Ok(self.data.split_off(at))
    }

    pub fn drop_n(&mut self, n: usize) -> Result<(), RuntimeError> {
        if self.data.len() < n {
            return Err(RuntimeError::StackUnderflow);
        }
        self.data.truncate(self.data.len() - n);
        Ok(())
    }

    /// Shrink back to a recorded height; never grows.
    pub(crate) fn truncate_to(&mut self, n: usize) {
        if self.data.len() > n {
            self.data.truncate(n);
        }
    }

    fn get(&self, pos: i64) -> Result<Value, RuntimeError> {
        if pos < 0 || pos as usize >= self.data.len() {
            return Err(RuntimeError::StackUnderflow);
        }
        Ok(self.data[pos as usize].clone())
    }

    fn set(&mut self, pos: i64, v: Value) -> Result<(), RuntimeError> {
        if pos < 0 || pos as usize >= self.data.len() {
            return Err(RuntimeError::StackUnderflow);
        }
        self.data[pos as usize] = v;
        Ok(())
    }

    pub fn pop_int(&mut self) -> Result<i64, RuntimeError> {
        match self.pop()? {
            Value::Int(n) => Ok(n),
            v => Err(type_err("int", &v)),
        }
    }

    pub fn pop_uint(&mut self) -> Result<u64, RuntimeError> {
        match self.pop()? {
            Value::Uint(n) => Ok(n),
            v => Err(type_err("uint", &v)),
        }
    }

    /// Shift amounts accept either integer kind.
    pub(crate) fn pop_uint_like(&mut self) -> Result<u64, RuntimeError> {
        match self.pop()? {
            Value::Uint(n) => Ok(n),
            Value::Int(n) if n >= 0 => Ok(n as u64),
            v => Err(type_err("non-negative integer", &v)),
        }
    }

    pub fn pop_float(&mut self) -> Result<f64, RuntimeError> {
        match self.pop()? {
            Value::Float(n) => Ok(n),
            v => Err(type_err("float", &v)),
        }
    }

    pub fn pop_bool(&mut self) -> Result<bool, RuntimeError> {
        match self.pop()? {
            Value::Bool(b) => Ok(b),
            v => Err(type_err("bool", &v)),
        }
    }

    pub fn pop_rune(&mut self) -> Result<char, RuntimeError> {
        match self.pop()? {
            Value::Rune(c) => Ok(c),
            v => Err(type_err("rune", &v)),
        }
    }

    pub fn pop_str(&mut self) -> Result<String, RuntimeError> {
        match self.pop()? {
            Value::Str(s) => Ok(s),
            v => Err(type_err("string", &v)),
        }
    }

    fn pop_list(&mut self) -> Result<Rc<RefCell<Vec<Value>>>, RuntimeError> {
        match self.pop()? {
            Value::List(l) => Ok(l),
            v => Err(type_err("list", &v)),
        }
    }

    fn pop_struct(&mut self) -> Result<Rc<RefCell<StructData>>, RuntimeError> {
        match self.pop()? {
            Value::Struct(s) => Ok(s),
            v => Err(type_err("struct", &v)),
        }
    }

    fn pop_closure(&mut self) -> Result<Rc<ClosureData>, RuntimeError> {
        match self.pop()? {
            Value::Closure(c) => Ok(c),
            _ => Err(RuntimeError::NotCallable),
        }
    }
}

fn type_err(want: &str, got: &Value) -> RuntimeError {
    RuntimeError::TypeError {
        message: format!("expected {}, got {}", want, got.type_name()),
    }
}

// =============================================================================
// FRAME
// =============================================================================

/// One invocation's variable slots plus the lexically enclosing frame.
///
/// A closure value holds the frame that was live at its `closure`
/// instruction, which keeps the whole enclosing chain reachable for as long
/// as the closure lives.
#[derive(Debug, Serialize, Deserialize)]
pub struct Frame {
    vars: RefCell<Vec<Value>>,
    parent: Option<Rc<Frame>>,
}

impl Frame {
    pub(crate) fn new(n_vars: usize, parent: Option<Rc<Frame>>) -> Frame {
        Frame {
            vars: RefCell::new(vec![Value::Nil; n_vars]),
            parent,
        }
    }

    pub fn get_var(&self, idx: u32) -> Result<Value, RuntimeError> {
        self.vars
            .borrow()
            .get(idx as usize)
            .cloned()
            .ok_or(RuntimeError::BadVarSlot { idx })
    }

    pub fn set_var(&self, idx: u32, v: Value) -> Result<(), RuntimeError> {
        let mut vars = self.vars.borrow_mut();
        let slot = vars
            .get_mut(idx as usize)
            .ok_or(RuntimeError::BadVarSlot { idx })?;
        *slot = v;
        Ok(())
    }

    fn at_depth(frame: &Rc<Frame>, hops: u32) -> Result<Rc<Frame>, RuntimeError> {
        let mut f = frame.clone();
        for _ in 0..hops {
            f = match &f.parent {
                Some(p) => p.clone(),
                None => {
                    return Err(RuntimeError::TypeError {
                        message: format!("no enclosing frame at depth {}", hops),
                    });
                }
            };
        }
        Ok(f)
    }
}

// =============================================================================
// TASK HOOK
// =============================================================================

/// A detached invocation captured by the `go` instruction.
pub struct GoTask {
    code: Arc<Code>,
    global: Rc<Frame>,
    closure: Rc<ClosureData>,
    args: Vec<Value>,
}

impl GoTask {
    /// Run the task to completion on a fresh context sharing the globals.
    pub fn run(self) -> Result<(), RuntimeError> {
        let mut ctx = Context::with_global(self.code, self.global);
        let arity = self.args.len() as u32;
        for a in self.args {
            ctx.stack.push(a);
        }
        ctx.call_closure_value(&self.closure, arity)
    }
}

/// Receives tasks from `go` instructions. Without one installed, tasks run
/// inline before the instruction completes.
pub trait Scheduler {
    fn spawn(&self, task: GoTask);
}

// =============================================================================
// CONTEXT
// =============================================================================

/// Execution state of one interpreter: operand stack, current frame, and the
/// instruction window being run.
pub struct Context {
    code: Arc<Code>,
    pub stack: Stack,
    frame: Rc<Frame>,
    global: Rc<Frame>,
    base: usize,
    defers: Vec<Rc<ClosureData>>,
    ip: usize,
    ip_end: usize,
    scheduler: Option<Rc<dyn Scheduler>>,
}

type ExecFn = fn(Instr, &mut Context) -> Result<(), RuntimeError>;

impl Context {
    pub fn new(code: Arc<Code>) -> Context {
        let global = Rc::new(Frame::new(code.globals(), None));
        Context::with_global(code, global)
    }

    pub(crate) fn with_global(code: Arc<Code>, global: Rc<Frame>) -> Context {
        Context {
            code,
            stack: Stack::new(),
            frame: global.clone(),
            global,
            base: 0,
            defers: Vec::new(),
            ip: 0,
            ip_end: 0,
            scheduler: None,
        }
    }

    pub fn with_scheduler(mut self, s: Rc<dyn Scheduler>) -> Context {
        self.scheduler = Some(s);
        self
    }

    pub fn code(&self) -> &Arc<Code> {
        &self.code
    }

    /// Read a global variable after (or during) a run.
    pub fn get_global(&self, v: &Var) -> Result<Value, RuntimeError> {
        self.global.get_var(v.idx())
    }

    pub fn set_global(&self, v: &Var, val: Value) -> Result<(), RuntimeError> {
        self.global.set_var(v.idx(), val)
    }

    /// Run the whole instruction stream from the top.
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        self.exec(0, self.code.len())
    }

    /// Execute the half-open instruction range, then restore the previous
    /// window so nested executions compose.
    pub fn exec(&mut self, ip: usize, ip_end: usize) -> Result<(), RuntimeError> {
        let saved = (self.ip, self.ip_end);
        self.ip = ip;
        self.ip_end = ip_end;
        let r = self.run_loop();
        (self.ip, self.ip_end) = saved;
        r
    }

    fn run_loop(&mut self) -> Result<(), RuntimeError> {
        let code = self.code.clone();
        while self.ip != self.ip_end {
            let i = *code
                .data
                .get(self.ip)
                .ok_or(RuntimeError::IpOutOfRange { ip: self.ip })?;
            self.ip += 1;
            match i >> BITS_OP_SHIFT {
                // hot paths, dispatched without the table indirection
                OP_PUSH_INT => self.stack.push(Value::Int(sx(i, 26) as i64)),
                OP_BUILTIN => {
                    let key = (i & BITS_OPERAND) as usize;
                    let f = BUILTIN_OPS
                        .get(key)
                        .copied()
                        .flatten()
                        .ok_or(RuntimeError::DispatchMiss { instr: i })?;
                    f(&mut self.stack)?;
                }
                OP_PUSH_CONST => x_push_const(i, self)?,
                OP_CALL_HOST => x_call_host(i, self)?,
                op if (op as usize) < OP_COUNT => EXEC_TABLE[op as usize](i, self)?,
                _ => {
                    return Err(RuntimeError::InvalidInstr {
                        instr: i,
                        ip: self.ip - 1,
                    });
                }
            }
        }
        Ok(())
    }

    fn jump(&mut self, offset: i32) -> Result<(), RuntimeError> {
        let target = self.ip as i64 + offset as i64;
        if target < 0 || target as usize > self.code.len() {
            return Err(RuntimeError::IpOutOfRange {
                ip: target.unsigned_abs() as usize,
            });
        }
        self.ip = target as usize;
        Ok(())
    }

    // =========================================================================
    // CALLS
    // =========================================================================

    /// Run a function body in a fresh frame, then push its results.
    ///
    /// Deferred closures run after the body, before the caller resumes, even
    /// when the body faulted; the body's fault wins over a defer's.
    fn invoke(
        &mut self,
        fi: &FuncInfo,
        parent: Rc<Frame>,
        args: Vec<Value>,
    ) -> Result<(), RuntimeError> {
        if args.len() != fi.n_in {
            return Err(RuntimeError::ArityMismatch {
                expected: fi.n_in,
                got: args.len(),
            });
        }
        let frame = Rc::new(Frame::new(fi.n_vars, Some(parent)));
        {
            let mut vars = frame.vars.borrow_mut();
            for (k, v) in args.into_iter().enumerate() {
                vars[fi.n_out + k] = v;
            }
        }
        let saved_frame = mem::replace(&mut self.frame, frame);
        let saved_base = mem::replace(&mut self.base, self.stack.len());
        let saved_defers = mem::take(&mut self.defers);

        let body = self.exec(fi.entry, fi.end);
        let deferred = self.run_defers();

        // intermediate stack state of the body never escapes to the caller
        self.stack.truncate_to(self.base);
        let frame = mem::replace(&mut self.frame, saved_frame);
        self.base = saved_base;
        self.defers = saved_defers;
        body?;
        deferred?;

        let vars = frame.vars.borrow();
        for k in 0..fi.n_out {
            self.stack.push(vars[k].clone());
        }
        Ok(())
    }

    /// Run deferred closures in reverse registration order. Each runs once;
    /// the first fault is remembered and the rest still run.
    fn run_defers(&mut self) -> Result<(), RuntimeError> {
        let mut first_err = Ok(());
        while let Some(c) = self.defers.pop() {
            let r = self.call_closure_value(&c, 0);
            if first_err.is_ok() {
                first_err = r;
            }
        }
        first_err
    }

    fn call_fixed(&mut self, idx: usize) -> Result<(), RuntimeError> {
        let code = self.code.clone();
        let fi = code
            .funs
            .get(idx)
            .ok_or(RuntimeError::InvalidInstr { instr: 0, ip: self.ip })?;
        let args = self.stack.pop_n(fi.n_in)?;
        self.invoke(fi, self.global.clone(), args)
    }

    fn call_variadic(&mut self, idx: usize, arity: Option<u32>) -> Result<(), RuntimeError> {
        let code = self.code.clone();
        let fi = code
            .funvs
            .get(idx)
            .ok_or(RuntimeError::InvalidInstr { instr: 0, ip: self.ip })?;
        let args = self.collect_variadic(fi, arity)?;
        self.invoke(fi, self.global.clone(), args)
    }

    pub(crate) fn call_closure_value(
        &mut self,
        c: &ClosureData,
        arity: u32,
    ) -> Result<(), RuntimeError> {
        let code = self.code.clone();
        if c.variadic {
            let fi = code
                .funvs
                .get(c.fun as usize)
                .ok_or(RuntimeError::NotCallable)?;
            let args = self.collect_variadic(fi, Some(arity))?;
            self.invoke(fi, c.frame.clone(), args)
        } else {
            let fi = code
                .funs
                .get(c.fun as usize)
                .ok_or(RuntimeError::NotCallable)?;
            if arity as usize != fi.n_in {
                return Err(RuntimeError::ArityMismatch {
                    expected: fi.n_in,
                    got: arity as usize,
                });
            }
            let args = self.stack.pop_n(fi.n_in)?;
            self.invoke(fi, c.frame.clone(), args)
        }
    }

    /// Shape the stack-top arguments for a variadic signature: the trailing
    /// ones collect into the sequence parameter. `None` means the sequence
    /// was already collected by the caller.
    fn collect_variadic(
        &mut self,
        fi: &FuncInfo,
        arity: Option<u32>,
    ) -> Result<Vec<Value>, RuntimeError> {
        let n = match arity {
            None => return self.stack.pop_n(fi.n_in),
            Some(n) => n as usize,
        };
        let n_fixed = fi.n_in - 1;
        if n < n_fixed {
            return Err(RuntimeError::ArityMismatch {
                expected: n_fixed,
                got: n,
            });
        }
        let mut args = self.stack.pop_n(n)?;
        let rest = args.split_off(n_fixed);
        let elem = fi
            .in_types
            .last()
            .and_then(|t| t.elem())
            .cloned()
            .unwrap_or(Type::Any);
        let collected = if elem == Type::Any {
            rest
        } else {
            rest.iter()
                .map(|v| coerce(v, &elem))
                .collect::<Result<Vec<Value>, RuntimeError>>()?
        };
        args.push(Value::list(collected));
        Ok(args)
    }
}

/// Sign-extend the low `bits` of an instruction word.
#[inline]
fn sx(i: Instr, bits: u32) -> i32 {
    ((i << (32 - bits)) as i32) >> (32 - bits)
}

/// Resolve a possibly spilled 10-bit arity field: a saturated field means
/// the excess count was pushed as an int just before.
fn resolve_spill(ctx: &mut Context, field: u32) -> Result<u32, RuntimeError> {
    if field == FUNCV_ARITY_MAX {
        let excess = ctx.stack.pop_int()?;
        if excess < 0 {
            return Err(RuntimeError::TypeError {
                message: "negative arity spill".to_string(),
            });
        }
        Ok(FUNCV_ARITY_MAX + excess as u32)
    } else {
        Ok(field)
    }
}

pub(crate) fn zero_value(code: &Code, t: &Type) -> Result<Value, RuntimeError> {
    Ok(match t {
        Type::Any => Value::Nil,
        Type::Bool => Value::Bool(false),
        Type::Int => Value::Int(0),
        Type::Uint => Value::Uint(0),
        Type::Float => Value::Float(0.0),
        Type::Rune => Value::Rune('\0'),
        Type::Str => Value::Str(String::new()),
        Type::List(_) => Value::list(Vec::new()),
        Type::Struct(layout) => {
            let si = code
                .struct_info(*layout)
                .ok_or(RuntimeError::TypeError {
                    message: format!("unknown struct layout {}", layout),
                })?;
            let fields = si
                .fields
                .iter()
                .map(|(_, ft)| zero_value(code, ft))
                .collect::<Result<Vec<Value>, RuntimeError>>()?;
            Value::Struct(Rc::new(RefCell::new(StructData {
                layout: *layout,
                fields,
            })))
        }
    })
}

// =============================================================================
// EXECUTORS
// =============================================================================

fn x_invalid(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    Err(RuntimeError::InvalidInstr {
        instr: i,
        ip: ctx.ip - 1,
    })
}

fn x_push_int(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    ctx.stack.push(Value::Int(sx(i, 26) as i64));
    Ok(())
}

fn x_push_const(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let idx = (i & BITS_OPERAND) as usize;
    let lit = ctx
        .code
        .consts
        .get(idx)
        .ok_or(RuntimeError::InvalidInstr { instr: i, ip: ctx.ip - 1 })?;
    let v = lit.value();
    ctx.stack.push(v);
    Ok(())
}

fn x_push_spec(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let v = match i & BITS_OPERAND {
        0 => Value::Bool(false),
        1 => Value::Bool(true),
        2 => Value::Nil,
        _ => {
            return Err(RuntimeError::InvalidInstr {
                instr: i,
                ip: ctx.ip - 1,
            });
        }
    };
    ctx.stack.push(v);
    Ok(())
}

fn x_pop(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    ctx.stack.drop_n((i & BITS_OPERAND) as usize)
}

fn x_builtin(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let key = (i & BITS_OPERAND) as usize;
    let f = BUILTIN_OPS
        .get(key)
        .copied()
        .flatten()
        .ok_or(RuntimeError::DispatchMiss { instr: i })?;
    f(&mut ctx.stack)
}

fn x_addr_op(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    use crate::lang::types::AddrOperator;
    let operand = i & BITS_OPERAND;
    let op = operand >> BITS_KIND;
    let kind = operand & ((1 << BITS_KIND) - 1);
    // assignment and deref work on any kind
    if op == AddrOperator::Assign as u32 {
        return exec_assign(&mut ctx.stack);
    }
    if op == AddrOperator::AddrVal as u32 {
        return exec_addr_val(&mut ctx.stack);
    }
    let f = ADDR_OPS
        .get(addr_key(op, kind))
        .copied()
        .flatten()
        .ok_or(RuntimeError::DispatchMiss { instr: i })?;
    f(&mut ctx.stack)
}

fn x_type_cast(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let idx = (i & BITS_OPERAND) as usize;
    let t = ctx
        .code
        .types
        .get(idx)
        .cloned()
        .ok_or(RuntimeError::InvalidInstr { instr: i, ip: ctx.ip - 1 })?;
    let v = ctx.stack.pop()?;
    let out = coerce(&v, &t)?;
    ctx.stack.push(out);
    Ok(())
}

fn x_zero(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let idx = (i & BITS_OPERAND) as usize;
    let t = ctx
        .code
        .types
        .get(idx)
        .cloned()
        .ok_or(RuntimeError::InvalidInstr { instr: i, ip: ctx.ip - 1 })?;
    let v = zero_value(&ctx.code, &t)?;
    ctx.stack.push(v);
    Ok(())
}

fn x_jmp(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    ctx.jump(sx(i, 26))
}

fn x_jmp_if(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let when = (i >> 22) & 1 == 1;
    let offset = sx(i, 22);
    let b = ctx.stack.pop_bool()?;
    if b == when {
        ctx.jump(offset)?;
    }
    Ok(())
}

fn x_case_ne(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let n = ((i >> BITS_OP_CALLV_SHIFT) & FUNCV_ARITY_OPERAND) as usize;
    let offset = sx(i, 16);
    let cases = ctx.stack.pop_n(n)?;
    let switch = ctx.stack.top().ok_or(RuntimeError::StackUnderflow)?;
    if cases.iter().any(|c| c == switch) {
        ctx.stack.pop()?;
    } else {
        ctx.jump(offset)?;
    }
    Ok(())
}

fn var_operands(i: Instr) -> (u32, u32) {
    let operand = i & BITS_OPERAND;
    (operand >> BITS_OP_VAR_SHIFT, operand & BITS_OP_VAR_OPERAND)
}

fn x_load_var(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let (scope, idx) = var_operands(i);
    let frame = Frame::at_depth(&ctx.frame, scope)?;
    let v = frame.get_var(idx)?;
    ctx.stack.push(v);
    Ok(())
}

fn x_store_var(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let (scope, idx) = var_operands(i);
    let frame = Frame::at_depth(&ctx.frame, scope)?;
    let v = ctx.stack.pop()?;
    frame.set_var(idx, v)
}

fn x_addr_var(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let (scope, idx) = var_operands(i);
    let frame = Frame::at_depth(&ctx.frame, scope)?;
    ctx.stack.push(Value::Ref(ValueRef::Var { frame, idx }));
    Ok(())
}

fn x_load(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let pos = ctx.base as i64 + sx(i, 26) as i64;
    let v = ctx.stack.get(pos)?;
    ctx.stack.push(v);
    Ok(())
}

fn x_store(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let pos = ctx.base as i64 + sx(i, 26) as i64;
    let v = ctx.stack.pop()?;
    ctx.stack.set(pos, v)
}

fn x_call_func(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    ctx.call_fixed((i & BITS_OPERAND) as usize)
}

fn x_call_funcv(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let field = (i >> BITS_OP_CALLV_SHIFT) & FUNCV_ARITY_OPERAND;
    let idx = (i & 0xffff) as usize;
    let arity = if field == FUNCV_ARITY_VAR {
        None
    } else {
        Some(resolve_spill(ctx, field)?)
    };
    ctx.call_variadic(idx, arity)
}

fn x_return(_i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    ctx.ip = ctx.ip_end;
    Ok(())
}

fn x_closure(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let kind = (i >> 24) & 0x3;
    let fun = i & ((1 << 24) - 1);
    ctx.stack.push(Value::Closure(Rc::new(ClosureData {
        fun,
        variadic: kind & 1 == 1,
        frame: ctx.frame.clone(),
    })));
    Ok(())
}

fn x_call_closure(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let arity = i & BITS_OPERAND;
    let c = ctx.stack.pop_closure()?;
    ctx.call_closure_value(&c, arity)
}

fn x_call_host(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let idx = (i & BITS_OPERAND) as usize;
    let code = ctx.code.clone();
    let hf = code
        .host_funs
        .get(idx)
        .ok_or(RuntimeError::InvalidInstr { instr: i, ip: ctx.ip - 1 })?;
    (hf.f)(&mut ctx.stack, hf.n_in as u32)
}

fn x_call_hostv(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let field = (i >> BITS_OP_CALLV_SHIFT) & FUNCV_ARITY_OPERAND;
    let idx = (i & 0xffff) as usize;
    let arity = resolve_spill(ctx, field)?;
    let code = ctx.code.clone();
    let hf = code
        .host_funvs
        .get(idx)
        .ok_or(RuntimeError::InvalidInstr { instr: i, ip: ctx.ip - 1 })?;
    (hf.f)(&mut ctx.stack, arity)
}

fn x_make_list(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let field = (i >> BITS_OP_CALLV_SHIFT) & FUNCV_ARITY_OPERAND;
    let idx = (i & 0xffff) as usize;
    let arity = resolve_spill(ctx, field)? as usize;
    let t = ctx
        .code
        .types
        .get(idx)
        .cloned()
        .ok_or(RuntimeError::InvalidInstr { instr: i, ip: ctx.ip - 1 })?;
    let elem = t.elem().cloned().unwrap_or(Type::Any);
    let items = ctx.stack.pop_n(arity)?;
    let items = if elem == Type::Any {
        items
    } else {
        items
            .iter()
            .map(|v| coerce(v, &elem))
            .collect::<Result<Vec<Value>, RuntimeError>>()?
    };
    ctx.stack.push(Value::list(items));
    Ok(())
}

const INDEX_ON_STACK: u32 = (1 << 24) - 1;

fn x_index(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let op = (i >> 24) & 0x3;
    let packed = i & ((1 << 24) - 1);
    let idx = if packed == INDEX_ON_STACK {
        let n = ctx.stack.pop_int()?;
        if n < 0 {
            return Err(RuntimeError::IndexOutOfRange { index: n, len: 0 });
        }
        n as usize
    } else {
        packed as usize
    };
    let list = ctx.stack.pop_list()?;
    match op {
        0 => {
            let items = list.borrow();
            let v = items
                .get(idx)
                .cloned()
                .ok_or(RuntimeError::IndexOutOfRange {
                    index: idx as i64,
                    len: items.len(),
                })?;
            drop(items);
            ctx.stack.push(v);
            Ok(())
        }
        1 => {
            let v = ctx.stack.pop()?;
            ValueRef::Elem { list, idx }.store(v)
        }
        2 => {
            ctx.stack.push(Value::Ref(ValueRef::Elem { list, idx }));
            Ok(())
        }
        _ => Err(RuntimeError::InvalidInstr {
            instr: i,
            ip: ctx.ip - 1,
        }),
    }
}

fn x_struct(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let field = (i >> BITS_OP_CALLV_SHIFT) & FUNCV_ARITY_OPERAND;
    let layout = (i & 0xffff) as u32;
    let arity = resolve_spill(ctx, field)? as usize;
    let si = ctx
        .code
        .struct_info(layout)
        .ok_or(RuntimeError::InvalidInstr { instr: i, ip: ctx.ip - 1 })?;
    if si.fields.len() != arity {
        return Err(RuntimeError::ArityMismatch {
            expected: si.fields.len(),
            got: arity,
        });
    }
    let fields = ctx.stack.pop_n(arity)?;
    ctx.stack
        .push(Value::Struct(Rc::new(RefCell::new(StructData {
            layout,
            fields,
        }))));
    Ok(())
}

fn x_load_field(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let idx = (i & BITS_OPERAND) as usize;
    let obj = ctx.stack.pop_struct()?;
    let v = ValueRef::Field { obj, idx }.load()?;
    ctx.stack.push(v);
    Ok(())
}

fn x_store_field(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let idx = (i & BITS_OPERAND) as usize;
    let obj = ctx.stack.pop_struct()?;
    let v = ctx.stack.pop()?;
    ValueRef::Field { obj, idx }.store(v)
}

fn x_addr_field(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let idx = (i & BITS_OPERAND) as usize;
    let obj = ctx.stack.pop_struct()?;
    ctx.stack.push(Value::Ref(ValueRef::Field { obj, idx }));
    Ok(())
}

fn x_for_iter(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let idx = (i & BITS_OPERAND) as usize;
    let phrase = ctx
        .code
        .fors
        .get(idx)
        .cloned()
        .ok_or(RuntimeError::InvalidInstr { instr: i, ip: ctx.ip - 1 })?;
    let list = ctx.stack.pop_list()?;
    let items: Vec<Value> = list.borrow().clone();
    for (k, item) in items.into_iter().enumerate() {
        if let Some(slot) = phrase.key {
            ctx.frame.set_var(slot, Value::Int(k as i64))?;
        }
        if let Some(slot) = phrase.value {
            ctx.frame.set_var(slot, item)?;
        }
        ctx.exec(phrase.start, phrase.end)?;
    }
    Ok(())
}

fn x_list_comp(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let idx = (i & BITS_OPERAND) as usize;
    let comp = ctx
        .code
        .comprehens
        .get(idx)
        .cloned()
        .ok_or(RuntimeError::InvalidInstr { instr: i, ip: ctx.ip - 1 })?;
    let base = ctx.stack.len();
    ctx.exec(comp.start, comp.end)?;
    let n = ctx
        .stack
        .len()
        .checked_sub(base)
        .ok_or(RuntimeError::StackUnderflow)?;
    let items = ctx.stack.pop_n(n)?;
    ctx.stack.push(Value::list(items));
    Ok(())
}

fn x_err_wrap(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let idx = (i & BITS_OPERAND) as usize;
    let prefix = ctx
        .code
        .err_wraps
        .get(idx)
        .ok_or(RuntimeError::InvalidInstr { instr: i, ip: ctx.ip - 1 })?;
    if let Some(Value::Err(e)) = ctx.stack.top() {
        let wrapped = ErrValue::new(format!("{}: {}", prefix, e.message));
        ctx.stack.pop()?;
        ctx.stack.push(wrapped);
    }
    Ok(())
}

fn x_wrap_if_err(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    if matches!(ctx.stack.top(), Some(Value::Err(_))) {
        ctx.jump(sx(i, 26))?;
    }
    Ok(())
}

fn x_defer(_i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let c = ctx.stack.pop_closure()?;
    ctx.defers.push(c);
    Ok(())
}

fn x_go(i: Instr, ctx: &mut Context) -> Result<(), RuntimeError> {
    let arity = (i & BITS_OPERAND) as usize;
    let closure = ctx.stack.pop_closure()?;
    let args = ctx.stack.pop_n(arity)?;
    let task = GoTask {
        code: ctx.code.clone(),
        global: ctx.global.clone(),
        closure,
        args,
    };
    match &ctx.scheduler {
        Some(s) => {
            s.spawn(task);
            Ok(())
        }
        None => task.run(),
    }
}

static EXEC_TABLE: [ExecFn; OP_COUNT] = [
    x_invalid,      // OP_INVALID
    x_push_int,     // OP_PUSH_INT
    x_push_const,   // OP_PUSH_CONST
    x_push_spec,    // OP_PUSH_SPEC
    x_pop,          // OP_POP
    x_builtin,      // OP_BUILTIN
    x_addr_op,      // OP_ADDR_OP
    x_type_cast,    // OP_TYPE_CAST
    x_zero,         // OP_ZERO
    x_jmp,          // OP_JMP
    x_jmp_if,       // OP_JMP_IF
    x_case_ne,      // OP_CASE_NE
    x_load_var,     // OP_LOAD_VAR
    x_store_var,    // OP_STORE_VAR
    x_addr_var,     // OP_ADDR_VAR
    x_load,         // OP_LOAD
    x_store,        // OP_STORE
    x_call_func,    // OP_CALL_FUNC
    x_call_funcv,   // OP_CALL_FUNCV
    x_return,       // OP_RETURN
    x_closure,      // OP_CLOSURE
    x_call_closure, // OP_CALL_CLOSURE
    x_call_host,    // OP_CALL_HOST
    x_call_hostv,   // OP_CALL_HOSTV
    x_make_list,    // OP_MAKE_LIST
    x_index,        // OP_INDEX
    x_struct,       // OP_STRUCT
    x_load_field,   // OP_LOAD_FIELD
    x_store_field,  // OP_STORE_FIELD
    x_addr_field,   // OP_ADDR_FIELD
    x_for_iter,     // OP_FOR_ITER
    x_list_comp,    // OP_LIST_COMP
    x_err_wrap,     // OP_ERR_WRAP
    x_wrap_if_err,  // OP_WRAP_IF_ERR
    x_defer,        // OP_DEFER
    x_go,           // OP_GO
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::builder::Builder;
    use crate::lang::types::{AddrOperator, Kind, Operator};

    fn run(b: Builder) -> Context {
        let code = b.resolve().unwrap();
        let mut ctx = Context::new(Arc::new(code));
        ctx.run().unwrap();
        ctx
    }

    #[test]
    fn test_sum_loop() {
        let mut b = Builder::new();
        let i = Var::new(Type::Int, "i");
        let total = Var::new(Type::Int, "total");
        b.define_var(&i).unwrap();
        b.define_var(&total).unwrap();
        b.push_int(1);
        b.store_var(&i).unwrap();
        b.push_int(0);
        b.store_var(&total).unwrap();
        let top = b.new_label();
        let done = b.new_label();
        b.label(top).unwrap();
        b.load_var(&i).unwrap();
        b.push_int(100);
        b.builtin_op(Kind::Int, Operator::Ge);
        b.jmp_if(true, done);
        b.load_var(&total).unwrap();
        b.load_var(&i).unwrap();
        b.builtin_op(Kind::Int, Operator::Add);
        b.store_var(&total).unwrap();
        b.load_var(&i).unwrap();
        b.push_int(1);
        b.builtin_op(Kind::Int, Operator::Add);
        b.store_var(&i).unwrap();
        b.jmp(top);
        b.label(done).unwrap();
        b.load_var(&total).unwrap();

        let mut ctx = run(b);
        assert_eq!(ctx.stack.pop().unwrap(), Value::Int(4950));
    }

    #[test]
    fn test_squares_comprehension() {
        let mut b = Builder::new();
        let x = Var::new(Type::Int, "x");
        b.define_var(&x).unwrap();
        let comp = b.begin_comprehension();
        let fp = b.begin_for_phrase(None, Some(&x)).unwrap();
        b.load_var(&x).unwrap();
        b.load_var(&x).unwrap();
        b.builtin_op(Kind::Int, Operator::Mul);
        let phrase = b.end_for_phrase(fp).unwrap();
        for n in 1..=4 {
            b.push_int(n);
        }
        b.make_list(&Type::List(Box::new(Type::Int)), 4);
        b.for_iter(phrase);
        let comp = b.end_comprehension(comp).unwrap();
        b.list_comp(comp);

        let mut ctx = run(b);
        assert_eq!(
            ctx.stack.pop().unwrap(),
            Value::list(vec![
                Value::Int(1),
                Value::Int(4),
                Value::Int(9),
                Value::Int(16)
            ])
        );
    }

    #[test]
    fn test_for_iter_key_slots() {
        let mut b = Builder::new();
        let k = Var::new(Type::Int, "k");
        let v = Var::new(Type::Int, "v");
        let acc = Var::new(Type::Int, "acc");
        b.define_var(&k).unwrap();
        b.define_var(&v).unwrap();
        b.define_var(&acc).unwrap();
        b.push_int(0);
        b.store_var(&acc).unwrap();
        let fp = b.begin_for_phrase(Some(&k), Some(&v)).unwrap();
        // acc += k * v
        b.load_var(&acc).unwrap();
        b.load_var(&k).unwrap();
        b.load_var(&v).unwrap();
        b.builtin_op(Kind::Int, Operator::Mul);
        b.builtin_op(Kind::Int, Operator::Add);
        b.store_var(&acc).unwrap();
        let phrase = b.end_for_phrase(fp).unwrap();
        for n in [10, 20, 30] {
            b.push_int(n);
        }
        b.make_list(&Type::List(Box::new(Type::Int)), 3);
        b.for_iter(phrase);

        let ctx = run(b);
        // 0*10 + 1*20 + 2*30
        assert_eq!(ctx.get_global(&acc).unwrap(), Value::Int(80));
    }

    #[test]
    fn test_function_call_and_result() {
        let mut b = Builder::new();
        let f = b.new_func("add2");
        let ret = Var::new(Type::Int, "ret");
        let x = Var::new(Type::Int, "x");
        let y = Var::new(Type::Int, "y");
        b.func_return(f, std::slice::from_ref(&ret)).unwrap();
        b.func_args(f, &[x.clone(), y.clone()]).unwrap();
        b.push_int(30);
        b.push_int(12);
        b.call_func(f);
        b.ret();
        b.define_func(f).unwrap();
        b.load_var(&x).unwrap();
        b.load_var(&y).unwrap();
        b.builtin_op(Kind::Int, Operator::Add);
        b.store_var(&ret).unwrap();
        b.end_func(f).unwrap();

        let mut ctx = run(b);
        assert_eq!(ctx.stack.pop().unwrap(), Value::Int(42));
        assert!(ctx.stack.is_empty());
    }

    #[test]
    fn test_call_discards_intermediate_stack_state() {
        let mut b = Builder::new();
        let f = b.new_func("noisy");
        let ret = Var::new(Type::Int, "ret");
        b.func_return(f, std::slice::from_ref(&ret)).unwrap();
        b.func_args(f, &[]).unwrap();
        b.call_func(f);
        b.ret();
        b.define_func(f).unwrap();
        b.push_int(99); // scratch value the body never consumes
        b.push_int(7);
        b.store_var(&ret).unwrap();
        b.end_func(f).unwrap();

        let mut ctx = run(b);
        assert_eq!(ctx.stack.pop().unwrap(), Value::Int(7));
        assert!(ctx.stack.is_empty());
    }

    #[test]
    fn test_closure_reads_enclosing_frame() {
        let mut b = Builder::new();
        let f = b.new_func("outer");
        let g = b.new_func("inner");
        let ret_f = Var::new(Type::Int, "ret_f");
        let ret_g = Var::new(Type::Int, "ret_g");
        let n = Var::new(Type::Int, "n");
        b.func_return(f, std::slice::from_ref(&ret_f)).unwrap();
        b.func_args(f, &[]).unwrap();
        b.func_return(g, std::slice::from_ref(&ret_g)).unwrap();
        b.func_args(g, &[]).unwrap();

        b.call_func(f);
        b.ret();

        b.define_func(f).unwrap();
        b.define_var(&n).unwrap();
        b.push_int(42);
        b.store_var(&n).unwrap();
        let after_g = b.new_label();
        b.jmp(after_g);
        b.define_func(g).unwrap();
        b.load_var(&n).unwrap(); // one lexical hop up
        b.store_var(&ret_g).unwrap();
        b.end_func(g).unwrap();
        b.label(after_g).unwrap();
        b.closure(g);
        b.call_closure(0);
        b.store_var(&ret_f).unwrap();
        b.end_func(f).unwrap();

        let mut ctx = run(b);
        assert_eq!(ctx.stack.pop().unwrap(), Value::Int(42));
    }

    #[test]
    fn test_variadic_collects_trailing_args() {
        let mut b = Builder::new();
        let f = b.new_func("pack");
        let ret = Var::new(Type::List(Box::new(Type::Int)), "ret");
        let first = Var::new(Type::Int, "first");
        let rest = Var::new(Type::List(Box::new(Type::Int)), "rest");
        b.func_return(f, std::slice::from_ref(&ret)).unwrap();
        b.func_vargs(f, &[first, rest.clone()]).unwrap();

        b.push_int(1);
        b.push_int(2);
        b.push_int(3);
        b.call_funcv(f, Some(3));
        b.ret();
        b.define_func(f).unwrap();
        b.load_var(&rest).unwrap();
        b.store_var(&ret).unwrap();
        b.end_func(f).unwrap();

        let mut ctx = run(b);
        assert_eq!(
            ctx.stack.pop().unwrap(),
            Value::list(vec![Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn test_variadic_empty_tail() {
        let mut b = Builder::new();
        let f = b.new_func("pack");
        let ret = Var::new(Type::List(Box::new(Type::Int)), "ret");
        let first = Var::new(Type::Int, "first");
        let rest = Var::new(Type::List(Box::new(Type::Int)), "rest");
        b.func_return(f, std::slice::from_ref(&ret)).unwrap();
        b.func_vargs(f, &[first, rest.clone()]).unwrap();

        b.push_int(1);
        b.call_funcv(f, Some(1));
        b.ret();
        b.define_func(f).unwrap();
        b.load_var(&rest).unwrap();
        b.store_var(&ret).unwrap();
        b.end_func(f).unwrap();

        let mut ctx = run(b);
        assert_eq!(ctx.stack.pop().unwrap(), Value::list(vec![]));
    }

    #[test]
    fn test_variadic_precollected_sequence() {
        let mut b = Builder::new();
        let f = b.new_func("pack");
        let ret = Var::new(Type::List(Box::new(Type::Int)), "ret");
        let first = Var::new(Type::Int, "first");
        let rest = Var::new(Type::List(Box::new(Type::Int)), "rest");
        b.func_return(f, std::slice::from_ref(&ret)).unwrap();
        b.func_vargs(f, &[first, rest.clone()]).unwrap();

        b.push_int(1);
        b.push_int(7);
        b.push_int(8);
        b.make_list(&Type::List(Box::new(Type::Int)), 2);
        b.call_funcv(f, None);
        b.ret();
        b.define_func(f).unwrap();
        b.load_var(&rest).unwrap();
        b.store_var(&ret).unwrap();
        b.end_func(f).unwrap();

        let mut ctx = run(b);
        assert_eq!(
            ctx.stack.pop().unwrap(),
            Value::list(vec![Value::Int(7), Value::Int(8)])
        );
    }

    #[test]
    fn test_defer_runs_once_before_unwind() {
        let mut b = Builder::new();
        let counter = Var::new(Type::Int, "counter");
        b.define_var(&counter).unwrap();
        let f = b.new_func("f");
        let d = b.new_func("d");
        b.func_args(f, &[]).unwrap();
        b.func_args(d, &[]).unwrap();

        b.call_func(f);
        b.ret();

        b.define_func(f).unwrap();
        let after_d = b.new_label();
        b.jmp(after_d);
        b.define_func(d).unwrap();
        b.load_var(&counter).unwrap(); // two hops: d -> f -> global
        b.push_int(1);
        b.builtin_op(Kind::Int, Operator::Add);
        b.store_var(&counter).unwrap();
        b.end_func(d).unwrap();
        b.label(after_d).unwrap();
        b.closure(d);
        b.defer_call();
        b.push_int(1);
        b.push_int(0);
        b.builtin_op(Kind::Int, Operator::Div); // faults
        b.end_func(f).unwrap();

        let code = b.resolve().unwrap();
        let mut ctx = Context::new(Arc::new(code));
        assert_eq!(ctx.run(), Err(RuntimeError::DivisionByZero));
        assert_eq!(ctx.get_global(&counter).unwrap(), Value::Int(1));
    }

    #[test]
    fn test_case_ne_switch() {
        let mut b = Builder::new();
        b.push_int(2); // switch value
        let next = b.new_label();
        let done = b.new_label();
        b.push_int(1);
        b.case_ne(next, 1);
        b.push_str("one");
        b.jmp(done);
        b.label(next).unwrap();
        b.push_int(2);
        b.push_int(3);
        b.case_ne(done, 2); // matches: drops the switch value too
        b.push_str("two or three");
        b.jmp(done);
        b.label(done).unwrap();

        let mut ctx = run(b);
        assert_eq!(ctx.stack.pop().unwrap(), Value::Str("two or three".into()));
        assert!(ctx.stack.is_empty());
    }

    #[test]
    fn test_host_function() {
        let mut b = Builder::new();
        let h = b.host_func("mul2", 1, Arc::new(|s: &mut Stack, _n| {
            let x = s.pop_int()?;
            s.push(Value::Int(x * 2));
            Ok(())
        }));
        b.push_int(21);
        b.call_host(h);

        let mut ctx = run(b);
        assert_eq!(ctx.stack.pop().unwrap(), Value::Int(42));
    }

    #[test]
    fn test_variadic_host_function() {
        let mut b = Builder::new();
        let h = b.host_funcv("sum", 0, Arc::new(|s: &mut Stack, n| {
            let mut total = 0i64;
            for _ in 0..n {
                total += s.pop_int()?;
            }
            s.push(Value::Int(total));
            Ok(())
        }));
        b.push_int(3);
        b.push_int(4);
        b.push_int(5);
        b.call_hostv(h, 3);

        let mut ctx = run(b);
        assert_eq!(ctx.stack.pop().unwrap(), Value::Int(12));
    }

    #[test]
    fn test_host_arity_spills_past_field_width() {
        let mut b = Builder::new();
        let h = b.host_funcv("count", 0, Arc::new(|s: &mut Stack, n| {
            s.drop_n(n as usize)?;
            s.push(Value::Int(n as i64));
            Ok(())
        }));
        // 1500 exceeds the 10-bit arity field; the excess rides the stack
        for _ in 0..1500 {
            b.push_int(1);
        }
        b.call_hostv(h, 1500);
        // the saturation boundary itself spills with zero excess
        for _ in 0..FUNCV_ARITY_MAX {
            b.push_int(1);
        }
        b.call_hostv(h, FUNCV_ARITY_MAX);

        let mut ctx = run(b);
        assert_eq!(ctx.stack.pop().unwrap(), Value::Int(FUNCV_ARITY_MAX as i64));
        assert_eq!(ctx.stack.pop().unwrap(), Value::Int(1500));
        assert!(ctx.stack.is_empty());
    }

    #[test]
    fn test_dispatch_miss() {
        let mut b = Builder::new();
        b.push_str("a");
        b.push_str("b");
        b.builtin_op(Kind::Str, Operator::BitAnd);
        let code = b.resolve().unwrap();
        let mut ctx = Context::new(Arc::new(code));
        assert!(matches!(
            ctx.run(),
            Err(RuntimeError::DispatchMiss { .. })
        ));
    }

    #[test]
    fn test_addr_op_through_var_ref() {
        let mut b = Builder::new();
        let x = Var::new(Type::Int, "x");
        b.define_var(&x).unwrap();
        b.push_int(40);
        b.store_var(&x).unwrap();
        b.push_int(2);
        b.addr_var(&x).unwrap();
        b.addr_op(AddrOperator::AddAssign, Kind::Int);
        b.addr_var(&x).unwrap();
        b.addr_op(AddrOperator::Inc, Kind::Int);

        let ctx = run(b);
        assert_eq!(ctx.get_global(&x).unwrap(), Value::Int(43));
    }

    #[test]
    fn test_index_and_struct_ops() {
        let mut b = Builder::new();
        let layout = b.define_struct(
            "point",
            vec![("x".into(), Type::Int), ("y".into(), Type::Int)],
        );
        let p = Var::new(Type::Struct(layout), "p");
        b.define_var(&p).unwrap();
        b.push_int(3);
        b.push_int(4);
        b.make_struct(layout, 2);
        b.store_var(&p).unwrap();
        b.load_var(&p).unwrap();
        b.load_field(1);

        // list element read and write
        let l = Var::new(Type::List(Box::new(Type::Int)), "l");
        b.define_var(&l).unwrap();
        b.push_int(10);
        b.push_int(20);
        b.make_list(&Type::List(Box::new(Type::Int)), 2);
        b.store_var(&l).unwrap();
        b.push_int(99);
        b.load_var(&l).unwrap();
        b.index_set(Some(0));
        b.load_var(&l).unwrap();
        b.index_get(Some(0));

        let mut ctx = run(b);
        assert_eq!(ctx.stack.pop().unwrap(), Value::Int(99));
        assert_eq!(ctx.stack.pop().unwrap(), Value::Int(4));
    }

    #[test]
    fn test_err_wrap_and_branch() {
        let mut b = Builder::new();
        let h = b.host_func("fail", 0, Arc::new(|s: &mut Stack, _n| {
            s.push(ErrValue::new("boom"));
            Ok(())
        }));
        let handler = b.new_label();
        let done = b.new_label();
        b.call_host(h);
        b.err_wrap("opening file");
        b.wrap_if_err(handler);
        b.push_str("unreachable");
        b.jmp(done);
        b.label(handler).unwrap();
        b.label(done).unwrap();

        let mut ctx = run(b);
        match ctx.stack.pop().unwrap() {
            Value::Err(e) => assert_eq!(e.message, "opening file: boom"),
            v => panic!("expected error value, got {}", v),
        }
    }

    #[test]
    fn test_go_runs_inline_without_scheduler() {
        let mut b = Builder::new();
        let seen = Var::new(Type::Int, "seen");
        b.define_var(&seen).unwrap();
        let t = b.new_func("task");
        let x = Var::new(Type::Int, "x");
        b.func_args(t, std::slice::from_ref(&x)).unwrap();
        let after_t = b.new_label();
        b.jmp(after_t);
        b.define_func(t).unwrap();
        b.load_var(&x).unwrap();
        b.store_var(&seen).unwrap();
        b.end_func(t).unwrap();
        b.label(after_t).unwrap();
        b.push_int(7);
        b.closure(t);
        b.go_call(1);

        let ctx = run(b);
        assert_eq!(ctx.get_global(&seen).unwrap(), Value::Int(7));
    }

    #[test]
    fn test_type_cast_and_zero() {
        let mut b = Builder::new();
        b.push_int(7);
        b.type_cast(&Type::Float);
        b.zero(&Type::Str);

        let mut ctx = run(b);
        assert_eq!(ctx.stack.pop().unwrap(), Value::Str(String::new()));
        assert_eq!(ctx.stack.pop().unwrap(), Value::Float(7.0));
    }

    #[test]
    fn test_comprehension_body_below_start_faults() {
        let mut b = Builder::new();
        b.push_int(1);
        let comp = b.begin_comprehension();
        b.pop(1); // body consumes a value it did not produce
        let comp = b.end_comprehension(comp).unwrap();
        b.list_comp(comp);
        let code = b.resolve().unwrap();
        let mut ctx = Context::new(Arc::new(code));
        assert_eq!(ctx.run(), Err(RuntimeError::StackUnderflow));
    }

    #[test]
    fn test_stack_underflow_faults() {
        let mut b = Builder::new();
        b.builtin_op(Kind::Int, Operator::Add);
        let code = b.resolve().unwrap();
        let mut ctx = Context::new(Arc::new(code));
        assert_eq!(ctx.run(), Err(RuntimeError::StackUnderflow));
    }

    #[test]
    fn test_frame_relative_load_and_store() {
        let mut b = Builder::new();
        b.push_int(5);
        b.push_int(6);
        b.load(0); // copies the 5
        b.store(1); // overwrites the 6 with it
        let mut ctx = run(b);
        assert_eq!(ctx.stack.pop().unwrap(), Value::Int(5));
        assert_eq!(ctx.stack.pop().unwrap(), Value::Int(5));
    }
}
