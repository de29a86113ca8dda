use std::sync::LazyLock;

use crate::lang::types::{
    ADDR_OPERATOR_COUNT, AddrOperator, KIND_COUNT, Kind, Operator,
};
use crate::bytecode::instr::BITS_KIND;
use crate::lang::value::{Value, ValueRef};
use crate::runtime::context::Stack;
use crate::runtime::runtime_error::RuntimeError;

// =============================================================================
// OPERATOR DISPATCH TABLES
// =============================================================================
//
// The operand kind is baked into the instruction word, so execution is a
// single indexed load: no type switching on operand values. A `None` entry
// means the front end emitted an operator the kind does not support.

pub(crate) type OpFn = fn(&mut Stack) -> Result<(), RuntimeError>;

#[inline]
pub(crate) fn builtin_key(kind: u32, op: u32) -> usize {
    ((kind << BITS_KIND) | op) as usize
}

#[inline]
pub(crate) fn addr_key(op: u32, kind: u32) -> usize {
    ((op << BITS_KIND) | kind) as usize
}

macro_rules! int_arith {
    ($s:ident, $t:ty, $pop:ident, $wrap:ident, $ctor:ident) => {{
        let y = $s.$pop()?;
        let x = $s.$pop()?;
        $s.push(Value::$ctor(<$t>::$wrap(x, y)));
        Ok(())
    }};
}

macro_rules! int_div {
    ($s:ident, $pop:ident, $wrap:ident, $ctor:ident) => {{
        let y = $s.$pop()?;
        let x = $s.$pop()?;
        if y == 0 {
            return Err(RuntimeError::DivisionByZero);
        }
        $s.push(Value::$ctor(x.$wrap(y)));
        Ok(())
    }};
}

macro_rules! cmp {
    ($s:ident, $pop:ident, $op:tt) => {{
        let y = $s.$pop()?;
        let x = $s.$pop()?;
        $s.push(Value::Bool(x $op y));
        Ok(())
    }};
}

macro_rules! shift {
    ($s:ident, $pop:ident, $wrap:ident, $ctor:ident) => {{
        let y = $s.pop_uint_like()?;
        let x = $s.$pop()?;
        $s.push(Value::$ctor(x.$wrap(y as u32)));
        Ok(())
    }};
}

fn set(t: &mut [Option<OpFn>], kind: Kind, op: Operator, f: OpFn) {
    t[builtin_key(kind as u32, op as u32)] = Some(f);
}

pub(crate) static BUILTIN_OPS: LazyLock<Vec<Option<OpFn>>> = LazyLock::new(|| {
    let mut t: Vec<Option<OpFn>> = vec![None; builtin_key(KIND_COUNT, 0)];

    // bool
    set(&mut t, Kind::Bool, Operator::Eq, |s| cmp!(s, pop_bool, ==));
    set(&mut t, Kind::Bool, Operator::Ne, |s| cmp!(s, pop_bool, !=));
    set(&mut t, Kind::Bool, Operator::LAnd, |s| {
        let y = s.pop_bool()?;
        let x = s.pop_bool()?;
        s.push(Value::Bool(x && y));
        Ok(())
    });
    set(&mut t, Kind::Bool, Operator::LOr, |s| {
        let y = s.pop_bool()?;
        let x = s.pop_bool()?;
        s.push(Value::Bool(x || y));
        Ok(())
    });
    set(&mut t, Kind::Bool, Operator::Not, |s| {
        let x = s.pop_bool()?;
        s.push(Value::Bool(!x));
        Ok(())
    });

    // int
    set(&mut t, Kind::Int, Operator::Add, |s| int_arith!(s, i64, pop_int, wrapping_add, Int));
    set(&mut t, Kind::Int, Operator::Sub, |s| int_arith!(s, i64, pop_int, wrapping_sub, Int));
    set(&mut t, Kind::Int, Operator::Mul, |s| int_arith!(s, i64, pop_int, wrapping_mul, Int));
    set(&mut t, Kind::Int, Operator::Div, |s| int_div!(s, pop_int, wrapping_div, Int));
    set(&mut t, Kind::Int, Operator::Mod, |s| int_div!(s, pop_int, wrapping_rem, Int));
    set(&mut t, Kind::Int, Operator::BitAnd, |s| {
        let y = s.pop_int()?;
        let x = s.pop_int()?;
        s.push(Value::Int(x & y));
        Ok(())
    });
    set(&mut t, Kind::Int, Operator::BitOr, |s| {
        let y = s.pop_int()?;
        let x = s.pop_int()?;
        s.push(Value::Int(x | y));
        Ok(())
    });
    set(&mut t, Kind::Int, Operator::BitXor, |s| {
        let y = s.pop_int()?;
        let x = s.pop_int()?;
        s.push(Value::Int(x ^ y));
        Ok(())
    });
    set(&mut t, Kind::Int, Operator::Shl, |s| shift!(s, pop_int, wrapping_shl, Int));
    set(&mut t, Kind::Int, Operator::Shr, |s| shift!(s, pop_int, wrapping_shr, Int));
    set(&mut t, Kind::Int, Operator::Lt, |s| cmp!(s, pop_int, <));
    set(&mut t, Kind::Int, Operator::Le, |s| cmp!(s, pop_int, <=));
    set(&mut t, Kind::Int, Operator::Gt, |s| cmp!(s, pop_int, >));
    set(&mut t, Kind::Int, Operator::Ge, |s| cmp!(s, pop_int, >=));
    set(&mut t, Kind::Int, Operator::Eq, |s| cmp!(s, pop_int, ==));
    set(&mut t, Kind::Int, Operator::Ne, |s| cmp!(s, pop_int, !=));
    set(&mut t, Kind::Int, Operator::Neg, |s| {
        let x = s.pop_int()?;
        s.push(Value::Int(x.wrapping_neg()));
        Ok(())
    });
    set(&mut t, Kind::Int, Operator::BitNot, |s| {
        let x = s.pop_int()?;
        s.push(Value::Int(!x));
        Ok(())
    });

    // uint
    set(&mut t, Kind::Uint, Operator::Add, |s| int_arith!(s, u64, pop_uint, wrapping_add, Uint));
    set(&mut t, Kind::Uint, Operator::Sub, |s| int_arith!(s, u64, pop_uint, wrapping_sub, Uint));
    set(&mut t, Kind::Uint, Operator::Mul, |s| int_arith!(s, u64, pop_uint, wrapping_mul, Uint));
    set(&mut t, Kind::Uint, Operator::Div, |s| int_div!(s, pop_uint, wrapping_div, Uint));
    set(&mut t, Kind::Uint, Operator::Mod, |s| int_div!(s, pop_uint, wrapping_rem, Uint));
    set(&mut t, Kind::Uint, Operator::BitAnd, |s| {
        let y = s.pop_uint()?;
        let x = s.pop_uint()?;
        s.push(Value::Uint(x & y));
        Ok(())
    });
    set(&mut t, Kind::Uint, Operator::BitOr, |s| {
        let y = s.pop_uint()?;
        let x = s.pop_uint()?;
        s.push(Value::Uint(x | y));
        Ok(())
    });
    set(&mut t, Kind::Uint, Operator::BitXor, |s| {
        let y = s.pop_uint()?;
        let x = s.pop_uint()?;
        s.push(Value::Uint(x ^ y));
        Ok(())
    });
    set(&mut t, Kind::Uint, Operator::Shl, |s| shift!(s, pop_uint, wrapping_shl, Uint));
    set(&mut t, Kind::Uint, Operator::Shr, |s| shift!(s, pop_uint, wrapping_shr, Uint));
    set(&mut t, Kind::Uint, Operator::Lt, |s| cmp!(s, pop_uint, <));
    set(&mut t, Kind::Uint, Operator::Le, |s| cmp!(s, pop_uint, <=));
    set(&mut t, Kind::Uint, Operator::Gt, |s| cmp!(s, pop_uint, >));
    set(&mut t, Kind::Uint, Operator::Ge, |s| cmp!(s, pop_uint, >=));
    set(&mut t, Kind::Uint, Operator::Eq, |s| cmp!(s, pop_uint, ==));
    set(&mut t, Kind::Uint, Operator::Ne, |s| cmp!(s, pop_uint, !=));
    set(&mut t, Kind::Uint, Operator::BitNot, |s| {
        let x = s.pop_uint()?;
        s.push(Value::Uint(!x));
        Ok(())
    });

    // float
    set(&mut t, Kind::Float, Operator::Add, |s| {
        let y = s.pop_float()?;
        let x = s.pop_float()?;
        s.push(Value::Float(x + y));
        Ok(())
    });
    set(&mut t, Kind::Float, Operator::Sub, |s| {
        let y = s.pop_float()?;
        let x = s.pop_float()?;
        s.push(Value::Float(x - y));
        Ok(())
    });
    set(&mut t, Kind::Float, Operator::Mul, |s| {
        let y = s.pop_float()?;
        let x = s.pop_float()?;
        s.push(Value::Float(x * y));
        Ok(())
    });
    set(&mut t, Kind::Float, Operator::Div, |s| {
        let y = s.pop_float()?;
        let x = s.pop_float()?;
        s.push(Value::Float(x / y));
        Ok(())
    });
    set(&mut t, Kind::Float, Operator::Lt, |s| cmp!(s, pop_float, <));
    set(&mut t, Kind::Float, Operator::Le, |s| cmp!(s, pop_float, <=));
    set(&mut t, Kind::Float, Operator::Gt, |s| cmp!(s, pop_float, >));
    set(&mut t, Kind::Float, Operator::Ge, |s| cmp!(s, pop_float, >=));
    set(&mut t, Kind::Float, Operator::Eq, |s| cmp!(s, pop_float, ==));
    set(&mut t, Kind::Float, Operator::Ne, |s| cmp!(s, pop_float, !=));
    set(&mut t, Kind::Float, Operator::Neg, |s| {
        let x = s.pop_float()?;
        s.push(Value::Float(-x));
        Ok(())
    });

    // rune
    set(&mut t, Kind::Rune, Operator::Lt, |s| cmp!(s, pop_rune, <));
    set(&mut t, Kind::Rune, Operator::Le, |s| cmp!(s, pop_rune, <=));
    set(&mut t, Kind::Rune, Operator::Gt, |s| cmp!(s, pop_rune, >));
    set(&mut t, Kind::Rune, Operator::Ge, |s| cmp!(s, pop_rune, >=));
    set(&mut t, Kind::Rune, Operator::Eq, |s| cmp!(s, pop_rune, ==));
    set(&mut t, Kind::Rune, Operator::Ne, |s| cmp!(s, pop_rune, !=));

    // string
    set(&mut t, Kind::Str, Operator::Add, |s| {
        let y = s.pop_str()?;
        let mut x = s.pop_str()?;
        x.push_str(&y);
        s.push(Value::Str(x));
        Ok(())
    });
    set(&mut t, Kind::Str, Operator::Lt, |s| cmp!(s, pop_str, <));
    set(&mut t, Kind::Str, Operator::Le, |s| cmp!(s, pop_str, <=));
    set(&mut t, Kind::Str, Operator::Gt, |s| cmp!(s, pop_str, >));
    set(&mut t, Kind::Str, Operator::Ge, |s| cmp!(s, pop_str, >=));
    set(&mut t, Kind::Str, Operator::Eq, |s| cmp!(s, pop_str, ==));
    set(&mut t, Kind::Str, Operator::Ne, |s| cmp!(s, pop_str, !=));

    t
});

// =============================================================================
// ADDRESS OPERATORS
// =============================================================================
//
// Stack layout: compound assignment finds `[operand, ref]`, inc/dec and
// deref find `[ref]`. Plain assign and deref are kind-independent and are
// handled before this table is consulted.

fn pop_ref(s: &mut Stack) -> Result<ValueRef, RuntimeError> {
    match s.pop()? {
        Value::Ref(r) => Ok(r),
        v => Err(RuntimeError::TypeError {
            message: format!("expected a reference, got {}", v.type_name()),
        }),
    }
}

/// Plain assignment: store the operand through the reference.
pub(crate) fn exec_assign(s: &mut Stack) -> Result<(), RuntimeError> {
    let r = pop_ref(s)?;
    let v = s.pop()?;
    r.store(v)
}

/// Dereference: replace the reference with the value it points at.
pub(crate) fn exec_addr_val(s: &mut Stack) -> Result<(), RuntimeError> {
    let r = pop_ref(s)?;
    let v = r.load()?;
    s.push(v);
    Ok(())
}

macro_rules! compound {
    ($s:ident, $variant:ident, $apply:expr) => {{
        let r = pop_ref($s)?;
        let operand = $s.pop()?;
        match (r.load()?, operand) {
            (Value::$variant(old), Value::$variant(rhs)) => {
                r.store(Value::$variant($apply(old, rhs)))
            }
            (old, _) => Err(RuntimeError::TypeError {
                message: format!("compound assignment on {}", old.type_name()),
            }),
        }
    }};
}

macro_rules! step {
    ($s:ident, $variant:ident, $apply:expr) => {{
        let r = pop_ref($s)?;
        match r.load()? {
            Value::$variant(old) => r.store(Value::$variant($apply(old))),
            old => Err(RuntimeError::TypeError {
                message: format!("cannot step {}", old.type_name()),
            }),
        }
    }};
}

fn aset(t: &mut [Option<OpFn>], op: AddrOperator, kind: Kind, f: OpFn) {
    t[addr_key(op as u32, kind as u32)] = Some(f);
}

pub(crate) static ADDR_OPS: LazyLock<Vec<Option<OpFn>>> = LazyLock::new(|| {
    let mut t: Vec<Option<OpFn>> = vec![None; addr_key(ADDR_OPERATOR_COUNT, 0)];

    aset(&mut t, AddrOperator::AddAssign, Kind::Int, |s| {
        compound!(s, Int, i64::wrapping_add)
    });
    aset(&mut t, AddrOperator::SubAssign, Kind::Int, |s| {
        compound!(s, Int, i64::wrapping_sub)
    });
    aset(&mut t, AddrOperator::MulAssign, Kind::Int, |s| {
        compound!(s, Int, i64::wrapping_mul)
    });
    aset(&mut t, AddrOperator::DivAssign, Kind::Int, |s| {
        let r = pop_ref(s)?;
        let rhs = match s.pop()? {
            Value::Int(n) => n,
            v => {
                return Err(RuntimeError::TypeError {
                    message: format!("compound assignment on {}", v.type_name()),
                });
            }
        };
        if rhs == 0 {
            return Err(RuntimeError::DivisionByZero);
        }
        match r.load()? {
            Value::Int(old) => r.store(Value::Int(old.wrapping_div(rhs))),
            old => Err(RuntimeError::TypeError {
                message: format!("compound assignment on {}", old.type_name()),
            }),
        }
    });
    aset(&mut t, AddrOperator::ModAssign, Kind::Int, |s| {
        let r = pop_ref(s)?;
        let rhs = match s.pop()? {
            Value::Int(n) => n,
            v => {
                return Err(RuntimeError::TypeError {
                    message: format!("compound assignment on {}", v.type_name()),
                });
            }
        };
        if rhs == 0 {
            return Err(RuntimeError::DivisionByZero);
        }
        match r.load()? {
            Value::Int(old) => r.store(Value::Int(old.wrapping_rem(rhs))),
            old => Err(RuntimeError::TypeError {
                message: format!("compound assignment on {}", old.type_name()),
            }),
        }
    });
    aset(&mut t, AddrOperator::Inc, Kind::Int, |s| {
        step!(s, Int, |x: i64| x.wrapping_add(1))
    });
    aset(&mut t, AddrOperator::Dec, Kind::Int, |s| {
        step!(s, Int, |x: i64| x.wrapping_sub(1))
    });

    aset(&mut t, AddrOperator::AddAssign, Kind::Uint, |s| {
        compound!(s, Uint, u64::wrapping_add)
    });
    aset(&mut t, AddrOperator::SubAssign, Kind::Uint, |s| {
        compound!(s, Uint, u64::wrapping_sub)
    });
    aset(&mut t, AddrOperator::MulAssign, Kind::Uint, |s| {
        compound!(s, Uint, u64::wrapping_mul)
    });
    aset(&mut t, AddrOperator::Inc, Kind::Uint, |s| {
        step!(s, Uint, |x: u64| x.wrapping_add(1))
    });
    aset(&mut t, AddrOperator::Dec, Kind::Uint, |s| {
        step!(s, Uint, |x: u64| x.wrapping_sub(1))
    });

    aset(&mut t, AddrOperator::AddAssign, Kind::Float, |s| {
        compound!(s, Float, |a: f64, b: f64| a + b)
    });
    aset(&mut t, AddrOperator::SubAssign, Kind::Float, |s| {
        compound!(s, Float, |a: f64, b: f64| a - b)
    });
    aset(&mut t, AddrOperator::MulAssign, Kind::Float, |s| {
        compound!(s, Float, |a: f64, b: f64| a * b)
    });
    aset(&mut t, AddrOperator::DivAssign, Kind::Float, |s| {
        compound!(s, Float, |a: f64, b: f64| a / b)
    });

    aset(&mut t, AddrOperator::AddAssign, Kind::Str, |s| {
        compound!(s, Str, |mut a: String, b: String| {
            a.push_str(&b);
            a
        })
    });

    t
});

#[cfg(test)]
mod tests {
    use super::*;

    fn run(kind: Kind, op: Operator, stack: &mut Stack) -> Result<(), RuntimeError> {
        let f = BUILTIN_OPS[builtin_key(kind as u32, op as u32)]
            .ok_or(RuntimeError::DispatchMiss { instr: 0 })?;
        f(stack)
    }

    #[test]
    fn test_int_arith() {
        let mut s = Stack::new();
        s.push(Value::Int(7));
        s.push(Value::Int(3));
        run(Kind::Int, Operator::Mod, &mut s).unwrap();
        assert_eq!(s.pop().unwrap(), Value::Int(1));
    }

    #[test]
    fn test_int_div_by_zero() {
        let mut s = Stack::new();
        s.push(Value::Int(1));
        s.push(Value::Int(0));
        assert_eq!(
            run(Kind::Int, Operator::Div, &mut s),
            Err(RuntimeError::DivisionByZero)
        );
    }

    #[test]
    fn test_wrapping_int_add() {
        let mut s = Stack::new();
        s.push(Value::Int(i64::MAX));
        s.push(Value::Int(1));
        run(Kind::Int, Operator::Add, &mut s).unwrap();
        assert_eq!(s.pop().unwrap(), Value::Int(i64::MIN));
    }

    #[test]
    fn test_str_concat_and_compare() {
        let mut s = Stack::new();
        s.push(Value::Str("ab".into()));
        s.push(Value::Str("cd".into()));
        run(Kind::Str, Operator::Add, &mut s).unwrap();
        assert_eq!(s.pop().unwrap(), Value::Str("abcd".into()));

        s.push(Value::Str("a".into()));
        s.push(Value::Str("b".into()));
        run(Kind::Str, Operator::Lt, &mut s).unwrap();
        assert_eq!(s.pop().unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_unsupported_pair_is_a_hole() {
        let k = builtin_key(Kind::Str as u32, Operator::BitAnd as u32);
        assert!(BUILTIN_OPS[k].is_none());
    }
}
