use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::lang::types::{Kind, Type};
use crate::runtime::context::Frame;
use crate::runtime::runtime_error::RuntimeError;

// =============================================================================
// VALUE - the closed runtime value variant
// =============================================================================

/// Runtime value.
///
/// Values are the only data that can exist on the operand stack or in a
/// frame's local-variable array. The variant set is closed: constant binding
/// and type casts go through [`coerce`] rather than any reflection facility.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Nil,

    Bool(bool),

    /// 64-bit signed integer.
    Int(i64),

    /// 64-bit unsigned integer.
    Uint(u64),

    /// 64-bit floating-point number.
    Float(f64),

    /// Unicode code point.
    Rune(char),

    /// UTF-8 string value.
    Str(String),

    /// Sequence value with shared reference semantics, so element assignment
    /// through one handle is visible through every other.
    List(Rc<RefCell<Vec<Value>>>),

    /// Struct value; the layout index points into the struct pool.
    Struct(Rc<RefCell<StructData>>),

    /// A function value bound to the frame that was active at its `closure`
    /// instruction. Holding the value keeps that frame alive.
    Closure(Rc<ClosureData>),

    /// Address of a mutable location (frame slot, list element or struct
    /// field), produced by `addrVar`/`index`/`addrField` and consumed by
    /// `addrOp` instructions.
    Ref(ValueRef),

    /// Program-level error value: tested by `wrapIfErr`, annotated by
    /// `errWrap`. Distinct from interpreter faults, which halt execution.
    Err(Rc<ErrValue>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructData {
    pub layout: u32,
    pub fields: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClosureData {
    /// Index into the fixed or variadic function table.
    pub fun: u32,
    pub variadic: bool,
    /// Lexically enclosing frame at definition time.
    pub frame: Rc<Frame>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrValue {
    pub message: String,
}

impl ErrValue {
    pub fn new(message: impl Into<String>) -> Value {
        Value::Err(Rc::new(ErrValue {
            message: message.into(),
        }))
    }
}

// =============================================================================
// VALUE REF - addressable locations
// =============================================================================

/// A reference to a mutable value location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ValueRef {
    Var { frame: Rc<Frame>, idx: u32 },
    Elem { list: Rc<RefCell<Vec<Value>>>, idx: usize },
    Field { obj: Rc<RefCell<StructData>>, idx: usize },
}

impl ValueRef {
    pub fn load(&self) -> Result<Value, RuntimeError> {
        match self {
            ValueRef::Var { frame, idx } => frame.get_var(*idx),
            ValueRef::Elem { list, idx } => {
                let items = list.borrow();
                items
                    .get(*idx)
                    .cloned()
                    .ok_or_else(|| RuntimeError::IndexOutOfRange {
                        index: *idx as i64,
                        len: items.len(),
                    })
            }
            ValueRef::Field { obj, idx } => {
                let data = obj.borrow();
                data.fields
                    .get(*idx)
                    .cloned()
                    .ok_or_else(|| RuntimeError::IndexOutOfRange {
                        index: *idx as i64,
                        len: data.fields.len(),
                    })
            }
        }
    }

    pub fn store(&self, v: Value) -> Result<(), RuntimeError> {
        match self {
            ValueRef::Var { frame, idx } => frame.set_var(*idx, v),
            ValueRef::Elem { list, idx } => {
                let mut items = list.borrow_mut();
                let len = items.len();
                let slot = items
                    .get_mut(*idx)
                    .ok_or(RuntimeError::IndexOutOfRange {
                        index: *idx as i64,
                        len,
                    })?;
                *slot = v;
                Ok(())
            }
            ValueRef::Field { obj, idx } => {
                let mut data = obj.borrow_mut();
                let len = data.fields.len();
                let slot = data
                    .fields
                    .get_mut(*idx)
                    .ok_or(RuntimeError::IndexOutOfRange {
                        index: *idx as i64,
                        len,
                    })?;
                *slot = v;
                Ok(())
            }
        }
    }
}

// =============================================================================

impl Value {
    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Uint(_) => "uint",
            Value::Float(_) => "float",
            Value::Rune(_) => "rune",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Struct(_) => "struct",
            Value::Closure(_) => "closure",
            Value::Ref(_) => "ref",
            Value::Err(_) => "error",
        }
    }

    /// Dispatch kind of this value, if it participates in operator dispatch.
    pub fn kind(&self) -> Option<Kind> {
        match self {
            Value::Bool(_) => Some(Kind::Bool),
            Value::Int(_) => Some(Kind::Int),
            Value::Uint(_) => Some(Kind::Uint),
            Value::Float(_) => Some(Kind::Float),
            Value::Rune(_) => Some(Kind::Rune),
            Value::Str(_) => Some(Kind::Str),
            _ => None,
        }
    }

    pub fn is_err(&self) -> bool {
        matches!(self, Value::Err(_))
    }
}

impl PartialEq for Value {
    /// Structural equality for data values. Closures and refs never compare
    /// equal; they have identity, not value.
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Uint(a), Value::Uint(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Rune(a), Value::Rune(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => *a.borrow() == *b.borrow(),
            (Value::Struct(a), Value::Struct(b)) => {
                let (a, b) = (a.borrow(), b.borrow());
                a.layout == b.layout && a.fields == b.fields
            }
            (Value::Err(a), Value::Err(b)) => a.message == b.message,
            _ => false,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Uint(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::Rune(c) => write!(f, "{}", c),
            Value::Str(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.borrow().iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Struct(data) => {
                let data = data.borrow();
                write!(f, "struct#{}{{", data.layout)?;
                for (i, field) in data.fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", field)?;
                }
                write!(f, "}}")
            }
            Value::Closure(c) => write!(f, "closure#{}", c.fun),
            Value::Ref(_) => write!(f, "<ref>"),
            Value::Err(e) => write!(f, "error: {}", e.message),
        }
    }
}

// =============================================================================
// COERCION - explicit conversion per target kind
// =============================================================================

/// Convert a value to the target type.
///
/// This is the constant-binding and `typeCast` path: a closed conversion
/// table, one arm per target kind. An impossible conversion is a runtime
/// fault, not a silent bit pattern.
pub fn coerce(v: &Value, target: &Type) -> Result<Value, RuntimeError> {
    let fail = || RuntimeError::BadCoercion {
        from: v.type_name().to_string(),
        to: target.name(),
    };
    match target {
        Type::Any => Ok(v.clone()),
        Type::Bool => match v {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            _ => Err(fail()),
        },
        Type::Int => match v {
            Value::Int(n) => Ok(Value::Int(*n)),
            Value::Uint(n) => Ok(Value::Int(*n as i64)),
            Value::Float(n) => Ok(Value::Int(*n as i64)),
            Value::Rune(c) => Ok(Value::Int(*c as i64)),
            _ => Err(fail()),
        },
        Type::Uint => match v {
            Value::Int(n) => Ok(Value::Uint(*n as u64)),
            Value::Uint(n) => Ok(Value::Uint(*n)),
            Value::Float(n) => Ok(Value::Uint(*n as u64)),
            Value::Rune(c) => Ok(Value::Uint(*c as u64)),
            _ => Err(fail()),
        },
        Type::Float => match v {
            Value::Int(n) => Ok(Value::Float(*n as f64)),
            Value::Uint(n) => Ok(Value::Float(*n as f64)),
            Value::Float(n) => Ok(Value::Float(*n)),
            _ => Err(fail()),
        },
        Type::Rune => match v {
            Value::Rune(c) => Ok(Value::Rune(*c)),
            Value::Int(n) => u32::try_from(*n)
                .ok()
                .and_then(char::from_u32)
                .map(Value::Rune)
                .ok_or_else(fail),
            _ => Err(fail()),
        },
        Type::Str => match v {
            Value::Str(s) => Ok(Value::Str(s.clone())),
            Value::Rune(c) => Ok(Value::Str(c.to_string())),
            _ => Err(fail()),
        },
        Type::List(elem) => match v {
            Value::List(items) if **elem == Type::Any => Ok(Value::List(items.clone())),
            Value::List(items) => {
                let converted: Result<Vec<Value>, RuntimeError> =
                    items.borrow().iter().map(|it| coerce(it, elem)).collect();
                Ok(Value::list(converted?))
            }
            _ => Err(fail()),
        },
        Type::Struct(layout) => match v {
            Value::Struct(data) if data.borrow().layout == *layout => {
                Ok(Value::Struct(data.clone()))
            }
            _ => Err(fail()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coerce_numeric() {
        assert_eq!(coerce(&Value::Int(7), &Type::Float).unwrap(), Value::Float(7.0));
        assert_eq!(coerce(&Value::Uint(7), &Type::Int).unwrap(), Value::Int(7));
        assert_eq!(coerce(&Value::Rune('A'), &Type::Int).unwrap(), Value::Int(65));
        assert_eq!(coerce(&Value::Int(66), &Type::Rune).unwrap(), Value::Rune('B'));
    }

    #[test]
    fn test_coerce_any_is_identity() {
        let list = Value::list(vec![Value::Int(1), Value::Str("x".to_string())]);
        assert_eq!(coerce(&list, &Type::Any).unwrap(), list);
    }

    #[test]
    fn test_coerce_list_elementwise() {
        let list = Value::list(vec![Value::Int(1), Value::Int(2)]);
        let got = coerce(&list, &Type::List(Box::new(Type::Float))).unwrap();
        assert_eq!(got, Value::list(vec![Value::Float(1.0), Value::Float(2.0)]));
    }

    #[test]
    fn test_coerce_failure() {
        let err = coerce(&Value::Str("x".to_string()), &Type::Int).unwrap_err();
        assert!(matches!(err, RuntimeError::BadCoercion { .. }));
    }

    #[test]
    fn test_list_reference_semantics() {
        let a = Value::list(vec![Value::Int(1)]);
        let b = a.clone();
        if let Value::List(items) = &a {
            items.borrow_mut().push(Value::Int(2));
        }
        assert_eq!(b, Value::list(vec![Value::Int(1), Value::Int(2)]));
    }

    #[test]
    fn test_display() {
        let list = Value::list(vec![Value::Int(1), Value::Int(4), Value::Int(9)]);
        assert_eq!(list.to_string(), "[1 4 9]");
        assert_eq!(Value::Nil.to_string(), "nil");
    }

    #[test]
    fn test_postcard_round_trip() {
        let v = Value::list(vec![
            Value::Int(-3),
            Value::Str("hello".to_string()),
            Value::Bool(true),
            Value::Float(2.5),
        ]);
        let bytes = postcard::to_allocvec(&v).unwrap();
        let back: Value = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(back, v);
    }
}
