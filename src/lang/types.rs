use serde::{Deserialize, Serialize};

// =============================================================================
// TYPE - runtime type descriptors
// =============================================================================

/// Runtime type descriptor.
///
/// Descriptors are deduplicated by identity in the [`Code`](crate::Code)
/// type pool, so `Eq + Hash` double as the pool key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    /// The universal type: any value fits, no coercion performed.
    Any,
    Bool,
    Int,
    Uint,
    Float,
    Rune,
    Str,
    /// Homogeneous sequence with the given element type.
    List(Box<Type>),
    /// Struct value laid out by the indexed entry of the struct pool.
    Struct(u32),
}

impl Type {
    /// Element type of a sequence type, if this is one.
    pub fn elem(&self) -> Option<&Type> {
        match self {
            Type::List(t) => Some(t),
            _ => None,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Type::Any => "any".to_string(),
            Type::Bool => "bool".to_string(),
            Type::Int => "int".to_string(),
            Type::Uint => "uint".to_string(),
            Type::Float => "float".to_string(),
            Type::Rune => "rune".to_string(),
            Type::Str => "string".to_string(),
            Type::List(t) => format!("[]{}", t.name()),
            Type::Struct(idx) => format!("struct#{}", idx),
        }
    }
}

// =============================================================================
// KIND - operand kinds for operator dispatch
// =============================================================================

/// Operand kind index used in `builtinOp`/`addrOp` instructions.
///
/// The kind is baked into the instruction at emission time; the interpreter
/// never type-switches on operands to pick an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum Kind {
    Bool = 0,
    Int = 1,
    Uint = 2,
    Float = 3,
    Rune = 4,
    Str = 5,
}

/// Number of dispatchable kinds; sizes the operator tables.
pub const KIND_COUNT: u32 = 6;

impl Kind {
    pub fn from_u32(v: u32) -> Option<Kind> {
        match v {
            0 => Some(Kind::Bool),
            1 => Some(Kind::Int),
            2 => Some(Kind::Uint),
            3 => Some(Kind::Float),
            4 => Some(Kind::Rune),
            5 => Some(Kind::Str),
            _ => None,
        }
    }
}

// =============================================================================
// OPERATOR - value operators
// =============================================================================

/// Binary/unary value operator index (5-bit field of `builtinOp`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum Operator {
    Add = 0,
    Sub = 1,
    Mul = 2,
    Div = 3,
    Mod = 4,
    BitAnd = 5,
    BitOr = 6,
    BitXor = 7,
    Shl = 8,
    Shr = 9,
    Lt = 10,
    Le = 11,
    Gt = 12,
    Ge = 13,
    Eq = 14,
    Ne = 15,
    LAnd = 16,
    LOr = 17,
    Neg = 18,
    Not = 19,
    BitNot = 20,
}

pub const OPERATOR_COUNT: u32 = 21;

// =============================================================================
// ADDR OPERATOR - operators over addressable operands
// =============================================================================

/// Operator over an addressable operand (4-bit field of `addrOp`): plain and
/// compound assignment, increment/decrement, and address dereference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum AddrOperator {
    /// `=`
    Assign = 0,
    /// `*addr`
    AddrVal = 1,
    /// `+=`
    AddAssign = 2,
    /// `-=`
    SubAssign = 3,
    /// `*=`
    MulAssign = 4,
    /// `/=`
    DivAssign = 5,
    /// `%=`
    ModAssign = 6,
    /// `++`
    Inc = 7,
    /// `--`
    Dec = 8,
}

pub const ADDR_OPERATOR_COUNT: u32 = 9;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_names() {
        assert_eq!(Type::Int.name(), "int");
        assert_eq!(Type::List(Box::new(Type::Float)).name(), "[]float");
        assert_eq!(Type::List(Box::new(Type::Any)).name(), "[]any");
    }

    #[test]
    fn test_elem_type() {
        let t = Type::List(Box::new(Type::Str));
        assert_eq!(t.elem(), Some(&Type::Str));
        assert_eq!(Type::Int.elem(), None);
    }

    #[test]
    fn test_kind_round_trip() {
        for v in 0..KIND_COUNT {
            let k = Kind::from_u32(v).unwrap();
            assert_eq!(k as u32, v);
        }
        assert!(Kind::from_u32(KIND_COUNT).is_none());
    }
}
