use std::sync::Arc;

use crate::bytecode::instr::Instr;
use crate::lang::types::Type;
use crate::lang::value::Value;
use crate::runtime::context::Stack;
use crate::runtime::runtime_error::RuntimeError;

// =============================================================================
// LITERAL POOL
// =============================================================================

/// Interned literal constant.
///
/// Floats are stored as their bit pattern so the pool key can be `Eq + Hash`;
/// `pushConst` rebuilds the value on the way out.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Lit {
    Int(i64),
    Uint(u64),
    Float(u64),
    Rune(char),
    Str(String),
}

impl Lit {
    pub fn value(&self) -> Value {
        match self {
            Lit::Int(n) => Value::Int(*n),
            Lit::Uint(n) => Value::Uint(*n),
            Lit::Float(bits) => Value::Float(f64::from_bits(*bits)),
            Lit::Rune(c) => Value::Rune(*c),
            Lit::Str(s) => Value::Str(s.clone()),
        }
    }
}

// =============================================================================
// FUNCTION DESCRIPTORS
// =============================================================================

/// Resolved descriptor of one bytecode function, fixed-arity or variadic.
///
/// Frame slot layout at call time: slots `0 .. n_out` hold the results,
/// followed by the bound parameters, then the locals.
#[derive(Debug, Clone)]
pub struct FuncInfo {
    pub name: String,
    /// First instruction of the body.
    pub entry: usize,
    /// One past the last instruction of the body.
    pub end: usize,
    /// Total frame slots, results and parameters included.
    pub n_vars: usize,
    pub n_in: usize,
    pub n_out: usize,
    pub in_types: Vec<Type>,
    pub variadic: bool,
}

impl FuncInfo {
    pub fn is_variadic(&self) -> bool {
        self.variadic
    }
}

/// Host-function binding: a native callback invoked through `callHost` /
/// `callHostv`, operating directly on the operand stack.
pub type HostCall = Arc<dyn Fn(&mut Stack, u32) -> Result<(), RuntimeError> + Send + Sync>;

#[derive(Clone)]
pub struct HostFun {
    pub name: String,
    pub n_in: usize,
    pub variadic: bool,
    pub f: HostCall,
}

impl std::fmt::Debug for HostFun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFun")
            .field("name", &self.name)
            .field("n_in", &self.n_in)
            .field("variadic", &self.variadic)
            .finish()
    }
}

// =============================================================================
// STRUCTURED-CONTROL POOLS
// =============================================================================

#[derive(Debug, Clone)]
pub struct StructInfo {
    pub name: String,
    pub fields: Vec<(String, Type)>,
}

impl StructInfo {
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(n, _)| n == name)
    }
}

/// One iteration phrase: the body instruction range plus the frame slots the
/// loop variables were bound to, if the source named them.
#[derive(Debug, Clone)]
pub struct ForPhrase {
    pub key: Option<u32>,
    pub value: Option<u32>,
    pub start: usize,
    pub end: usize,
}

/// A comprehension body; executed per element, its stack deposits become the
/// elements of the collected list.
#[derive(Debug, Clone)]
pub struct Comprehension {
    pub start: usize,
    pub end: usize,
}

// =============================================================================
// CODE - the immutable executable unit
// =============================================================================

/// An executable unit: the instruction stream plus every pool its
/// instructions index into. Produced by [`Builder::resolve`] and never
/// mutated afterwards, so it can be shared across contexts.
///
/// [`Builder::resolve`]: crate::Builder::resolve
#[derive(Debug, Clone, Default)]
pub struct Code {
    pub(crate) data: Vec<Instr>,
    pub(crate) consts: Vec<Lit>,
    pub(crate) funs: Vec<FuncInfo>,
    pub(crate) funvs: Vec<FuncInfo>,
    pub(crate) types: Vec<Type>,
    pub(crate) structs: Vec<StructInfo>,
    pub(crate) fors: Vec<ForPhrase>,
    pub(crate) comprehens: Vec<Comprehension>,
    pub(crate) host_funs: Vec<HostFun>,
    pub(crate) host_funvs: Vec<HostFun>,
    pub(crate) err_wraps: Vec<String>,
    pub(crate) n_globals: usize,
}

impl Code {
    /// Number of instruction words.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of global variable slots the top-level frame needs.
    pub fn globals(&self) -> usize {
        self.n_globals
    }

    pub fn struct_info(&self, layout: u32) -> Option<&StructInfo> {
        self.structs.get(layout as usize)
    }
}
