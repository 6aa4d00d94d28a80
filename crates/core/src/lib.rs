pub mod build;
pub mod cfg;
pub mod id;

use std::{cell::RefCell, fmt, rc::Rc};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    Nothing,
    Bool,
    Int,
    F64,
    /// Interned text; never differentiable.
    Symbol,
    /// A mutable buffer of reals, shared by every reference to it.
    Vector,
    Tuple {
        members: Vec<Type>,
    },
    /// The widest type; only a `Pi` node can recover something more specific.
    Any,
}

impl Type {
    /// Whether a value of this type always has the same runtime representation.
    pub fn is_concrete(&self) -> bool {
        match self {
            Type::Any => false,
            Type::Tuple { members } => members.iter().all(Type::is_concrete),
            _ => true,
        }
    }

    /// Whether a value of type `ty` may flow through a point declared with this type.
    pub fn admits(&self, ty: &Type) -> bool {
        match (self, ty) {
            (Type::Any, _) => true,
            (Type::Tuple { members: a }, Type::Tuple { members: b }) => {
                a.len() == b.len() && a.iter().zip(b).all(|(a, b)| a.admits(b))
            }
            _ => self == ty,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Tuple { members } => {
                write!(f, "Tuple(")?;
                write_list(f, members)?;
                write!(f, ")")
            }
            _ => write!(f, "{self:?}"),
        }
    }
}

fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    let mut first = true;
    for item in items {
        if first {
            first = false;
        } else {
            write!(f, ", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

/// A runtime value.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub enum Val {
    Nothing,
    Bool(bool),
    Int(i64),
    F64(f64),
    Symbol(Rc<str>),
    Vector(Rc<RefCell<Vec<f64>>>),
    Tuple(Rc<Vec<Val>>),
}

impl Val {
    pub fn vector(elems: Vec<f64>) -> Self {
        Val::Vector(Rc::new(RefCell::new(elems)))
    }

    pub fn tuple(members: Vec<Val>) -> Self {
        Val::Tuple(Rc::new(members))
    }

    pub fn symbol(name: &str) -> Self {
        Val::Symbol(name.into())
    }

    pub fn ty(&self) -> Type {
        match self {
            Val::Nothing => Type::Nothing,
            Val::Bool(_) => Type::Bool,
            Val::Int(_) => Type::Int,
            Val::F64(_) => Type::F64,
            Val::Symbol(_) => Type::Symbol,
            Val::Vector(_) => Type::Vector,
            Val::Tuple(members) => Type::Tuple {
                members: members.iter().map(Val::ty).collect(),
            },
        }
    }

    pub fn f64(&self) -> Option<f64> {
        match *self {
            Val::F64(x) => Some(x),
            _ => None,
        }
    }
}

/// A value known when the IR was produced.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub enum Const {
    Literal(Val),
    /// A value spliced into the IR by the front-end rather than written in the source.
    Quoted(Val),
    /// A named global, resolved through the [`Provider`].
    Global(Rc<str>),
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    Arg(id::Arg),
    Var(id::Var),
    Const(Const),
}

impl Operand {
    pub fn lit(val: Val) -> Self {
        Operand::Const(Const::Literal(val))
    }

    pub fn f64(val: f64) -> Self {
        Operand::lit(Val::F64(val))
    }

    pub fn int(val: i64) -> Self {
        Operand::lit(Val::Int(val))
    }
}

/// Primitive operations with no IR of their own.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Builtin {
    // F64 -> F64 -> F64
    Add,
    Sub,
    Mul,
    Div,

    // F64 -> F64
    Neg,
    Sin,
    Cos,
    Exp,
    Log,
    Sqrt,
    Acos,

    // F64 -> F64 -> Bool, or Int -> Int -> Bool
    Lt,
    Gt,
    Eq,

    // Int -> Int -> Int
    AddInt,

    // Vector -> Int -> F64
    GetIndex,
    // Vector -> F64 -> Int -> Vector, mutating the vector in place
    SetIndex,
    // Vector -> Int
    Length,

    // T... -> Tuple(T...)
    Tuple,
    // Tuple -> Int -> T
    GetField,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Callee {
    Builtin(Builtin),
    Func(Rc<str>),
}

impl fmt::Display for Callee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callee::Builtin(op) => write!(f, "{op:?}"),
            Callee::Func(name) => write!(f, "{name}"),
        }
    }
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    /// The callee is known from the IR alone.
    Static { callee: Callee, args: Vec<Operand> },
    /// The callee is itself a runtime value, a `Symbol` naming a function.
    Dynamic { callee: Operand, args: Vec<Operand> },
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Nop,
    Goto {
        target: id::Block,
    },
    /// Jumps to `target` if `cond` is false, otherwise falls through to the next block.
    GotoIfNot {
        cond: Operand,
        target: id::Block,
    },
    Return {
        val: Operand,
    },
    Phi {
        edges: Vec<(id::Block, Operand)>,
    },
    /// Narrows `val` to `ty`, failing at runtime if the value does not fit.
    Pi {
        val: Operand,
        ty: Type,
    },
    Const {
        val: Const,
    },
    Call {
        call: Call,
    },
    BoundsCheck,
    Meta {
        tag: Rc<str>,
    },
    /// Anything the front-end could not lower into one of the above.
    Unsupported {
        name: Rc<str>,
    },
}

impl Expr {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Expr::Goto { .. } | Expr::GotoIfNot { .. } | Expr::Return { .. }
        )
    }
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct Instr {
    pub var: id::Var,
    pub expr: Expr,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Block {
    pub code: Vec<Instr>,
}

/// A typed function body. Block 0 is the entry block.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct Function {
    pub params: Vec<Type>,
    pub ret: Type,
    /// Inferred type of every program point.
    pub vars: Vec<Type>,
    pub blocks: Vec<Block>,
}

impl Function {
    pub fn ty(&self, var: id::Var) -> &Type {
        &self.vars[var.var()]
    }

    pub fn entry(&self) -> id::Block {
        id::block(0)
    }
}

/// A callee together with the concrete types of its arguments.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Signature {
    pub callee: Callee,
    pub args: Vec<Type>,
}

impl Signature {
    pub fn new(callee: Callee, args: Vec<Type>) -> Self {
        Signature { callee, args }
    }

    pub fn func(name: &str, args: Vec<Type>) -> Self {
        Signature::new(Callee::Func(name.into()), args)
    }

    pub fn builtin(op: Builtin, args: Vec<Type>) -> Self {
        Signature::new(Callee::Builtin(op), args)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.callee)?;
        write_list(f, &self.args)?;
        write!(f, ")")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no method matching {0}")]
    NoMethod(String),

    #[error("signature {0} has non-concrete argument types")]
    AbstractSignature(String),

    #[error("builtin {0:?} has no IR")]
    BuiltinIr(Builtin),

    #[error("function has no return statement")]
    NoReturn,

    #[error("block {0} falls off the end of the function")]
    FallsOffEnd(usize),

    #[error("block {0} is empty")]
    EmptyBlock(usize),

    #[error("block {block} jumps to block {target}, which does not exist")]
    BadTarget { block: usize, target: usize },
}

/// Source of typed IR, standing in for a language front-end.
pub trait Provider {
    /// Typed IR for `sig`, along with its inferred return type.
    fn typed_ir(&self, sig: &Signature) -> Result<(Rc<Function>, Type), Error>;

    /// Value and declared type of a named global.
    fn global(&self, name: &str) -> Option<(Val, Type)>;
}
