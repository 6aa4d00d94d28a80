//! Hand-written rules for every builtin.

mod domain;
mod finite_diff;
mod primitive;

pub use domain::Domain;
pub use finite_diff::{check_gradient, finite_diff_grad, max_grad_error};
pub use primitive::Primitive;

use indexmap::IndexMap;
use rewind::{Builtin, Callee, Signature};
use rewind_autodiff::{Registry, RuleRef};
use std::rc::Rc;

pub const BUILTINS: [Builtin; 20] = [
    Builtin::Add,
    Builtin::Sub,
    Builtin::Mul,
    Builtin::Div,
    Builtin::Neg,
    Builtin::Sin,
    Builtin::Cos,
    Builtin::Exp,
    Builtin::Log,
    Builtin::Sqrt,
    Builtin::Acos,
    Builtin::Lt,
    Builtin::Gt,
    Builtin::Eq,
    Builtin::AddInt,
    Builtin::GetIndex,
    Builtin::SetIndex,
    Builtin::Length,
    Builtin::Tuple,
    Builtin::GetField,
];

/// A registry with one [`Primitive`] per builtin, keyed by the builtin alone.
pub struct Rules {
    rules: IndexMap<Builtin, RuleRef>,
}

impl Default for Rules {
    fn default() -> Self {
        Rules {
            rules: BUILTINS
                .iter()
                .map(|&op| (op, Rc::new(Primitive::new(op)) as RuleRef))
                .collect(),
        }
    }
}

impl Rules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the rule for `op`.
    pub fn with(mut self, op: Builtin, rule: RuleRef) -> Self {
        self.rules.insert(op, rule);
        self
    }

    pub fn get(&self, op: Builtin) -> Option<&RuleRef> {
        self.rules.get(&op)
    }
}

impl Registry for Rules {
    fn lookup(&self, sig: &Signature) -> Option<RuleRef> {
        match &sig.callee {
            Callee::Builtin(op) => self.rules.get(op).map(Rc::clone),
            Callee::Func(_) => None,
        }
    }
}
