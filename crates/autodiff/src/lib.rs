//! Reverse-mode differentiation by transforming a function's IR into a forward program, which
//! runs the primal computation while recording what the reverse pass needs, and a reverse
//! program, which replays those records backwards to propagate gradients.

mod alloc;
mod cache;
mod capture;
mod compile;
mod context;
mod glue;
pub mod ir;
mod safe;
pub mod stack;
pub mod tangent;
mod translate;

pub use alloc::{Slot, SlotAllocator};
pub use cache::{BuildConfig, RuleCache};
pub use context::Context;
pub use glue::DerivedRule;
pub use safe::SafeRule;
pub use tangent::{
    is_differentiable, randn_tangent, tangent_type, uninit_tangent, zero_rdata, zero_tangent,
    CoDual, FData, RData, Tangent, TangentType,
};
pub use translate::{translate, Translation};

use rewind::{Signature, Val};
use std::rc::Rc;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("program point {point} is a `{name}` statement, which cannot be differentiated")]
    UnsupportedStmt { point: usize, name: String },

    #[error("callee of the call at program point {point} is not known statically")]
    DynamicDispatch { point: usize },

    #[error("could not get IR for {sig}")]
    Provider {
        sig: String,
        #[source]
        source: rewind::Error,
    },

    #[error("IR for {sig} is malformed")]
    Invalid {
        sig: String,
        #[source]
        source: rewind_validate::Error,
    },

    #[error("unknown global `{0}`")]
    UnknownGlobal(String),

    #[error("{sig} takes {expected} arguments but was given {got}")]
    Arity {
        sig: String,
        expected: usize,
        got: usize,
    },

    #[error("tangent mismatch: {0}")]
    TangentType(String),

    #[error("pullback of {context} returned {got} values for {expected} arguments")]
    PullbackArity {
        context: String,
        expected: usize,
        got: usize,
    },

    #[error(transparent)]
    Primal(#[from] rewind_interp::Error),

    #[error("pop from an empty stack")]
    StackUnderflow,

    #[error("{stack} was pushed {pushed} times but popped {popped} times")]
    StackImbalance {
        stack: String,
        pushed: usize,
        popped: usize,
    },

    #[error("rule for {0} was called before it finished building")]
    UnfinishedRule(String),

    #[error("cannot take the gradient of a function returning {0}")]
    NotDifferentiable(rewind::Type),

    #[error("derived program is inconsistent: {0}")]
    Malformed(String),
}

/// Reverse half of a rule: maps the result's reverse data to one reverse datum per argument.
pub type Pullback = Box<dyn FnOnce(RData) -> Result<Vec<RData>, Error>>;

/// Calling convention shared by hand-written and derived rules.
pub trait Rule {
    fn call(&self, args: &[CoDual]) -> Result<(CoDual, Pullback), Error>;
}

pub type RuleRef = Rc<dyn Rule>;

/// Hand-written rules, consulted before any rule is derived.
pub trait Registry {
    fn lookup(&self, sig: &Signature) -> Option<RuleRef>;
}

/// Run `rule` on `args` with zero tangents, seed the scalar result with `1.0`, and return the
/// result along with the full tangent of every argument.
pub fn value_and_gradient(rule: &dyn Rule, args: &[Val]) -> Result<(f64, Vec<Tangent>), Error> {
    let duals: Vec<CoDual> = args.iter().cloned().map(CoDual::zero).collect();
    let (y, pullback) = rule.call(&duals)?;
    let value = y
        .primal
        .f64()
        .ok_or_else(|| Error::NotDifferentiable(y.primal.ty()))?;
    let dxs = pullback(RData::F64(1.))?;
    if dxs.len() != duals.len() {
        return Err(Error::PullbackArity {
            context: "gradient".to_string(),
            expected: duals.len(),
            got: dxs.len(),
        });
    }
    let grads = duals
        .into_iter()
        .zip(dxs)
        .map(|(x, dx)| Tangent::from_parts(&tangent_type(&x.primal.ty()), x.tangent, dx))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((value, grads))
}

#[cfg(test)]
mod testing;
