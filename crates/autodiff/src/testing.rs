//! A few scalar rules, enough to differentiate small functions in unit tests.

use crate::{zero_rdata, CoDual, Error, Pullback, RData, Registry, Rule, RuleCache, RuleRef};
use rewind::{Builtin, Callee, Signature, Val};
use rewind_interp::{eval_builtin, Module};
use std::rc::Rc;

struct Scalar(Builtin);

impl Rule for Scalar {
    fn call(&self, args: &[CoDual]) -> Result<(CoDual, Pullback), Error> {
        let xs: Vec<Val> = args.iter().map(|arg| arg.primal.clone()).collect();
        let y = eval_builtin(self.0, &xs)?;
        let pullback: Pullback = match (self.0, xs.as_slice()) {
            (Builtin::Add, _) => Box::new(|dy: RData| -> Result<Vec<RData>, Error> {
                Ok(vec![dy.clone(), dy])
            }),
            (Builtin::Mul, &[Val::F64(a), Val::F64(b)]) => {
                Box::new(move |dy: RData| -> Result<Vec<RData>, Error> {
                    let d = dy.f64().unwrap_or(0.);
                    Ok(vec![RData::F64(d * b), RData::F64(d * a)])
                })
            }
            _ => {
                let zeros: Vec<RData> = xs.iter().map(zero_rdata).collect();
                Box::new(move |_: RData| -> Result<Vec<RData>, Error> { Ok(zeros) })
            }
        };
        Ok((CoDual::zero(y), pullback))
    }
}

pub(crate) struct TestRules;

impl Registry for TestRules {
    fn lookup(&self, sig: &Signature) -> Option<RuleRef> {
        match sig.callee {
            Callee::Builtin(op) => Some(Rc::new(Scalar(op))),
            Callee::Func(_) => None,
        }
    }
}

pub(crate) fn cache(module: Module) -> RuleCache {
    RuleCache::new(Rc::new(module), Rc::new(TestRules))
}
