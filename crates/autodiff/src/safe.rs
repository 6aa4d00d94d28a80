use crate::{
    tangent::{check_fdata, check_rdata},
    CoDual, Error, Pullback, RData, Rule, RuleRef,
};
use rewind::{Signature, Val};

/// Wraps a rule and checks every value crossing its boundary.
///
/// Arguments and the result must carry forward data of the shape their primal requires, and the
/// pullback must return exactly one well-shaped reverse datum per argument.
pub struct SafeRule {
    inner: RuleRef,
    sig: Signature,
}

impl SafeRule {
    pub fn new(inner: RuleRef, sig: Signature) -> Self {
        SafeRule { inner, sig }
    }
}

fn mismatch(what: String, msg: String) -> Error {
    Error::TangentType(format!("{what}: {msg}"))
}

impl Rule for SafeRule {
    fn call(&self, args: &[CoDual]) -> Result<(CoDual, Pullback), Error> {
        if args.len() != self.sig.args.len() {
            return Err(Error::Arity {
                sig: self.sig.to_string(),
                expected: self.sig.args.len(),
                got: args.len(),
            });
        }
        for (i, (arg, ty)) in args.iter().zip(&self.sig.args).enumerate() {
            let actual = arg.primal.ty();
            if !ty.admits(&actual) {
                return Err(mismatch(
                    format!("argument {i} of {}", self.sig),
                    format!("expected {ty}, got {actual}"),
                ));
            }
            check_fdata(&arg.primal, &arg.tangent)
                .map_err(|msg| mismatch(format!("argument {i} of {}", self.sig), msg))?;
        }

        let (y, pullback) = self.inner.call(args)?;
        check_fdata(&y.primal, &y.tangent)
            .map_err(|msg| mismatch(format!("result of {}", self.sig), msg))?;

        let primals: Vec<Val> = args.iter().map(|arg| arg.primal.clone()).collect();
        let result = y.primal.clone();
        let sig = self.sig.clone();
        let checked: Pullback = Box::new(move |dy: RData| -> Result<Vec<RData>, Error> {
            check_rdata(&result, &dy)
                .map_err(|msg| mismatch(format!("reverse seed of {sig}"), msg))?;
            let dxs = pullback(dy)?;
            if dxs.len() != primals.len() {
                return Err(Error::PullbackArity {
                    context: sig.to_string(),
                    expected: primals.len(),
                    got: dxs.len(),
                });
            }
            for (i, (x, dx)) in primals.iter().zip(&dxs).enumerate() {
                check_rdata(x, dx).map_err(|msg| {
                    mismatch(format!("reverse data for argument {i} of {sig}"), msg)
                })?;
            }
            Ok(dxs)
        });
        Ok((y, checked))
    }
}
