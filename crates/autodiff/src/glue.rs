use crate::{
    capture::Capture,
    compile::{AugmentedRegister, ForwardUnit, Reg, ReverseUnit},
    ir::CaptureShape,
    stack::{BlockTag, TangentStack},
    tangent::{is_differentiable, CoDual, RData, Tangent},
    Error, Pullback, Rule,
};
use rewind::{Signature, Type};
use std::rc::Rc;

/// A rule built from a function's IR.
///
/// A rule that calls itself, directly or through other derived rules, holds a reference to
/// itself through its capture shape and is never freed.
pub struct DerivedRule {
    sig: Signature,
    params: Vec<Type>,
    fwd: ForwardUnit,
    rev: Rc<ReverseUnit>,
    shape: CaptureShape,
    sentinel: BlockTag,
}

impl DerivedRule {
    pub(crate) fn new(
        sig: Signature,
        params: Vec<Type>,
        fwd: ForwardUnit,
        rev: ReverseUnit,
        shape: CaptureShape,
        sentinel: BlockTag,
    ) -> Self {
        DerivedRule {
            sig,
            params,
            fwd,
            rev: Rc::new(rev),
            shape,
            sentinel,
        }
    }

    pub fn signature(&self) -> &Signature {
        &self.sig
    }
}

impl Rule for DerivedRule {
    fn call(&self, args: &[CoDual]) -> Result<(CoDual, Pullback), Error> {
        if args.len() != self.params.len() {
            return Err(Error::Arity {
                sig: self.sig.to_string(),
                expected: self.params.len(),
                got: args.len(),
            });
        }

        let mut capture = Capture::new(&self.shape);
        let mut arg_stacks = Vec::with_capacity(args.len());
        let mut regs = Vec::with_capacity(args.len());
        for (arg, ty) in args.iter().zip(&self.params) {
            let mut stack = TangentStack::new();
            let cell = stack.push_tangent(Tangent::seed(&arg.primal, arg.tangent.clone())?);
            regs.push(if is_differentiable(ty) {
                Reg::Aug(AugmentedRegister {
                    primal: arg.primal.clone(),
                    cell,
                })
            } else {
                Reg::Plain(arg.primal.clone())
            });
            arg_stacks.push(stack);
        }

        capture.blocks.push(self.sentinel);
        let (y, out) = match self.fwd.run(&regs, &mut capture)? {
            Reg::Aug(a) => (a.codual(), Some(a.cell)),
            Reg::Plain(x) => (CoDual::zero(x), None),
        };

        let rev = Rc::clone(&self.rev);
        let pullback: Pullback = Box::new(move |dy: RData| -> Result<Vec<RData>, Error> {
            if let Some(cell) = &out {
                cell.borrow_mut().increment_rdata(&dy)?;
            }
            rev.run(&mut capture)?;
            let mut dxs = Vec::with_capacity(arg_stacks.len());
            for stack in &mut arg_stacks {
                let cell = stack.pop()?;
                let dx = cell.borrow().rdata();
                dxs.push(dx);
            }
            capture.assert_drained()?;
            Ok(dxs)
        });
        Ok((y, pullback))
    }
}
