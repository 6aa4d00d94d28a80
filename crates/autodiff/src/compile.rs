//! Executable forms of the forward and reverse programs.
//!
//! Each statement becomes a boxed closure ahead of time, so running a derived rule never looks at
//! the IR again.

use crate::{
    alloc::Slot,
    capture::{Capture, Payload},
    ir::{FwdFunction, FwdInstr, FwdOperand, FwdStmt, RevFunction, RevStmt, RevTarget},
    stack::{BlockTag, TangentCell},
    tangent::{is_differentiable, zero_tangent, CoDual, Tangent},
    Error,
};
use rewind::{id, Type, Val};
use rewind_interp::Error as PrimalError;
use std::{cell::RefCell, rc::Rc};

/// A differentiable value together with the storage its tangent accumulates into.
#[derive(Clone, Debug)]
pub(crate) struct AugmentedRegister {
    pub(crate) primal: Val,
    pub(crate) cell: TangentCell,
}

impl AugmentedRegister {
    pub(crate) fn codual(&self) -> CoDual {
        let fdata = self.cell.borrow().fdata();
        CoDual::new(self.primal.clone(), fdata)
    }
}

#[derive(Clone, Debug)]
pub(crate) enum Reg {
    Aug(AugmentedRegister),
    Plain(Val),
}

impl Reg {
    pub(crate) fn primal(&self) -> &Val {
        match self {
            Reg::Aug(a) => &a.primal,
            Reg::Plain(x) => x,
        }
    }

    /// A register for a value that no one accumulates gradients for.
    fn detached(val: Val) -> Self {
        if is_differentiable(&val.ty()) {
            let cell = Rc::new(RefCell::new(zero_tangent(&val)));
            Reg::Aug(AugmentedRegister { primal: val, cell })
        } else {
            Reg::Plain(val)
        }
    }

    fn into_parts(self) -> (Val, Option<TangentCell>) {
        match self {
            Reg::Aug(a) => (a.primal, Some(a.cell)),
            Reg::Plain(x) => (x, None),
        }
    }
}

fn not_a(slot: Slot, what: &str) -> Error {
    Error::Malformed(format!("slot {} does not hold a {what}", slot.slot()))
}

enum Flow {
    Next,
    Jump(id::Block),
    Return(Reg),
}

struct Frame<'a> {
    args: &'a [Reg],
    regs: Vec<Option<Reg>>,
    capture: &'a mut Capture,
    prev: Option<id::Block>,
    /// Phi results of the current block, set together once every edge has been read.
    staged: Vec<(Option<id::Var>, Reg)>,
}

impl Frame<'_> {
    fn operand(&self, op: &FwdOperand) -> Result<Reg, Error> {
        match op {
            FwdOperand::Arg(a) => self
                .args
                .get(a.arg())
                .cloned()
                .ok_or(Error::Primal(PrimalError::BadArg(a.arg()))),
            FwdOperand::Var(v) => self
                .regs
                .get(v.var())
                .cloned()
                .flatten()
                .ok_or(Error::Primal(PrimalError::UnsetVar(v.var()))),
            FwdOperand::Const(val) => Ok(Reg::detached(val.clone())),
        }
    }

    fn set(&mut self, var: Option<id::Var>, reg: Reg) {
        if let Some(slot) = var.and_then(|v| self.regs.get_mut(v.var())) {
            *slot = Some(reg);
        }
    }

    fn call(
        &mut self,
        slot: Slot,
        args: &[FwdOperand],
        differentiable: bool,
    ) -> Result<Reg, Error> {
        let regs = args
            .iter()
            .map(|arg| self.operand(arg))
            .collect::<Result<Vec<_>, _>>()?;
        let Payload::Call {
            rule,
            pullbacks,
            result,
            args: refs,
        } = self.capture.payload(slot)?
        else {
            return Err(not_a(slot, "call"));
        };
        if refs.len() != regs.len() {
            return Err(Error::Malformed(format!(
                "call in slot {} has {} arguments, expected {}",
                slot.slot(),
                regs.len(),
                refs.len()
            )));
        }

        let mut duals = Vec::with_capacity(regs.len());
        for (reg, stack) in regs.into_iter().zip(refs.iter_mut()) {
            match reg {
                Reg::Aug(a) => {
                    duals.push(a.codual());
                    stack.push(Some(a.cell));
                }
                Reg::Plain(x) => {
                    duals.push(CoDual::zero(x));
                    stack.push(None);
                }
            }
        }

        let (y, pullback) = rule.call(&duals)?;
        let cell = result.push_tangent(Tangent::seed(&y.primal, y.tangent)?);
        pullbacks.push(pullback);
        Ok(if differentiable {
            Reg::Aug(AugmentedRegister {
                primal: y.primal,
                cell,
            })
        } else {
            Reg::Plain(y.primal)
        })
    }

    fn constant(&mut self, slot: Slot) -> Result<Reg, Error> {
        let Payload::Const { codual, stack } = self.capture.payload(slot)? else {
            return Err(not_a(slot, "constant"));
        };
        let cell = stack.push_tangent(Tangent::seed(&codual.primal, codual.tangent.clone())?);
        Ok(Reg::Aug(AugmentedRegister {
            primal: codual.primal.clone(),
            cell,
        }))
    }

    fn pi(
        &mut self,
        val: &FwdOperand,
        ty: &Type,
        slot: Slot,
        differentiable: bool,
    ) -> Result<Reg, Error> {
        let reg = self.operand(val)?;
        let actual = reg.primal().ty();
        if !ty.admits(&actual) {
            return Err(Error::Primal(PrimalError::Sharpen {
                expected: ty.clone(),
                actual,
            }));
        }
        let Payload::Pi { sharpened, refs } = self.capture.payload(slot)? else {
            return Err(not_a(slot, "narrowing"));
        };
        let (primal, original) = reg.into_parts();
        let fdata = match &original {
            Some(cell) => cell.borrow().fdata(),
            None => zero_tangent(&primal).fdata(),
        };
        let cell = sharpened.push_tangent(Tangent::seed(&primal, fdata)?);
        refs.push(original.as_ref().map_or_else(Default::default, Rc::downgrade));
        Ok(if differentiable {
            Reg::Aug(AugmentedRegister { primal, cell })
        } else {
            Reg::Plain(primal)
        })
    }
}

type FwdStep = Box<dyn Fn(&mut Frame<'_>) -> Result<Flow, Error>>;

fn commit_phis() -> FwdStep {
    Box::new(|fr: &mut Frame<'_>| -> Result<Flow, Error> {
        for (var, reg) in std::mem::take(&mut fr.staged) {
            fr.set(var, reg);
        }
        Ok(Flow::Next)
    })
}

fn forward_step(b: id::Block, instr: &FwdInstr) -> FwdStep {
    let var = instr.var;
    match instr.stmt.clone() {
        FwdStmt::Nop => Box::new(move |fr: &mut Frame<'_>| -> Result<Flow, Error> {
            fr.set(var, Reg::Plain(Val::Nothing));
            Ok(Flow::Next)
        }),
        FwdStmt::Copy { val } => Box::new(move |fr: &mut Frame<'_>| -> Result<Flow, Error> {
            fr.set(var, Reg::Plain(val.clone()));
            Ok(Flow::Next)
        }),
        FwdStmt::Goto { target } => Box::new(move |_: &mut Frame<'_>| -> Result<Flow, Error> {
            Ok(Flow::Jump(target))
        }),
        FwdStmt::GotoIfNot { cond, target } => {
            let next = id::block(b.block() + 1);
            Box::new(move |fr: &mut Frame<'_>| -> Result<Flow, Error> {
                match fr.operand(&cond)?.primal() {
                    Val::Bool(true) => Ok(Flow::Jump(next)),
                    Val::Bool(false) => Ok(Flow::Jump(target)),
                    val => Err(Error::Primal(PrimalError::Condition(val.ty()))),
                }
            })
        }
        FwdStmt::Return { val } => {
            Box::new(move |fr: &mut Frame<'_>| -> Result<Flow, Error> {
                Ok(Flow::Return(fr.operand(&val)?))
            })
        }
        FwdStmt::Phi { edges } => Box::new(move |fr: &mut Frame<'_>| -> Result<Flow, Error> {
            let from = fr
                .prev
                .ok_or(Error::Primal(PrimalError::PhiEntry(b.block())))?;
            let (_, val) = edges.iter().find(|(e, _)| *e == from).ok_or(Error::Primal(
                PrimalError::PhiEdge {
                    block: b.block(),
                    from: from.block(),
                },
            ))?;
            let reg = fr.operand(val)?;
            fr.staged.push((var, reg));
            Ok(Flow::Next)
        }),
        FwdStmt::Pi {
            val,
            ty,
            slot,
            differentiable,
        } => Box::new(move |fr: &mut Frame<'_>| -> Result<Flow, Error> {
            let reg = fr.pi(&val, &ty, slot, differentiable)?;
            fr.set(var, reg);
            Ok(Flow::Next)
        }),
        FwdStmt::Const { slot } => Box::new(move |fr: &mut Frame<'_>| -> Result<Flow, Error> {
            let reg = fr.constant(slot)?;
            fr.set(var, reg);
            Ok(Flow::Next)
        }),
        FwdStmt::Call {
            slot,
            args,
            differentiable,
        } => Box::new(move |fr: &mut Frame<'_>| -> Result<Flow, Error> {
            let reg = fr.call(slot, &args, differentiable)?;
            fr.set(var, reg);
            Ok(Flow::Next)
        }),
        FwdStmt::PushBlock { block } => Box::new(move |fr: &mut Frame<'_>| -> Result<Flow, Error> {
            fr.capture.blocks.push(BlockTag::Block(block));
            Ok(Flow::Next)
        }),
    }
}

pub(crate) struct ForwardUnit {
    nvars: usize,
    blocks: Vec<Vec<FwdStep>>,
}

impl ForwardUnit {
    pub(crate) fn new(f: &FwdFunction) -> Self {
        let blocks = f
            .blocks
            .iter()
            .enumerate()
            .map(|(i, block)| {
                let phis = block
                    .code
                    .iter()
                    .take_while(|instr| matches!(instr.stmt, FwdStmt::Phi { .. }))
                    .count();
                let mut steps: Vec<FwdStep> = Vec::with_capacity(block.code.len() + 1);
                for (j, instr) in block.code.iter().enumerate() {
                    if j == phis && phis > 0 {
                        steps.push(commit_phis());
                    }
                    steps.push(forward_step(id::block(i), instr));
                }
                steps
            })
            .collect();
        ForwardUnit {
            nvars: f.vars.len(),
            blocks,
        }
    }

    pub(crate) fn run(&self, args: &[Reg], capture: &mut Capture) -> Result<Reg, Error> {
        let mut frame = Frame {
            args,
            regs: vec![None; self.nvars],
            capture,
            prev: None,
            staged: vec![],
        };
        let mut cur = 0;
        loop {
            let steps = self
                .blocks
                .get(cur)
                .ok_or(Error::Primal(PrimalError::BadBlock(cur)))?;
            let mut next = None;
            for step in steps {
                match step(&mut frame)? {
                    Flow::Next => {}
                    Flow::Jump(target) => {
                        next = Some(target);
                        break;
                    }
                    Flow::Return(reg) => return Ok(reg),
                }
            }
            let next =
                next.ok_or_else(|| Error::Malformed(format!("block {cur} has no terminator")))?;
            frame.prev = Some(id::block(cur));
            cur = next.block();
        }
    }
}

enum RevFlow {
    Next,
    Jump(id::Block),
    Exit,
}

struct RevFrame<'a> {
    capture: &'a mut Capture,
    /// Tag popped on entry to the current block.
    popped: Option<BlockTag>,
}

fn reverse_call(capture: &mut Capture, slot: Slot) -> Result<(), Error> {
    let Payload::Call {
        pullbacks,
        result,
        args,
        ..
    } = capture.payload(slot)?
    else {
        return Err(not_a(slot, "call"));
    };
    let cell = result.pop()?;
    let pullback = pullbacks.pop()?;
    let refs = args
        .iter_mut()
        .map(|stack| stack.pop())
        .collect::<Result<Vec<_>, _>>()?;
    let dy = cell.borrow().rdata();
    let dxs = pullback(dy)?;
    if dxs.len() != refs.len() {
        return Err(Error::PullbackArity {
            context: format!("the call in slot {}", slot.slot()),
            expected: refs.len(),
            got: dxs.len(),
        });
    }
    for (r, dx) in refs.into_iter().zip(&dxs) {
        if let Some(r) = r {
            r.borrow_mut().increment_rdata(dx)?;
        }
    }
    Ok(())
}

fn reverse_constant(capture: &mut Capture, slot: Slot) -> Result<(), Error> {
    let Payload::Const { stack, .. } = capture.payload(slot)? else {
        return Err(not_a(slot, "constant"));
    };
    stack.pop()?;
    Ok(())
}

fn reverse_pi(capture: &mut Capture, slot: Slot) -> Result<(), Error> {
    let Payload::Pi { sharpened, refs } = capture.payload(slot)? else {
        return Err(not_a(slot, "narrowing"));
    };
    let cell = sharpened.pop()?;
    let original = refs.pop()?;
    if let Some(original) = original.upgrade() {
        let dx = cell.borrow().rdata();
        original.borrow_mut().increment_rdata(&dx)?;
    }
    Ok(())
}

type RevStep = Box<dyn Fn(&mut RevFrame<'_>) -> Result<RevFlow, Error>>;

fn reverse_step(stmt: RevStmt) -> RevStep {
    match stmt {
        RevStmt::PopBlock => Box::new(|fr: &mut RevFrame<'_>| -> Result<RevFlow, Error> {
            fr.popped = Some(fr.capture.blocks.pop()?);
            Ok(RevFlow::Next)
        }),
        RevStmt::Call { slot } => Box::new(move |fr: &mut RevFrame<'_>| -> Result<RevFlow, Error> {
            reverse_call(fr.capture, slot)?;
            Ok(RevFlow::Next)
        }),
        RevStmt::Const { slot } => Box::new(move |fr: &mut RevFrame<'_>| -> Result<RevFlow, Error> {
            reverse_constant(fr.capture, slot)?;
            Ok(RevFlow::Next)
        }),
        RevStmt::Pi { slot } => Box::new(move |fr: &mut RevFrame<'_>| -> Result<RevFlow, Error> {
            reverse_pi(fr.capture, slot)?;
            Ok(RevFlow::Next)
        }),
    }
}

fn flow(target: RevTarget) -> RevFlow {
    match target {
        RevTarget::Block(b) => RevFlow::Jump(b),
        RevTarget::Exit => RevFlow::Exit,
    }
}

fn dispatch(b: id::Block, candidates: &[(BlockTag, RevTarget)]) -> RevStep {
    let mut tests = candidates.to_vec();
    let fallback = tests.pop();
    Box::new(move |fr: &mut RevFrame<'_>| -> Result<RevFlow, Error> {
        let tag = fr.popped.take().ok_or_else(|| {
            Error::Malformed(format!("reversed block {} did not pop a tag", b.block()))
        })?;
        for &(candidate, target) in &tests {
            if tag == candidate {
                return Ok(flow(target));
            }
        }
        match fallback {
            Some((_, target)) => Ok(flow(target)),
            None => Err(Error::Malformed(format!(
                "reversed block {} has nowhere to go",
                b.block()
            ))),
        }
    })
}

pub(crate) struct ReverseUnit {
    exit: id::Block,
    blocks: Vec<Vec<RevStep>>,
}

impl ReverseUnit {
    pub(crate) fn new(f: &RevFunction) -> Self {
        let blocks = f
            .blocks
            .iter()
            .enumerate()
            .map(|(i, block)| {
                let mut steps: Vec<RevStep> = block.code.iter().copied().map(reverse_step).collect();
                steps.push(dispatch(id::block(i), &block.dispatch));
                steps
            })
            .collect();
        ReverseUnit {
            exit: f.exit,
            blocks,
        }
    }

    pub(crate) fn run(&self, capture: &mut Capture) -> Result<(), Error> {
        let mut frame = RevFrame {
            capture,
            popped: None,
        };
        let mut cur = self.exit.block();
        loop {
            let steps = self
                .blocks
                .get(cur)
                .ok_or_else(|| Error::Malformed(format!("reversed block {cur} does not exist")))?;
            let mut next = None;
            for step in steps {
                match step(&mut frame)? {
                    RevFlow::Next => {}
                    RevFlow::Jump(target) => {
                        next = Some(target);
                        break;
                    }
                    RevFlow::Exit => return Ok(()),
                }
            }
            let next = next.ok_or_else(|| {
                Error::Malformed(format!("reversed block {cur} did not dispatch"))
            })?;
            cur = next.block();
        }
    }
}
