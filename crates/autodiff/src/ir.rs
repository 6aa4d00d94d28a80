//! The forward and reverse programs produced from a primal function.

use crate::{alloc::Slot, stack::BlockTag, tangent::CoDual, RuleRef};
use rewind::{id, Signature, Type, Val};
use std::fmt;

#[derive(Clone, Debug, PartialEq)]
pub enum FwdOperand {
    Arg(id::Arg),
    Var(id::Var),
    /// Resolved at build time; carries no tangent storage.
    Const(Val),
}

#[derive(Clone, Debug, PartialEq)]
pub enum FwdStmt {
    Nop,
    Goto {
        target: id::Block,
    },
    GotoIfNot {
        cond: FwdOperand,
        target: id::Block,
    },
    Return {
        val: FwdOperand,
    },
    Phi {
        edges: Vec<(id::Block, FwdOperand)>,
    },
    Pi {
        val: FwdOperand,
        ty: Type,
        slot: Slot,
        differentiable: bool,
    },
    Const {
        slot: Slot,
    },
    Call {
        slot: Slot,
        args: Vec<FwdOperand>,
        differentiable: bool,
    },
    /// A value with no tangent and nothing to record.
    Copy {
        val: Val,
    },
    PushBlock {
        block: id::Block,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct FwdInstr {
    /// `None` for bookkeeping statements that have no primal counterpart.
    pub var: Option<id::Var>,
    pub stmt: FwdStmt,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FwdBlock {
    pub code: Vec<FwdInstr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FwdFunction {
    pub params: Vec<Type>,
    pub vars: Vec<Type>,
    pub blocks: Vec<FwdBlock>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RevStmt {
    PopBlock,
    Call { slot: Slot },
    Const { slot: Slot },
    Pi { slot: Slot },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RevTarget {
    Block(id::Block),
    Exit,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RevBlock {
    pub code: Vec<RevStmt>,
    /// Tested in order against the popped tag; the last entry is taken if nothing matches.
    pub dispatch: Vec<(BlockTag, RevTarget)>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RevFunction {
    /// Where the reverse program starts.
    pub exit: id::Block,
    pub blocks: Vec<RevBlock>,
}

/// What to allocate in a fresh capture record for one slot.
#[derive(Clone)]
pub enum PayloadSpec {
    Call { rule: RuleRef, sig: Signature },
    /// Built once per derived rule and shared by every call of it. A `Vector` constant's
    /// tangent is a single buffer, so whatever a caller writes into it is still there on the
    /// next call.
    Const { codual: CoDual },
    Pi { ty: Type },
}

impl fmt::Debug for PayloadSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadSpec::Call { sig, .. } => write!(f, "Call({sig})"),
            PayloadSpec::Const { codual } => write!(f, "Const({:?})", codual.primal),
            PayloadSpec::Pi { ty } => write!(f, "Pi({ty})"),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CaptureShape {
    pub slots: Vec<PayloadSpec>,
}

impl fmt::Display for FwdOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FwdOperand::Arg(a) => write!(f, "arg{}", a.arg()),
            FwdOperand::Var(v) => write!(f, "x{}", v.var()),
            FwdOperand::Const(val) => write!(f, "{val:?}"),
        }
    }
}

impl fmt::Display for FwdFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, block) in self.blocks.iter().enumerate() {
            writeln!(f, "b{i}:")?;
            for instr in &block.code {
                write!(f, "  ")?;
                if let Some(v) = instr.var {
                    match self.vars.get(v.var()) {
                        Some(ty) => write!(f, "x{}: {ty} = ", v.var())?,
                        None => write!(f, "x{} = ", v.var())?,
                    }
                }
                match &instr.stmt {
                    FwdStmt::Nop => writeln!(f, "nop")?,
                    FwdStmt::Goto { target } => writeln!(f, "goto b{}", target.block())?,
                    FwdStmt::GotoIfNot { cond, target } => {
                        writeln!(f, "goto b{} if not {cond}", target.block())?
                    }
                    FwdStmt::Return { val } => writeln!(f, "return {val}")?,
                    FwdStmt::Phi { edges } => {
                        write!(f, "phi")?;
                        for (b, val) in edges {
                            write!(f, " b{}:{val}", b.block())?;
                        }
                        writeln!(f)?
                    }
                    FwdStmt::Pi { val, ty, slot, .. } => {
                        writeln!(f, "pi {val} as {ty} [{}]", slot.slot())?
                    }
                    FwdStmt::Const { slot } => writeln!(f, "const [{}]", slot.slot())?,
                    FwdStmt::Call { slot, args, .. } => {
                        write!(f, "call [{}](", slot.slot())?;
                        for (j, arg) in args.iter().enumerate() {
                            if j > 0 {
                                write!(f, ", ")?;
                            }
                            write!(f, "{arg}")?;
                        }
                        writeln!(f, ")")?
                    }
                    FwdStmt::Copy { val } => writeln!(f, "{val:?}")?,
                    FwdStmt::PushBlock { block } => writeln!(f, "push b{}", block.block())?,
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for RevFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "entry: goto b{}", self.exit.block())?;
        for (i, block) in self.blocks.iter().enumerate() {
            writeln!(f, "b{i}:")?;
            for stmt in &block.code {
                match stmt {
                    RevStmt::PopBlock => writeln!(f, "  pop")?,
                    RevStmt::Call { slot } => writeln!(f, "  pullback [{}]", slot.slot())?,
                    RevStmt::Const { slot } => writeln!(f, "  drop [{}]", slot.slot())?,
                    RevStmt::Pi { slot } => writeln!(f, "  unsharpen [{}]", slot.slot())?,
                }
            }
            for (tag, target) in &block.dispatch {
                let tag = match tag {
                    BlockTag::Sentinel(_) => "entry".to_string(),
                    BlockTag::Block(b) => format!("b{}", b.block()),
                };
                match target {
                    RevTarget::Block(b) => writeln!(f, "  {tag} => goto b{}", b.block())?,
                    RevTarget::Exit => writeln!(f, "  {tag} => exit")?,
                }
            }
        }
        Ok(())
    }
}
