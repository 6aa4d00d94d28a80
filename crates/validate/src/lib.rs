use rewind::{cfg, id, Call, Const, Expr, Function, Instr, Operand, Type};

#[derive(Debug, thiserror::Error)]
pub enum InstrError {
    #[error("variable ID is out of range")]
    InvalidVar,

    #[error("variable was already declared")]
    Redeclare,

    #[error("argument {0} is out of range")]
    InvalidArg(usize),

    #[error("variable {0} is never defined")]
    UndefinedVar(usize),

    #[error("jump target {0} is out of range")]
    InvalidTarget(usize),

    #[error("terminator is not the last instruction of its block")]
    EarlyTerminator,

    #[error("phi follows a non-phi instruction")]
    LatePhi,

    #[error("phi has an edge from block {0}, which is not a predecessor")]
    PhiEdge(usize),

    #[error("phi has no edge from predecessor {0}")]
    PhiMissingEdge(usize),

    #[error("conditional branch has no block to fall through to")]
    NoFallthrough,

    #[error("narrowed type {narrow} does not match the declared type {declared}")]
    PiType { narrow: Type, declared: Type },

    #[error("branch condition has type {0}, expected Bool")]
    ConditionType(Type),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("function has no blocks")]
    NoBlocks,

    #[error("block {0} is empty")]
    EmptyBlock(usize),

    #[error("block {0} falls off the end of the function")]
    FallsOffEnd(usize),

    #[error("instruction {index} of block {block} is invalid")]
    InvalidInstr {
        block: usize,
        index: usize,
        #[source]
        source: InstrError,
    },
}

fn check(p: bool, e: InstrError) -> Result<(), InstrError> {
    if p {
        Ok(())
    } else {
        Err(e)
    }
}

struct Validator<'a> {
    f: &'a Function,
    preds: Vec<Vec<id::Block>>,
    /// same length as `self.f.vars`
    defined: Vec<bool>,
}

impl Validator<'_> {
    fn operand(&self, op: &Operand) -> Result<(), InstrError> {
        match op {
            Operand::Arg(a) => check(a.arg() < self.f.params.len(), InstrError::InvalidArg(a.arg())),
            Operand::Var(v) => match self.defined.get(v.var()) {
                Some(true) => Ok(()),
                _ => Err(InstrError::UndefinedVar(v.var())),
            },
            Operand::Const(_) => Ok(()),
        }
    }

    /// Type of an operand, if it can be known without a provider.
    fn ty(&self, op: &Operand) -> Option<Type> {
        match op {
            Operand::Arg(a) => self.f.params.get(a.arg()).cloned(),
            Operand::Var(v) => self.f.vars.get(v.var()).cloned(),
            Operand::Const(Const::Literal(val) | Const::Quoted(val)) => Some(val.ty()),
            Operand::Const(Const::Global(_)) => None,
        }
    }

    fn target(&self, b: id::Block) -> Result<(), InstrError> {
        check(
            b.block() < self.f.blocks.len(),
            InstrError::InvalidTarget(b.block()),
        )
    }

    fn instr(&self, b: id::Block, instr: &Instr) -> Result<(), InstrError> {
        use InstrError::*;

        match &instr.expr {
            Expr::Nop | Expr::BoundsCheck | Expr::Meta { .. } | Expr::Unsupported { .. } => Ok(()),
            Expr::Const { .. } => Ok(()),
            &Expr::Goto { target } => self.target(target),
            Expr::GotoIfNot { cond, target } => {
                self.operand(cond)?;
                self.target(*target)?;
                check(b.block() + 1 < self.f.blocks.len(), NoFallthrough)?;
                match self.ty(cond) {
                    Some(ty) if !Type::Bool.admits(&ty) && ty != Type::Any => {
                        Err(ConditionType(ty))
                    }
                    _ => Ok(()),
                }
            }
            Expr::Return { val } => self.operand(val),
            Expr::Phi { edges } => {
                let preds = &self.preds[b.block()];
                for (from, val) in edges {
                    check(preds.contains(from), PhiEdge(from.block()))?;
                    self.operand(val)?;
                }
                for pred in preds {
                    check(
                        edges.iter().any(|(from, _)| from == pred),
                        PhiMissingEdge(pred.block()),
                    )?;
                }
                Ok(())
            }
            Expr::Pi { val, ty } => {
                self.operand(val)?;
                let declared = self.f.ty(instr.var);
                check(
                    declared == ty,
                    PiType {
                        narrow: ty.clone(),
                        declared: declared.clone(),
                    },
                )
            }
            Expr::Call { call } => {
                let args = match call {
                    Call::Static { args, .. } => args,
                    Call::Dynamic { callee, args } => {
                        self.operand(callee)?;
                        args
                    }
                };
                args.iter().try_for_each(|arg| self.operand(arg))
            }
        }
    }
}

/// Check that `f` is well-formed: every block ends in a terminator or falls through to a next
/// block, jump targets exist, every program point is defined exactly once, phis come first in
/// their block and have exactly one edge per predecessor.
pub fn validate(f: &Function) -> Result<(), Error> {
    if f.blocks.is_empty() {
        return Err(Error::NoBlocks);
    }

    let invalid = |block: usize, index: usize, source: InstrError| Error::InvalidInstr {
        block,
        index,
        source,
    };

    let mut defined = vec![false; f.vars.len()];
    for (i, block) in f.blocks.iter().enumerate() {
        let last = block.code.last().ok_or(Error::EmptyBlock(i))?;
        if i + 1 == f.blocks.len()
            && !matches!(last.expr, Expr::Goto { .. } | Expr::Return { .. })
        {
            return Err(Error::FallsOffEnd(i));
        }
        let mut phis = true;
        for (j, instr) in block.code.iter().enumerate() {
            match defined.get_mut(instr.var.var()) {
                None => return Err(invalid(i, j, InstrError::InvalidVar)),
                Some(true) => return Err(invalid(i, j, InstrError::Redeclare)),
                Some(seen) => *seen = true,
            }
            if instr.expr.is_terminator() && j + 1 != block.code.len() {
                return Err(invalid(i, j, InstrError::EarlyTerminator));
            }
            match instr.expr {
                Expr::Phi { .. } if !phis => return Err(invalid(i, j, InstrError::LatePhi)),
                Expr::Phi { .. } => {}
                _ => phis = false,
            }
        }
    }

    // predecessors are only meaningful once every target exists
    for (i, block) in f.blocks.iter().enumerate() {
        let j = block.code.len() - 1;
        if let Expr::Goto { target } | Expr::GotoIfNot { target, .. } = block.code[j].expr {
            if target.block() >= f.blocks.len() {
                return Err(invalid(i, j, InstrError::InvalidTarget(target.block())));
            }
        }
    }

    let validator = Validator {
        f,
        preds: cfg::predecessors(f),
        defined,
    };
    for (i, block) in f.blocks.iter().enumerate() {
        for (j, instr) in block.code.iter().enumerate() {
            validator
                .instr(id::block(i), instr)
                .map_err(|e| invalid(i, j, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind::{build::FunctionBuilder, Builtin, Callee, Val};

    #[test]
    fn test_valid_branch() {
        let mut b = FunctionBuilder::new(vec![Type::Bool, Type::F64], Type::F64);
        let then = b.block();
        let other = b.block();
        b.goto_if_not(b.arg(0), other);
        b.switch_to(then);
        b.ret(b.arg(1));
        b.switch_to(other);
        let y = b.call(Type::F64, Callee::Builtin(Builtin::Neg), vec![b.arg(1)]);
        b.ret(y);
        validate(&b.finish()).unwrap();
    }

    #[test]
    fn test_undefined_var() {
        let mut b = FunctionBuilder::new(vec![], Type::F64);
        b.ret(Operand::Var(id::var(7)));
        assert!(matches!(
            validate(&b.finish()),
            Err(Error::InvalidInstr {
                source: InstrError::UndefinedVar(7),
                ..
            })
        ));
    }

    #[test]
    fn test_early_terminator() {
        let mut b = FunctionBuilder::new(vec![], Type::F64);
        let next = b.block();
        b.ret(Operand::f64(1.));
        b.push(Type::Nothing, Expr::Nop);
        b.switch_to(next);
        b.ret(Operand::f64(2.));
        assert!(matches!(
            validate(&b.finish()),
            Err(Error::InvalidInstr {
                block: 0,
                index: 0,
                source: InstrError::EarlyTerminator,
            })
        ));
    }

    #[test]
    fn test_jump_out_of_range() {
        let mut b = FunctionBuilder::new(vec![], Type::F64);
        let next = b.block();
        b.goto(id::block(99));
        b.switch_to(next);
        b.ret(Operand::f64(2.));
        assert!(matches!(
            validate(&b.finish()),
            Err(Error::InvalidInstr {
                block: 0,
                index: 0,
                source: InstrError::InvalidTarget(99),
            })
        ));
    }

    #[test]
    fn test_phi_edge_from_non_predecessor() {
        let mut b = FunctionBuilder::new(vec![], Type::F64);
        let next = b.block();
        b.goto(next);
        b.switch_to(next);
        let phi = b.phi(Type::F64);
        b.ret(Operand::Var(phi));
        b.set_edges(
            phi,
            vec![
                (id::block(0), Operand::f64(1.)),
                (next, Operand::f64(2.)),
            ],
        );
        assert!(matches!(
            validate(&b.finish()),
            Err(Error::InvalidInstr {
                source: InstrError::PhiEdge(1),
                ..
            })
        ));
    }

    #[test]
    fn test_condition_type() {
        let mut b = FunctionBuilder::new(vec![], Type::F64);
        let next = b.block();
        b.goto_if_not(Operand::lit(Val::F64(0.)), next);
        b.switch_to(next);
        b.ret(Operand::f64(1.));
        assert!(matches!(
            validate(&b.finish()),
            Err(Error::InvalidInstr {
                source: InstrError::ConditionType(Type::F64),
                ..
            })
        ));
    }
}
