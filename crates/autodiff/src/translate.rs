use crate::{
    alloc::Slot,
    context::Context,
    ir::{
        CaptureShape, FwdBlock, FwdFunction, FwdInstr, FwdOperand, FwdStmt, PayloadSpec,
        RevBlock, RevFunction, RevStmt, RevTarget,
    },
    stack::BlockTag,
    tangent::{is_differentiable, CoDual},
    Error,
};
use log::trace;
use rewind::{cfg, id, Call, Callee, Expr, Function, Instr, Operand, Signature, Val};

/// Everything one primal statement contributes to the derived rule.
#[derive(Debug, Default)]
pub struct Translation {
    pub fwd: Vec<FwdInstr>,
    pub rev: Option<RevStmt>,
    pub payload: Option<(Slot, PayloadSpec)>,
}

impl Translation {
    fn forward(var: id::Var, stmt: FwdStmt) -> Self {
        Translation {
            fwd: vec![FwdInstr {
                var: Some(var),
                stmt,
            }],
            rev: None,
            payload: None,
        }
    }
}

fn constant(point: id::Var, val: Val, ctx: &mut Context) -> Translation {
    if !is_differentiable(&val.ty()) {
        return Translation::forward(point, FwdStmt::Copy { val });
    }
    let slot = ctx.alloc.slot_for(point);
    Translation {
        fwd: vec![FwdInstr {
            var: Some(point),
            stmt: FwdStmt::Const { slot },
        }],
        rev: Some(RevStmt::Const { slot }),
        payload: Some((
            slot,
            PayloadSpec::Const {
                codual: CoDual::zero(val),
            },
        )),
    }
}

fn call(
    point: id::Var,
    callee: &Callee,
    args: &[Operand],
    ctx: &mut Context,
) -> Result<Translation, Error> {
    let types = args
        .iter()
        .map(|arg| ctx.type_of(arg))
        .collect::<Result<Vec<_>, _>>()?;
    let sig = Signature::new(callee.clone(), types);
    let rule = ctx.rules.rule_for(&sig)?;
    let slot = ctx.alloc.slot_for(point);
    let args = args
        .iter()
        .map(|arg| ctx.resolve(arg))
        .collect::<Result<Vec<_>, _>>()?;
    let differentiable = is_differentiable(ctx.var_type(point)?);
    Ok(Translation {
        fwd: vec![FwdInstr {
            var: Some(point),
            stmt: FwdStmt::Call {
                slot,
                args,
                differentiable,
            },
        }],
        rev: Some(RevStmt::Call { slot }),
        payload: Some((slot, PayloadSpec::Call { rule, sig })),
    })
}

/// Translate one primal statement into its forward statements, its reverse statement and the
/// payload it needs in the capture record.
pub fn translate(instr: &Instr, ctx: &mut Context) -> Result<Translation, Error> {
    let point = instr.var;
    let copy = |stmt| Translation::forward(point, stmt);
    match &instr.expr {
        Expr::Nop => Ok(copy(FwdStmt::Nop)),
        &Expr::Goto { target } => Ok(copy(FwdStmt::Goto { target })),
        Expr::GotoIfNot { cond, target } => Ok(copy(FwdStmt::GotoIfNot {
            cond: ctx.resolve(cond)?,
            target: *target,
        })),
        Expr::Return {
            val: Operand::Const(c),
        } => {
            let val = ctx.constant(c)?;
            let mut t = constant(point, val, ctx);
            t.fwd.push(FwdInstr {
                var: None,
                stmt: FwdStmt::Return {
                    val: FwdOperand::Var(point),
                },
            });
            Ok(t)
        }
        Expr::Return { val } => Ok(copy(FwdStmt::Return {
            val: ctx.resolve(val)?,
        })),
        Expr::Phi { edges } => {
            let edges = edges
                .iter()
                .map(|(b, val)| ctx.resolve(val).map(|val| (*b, val)))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(copy(FwdStmt::Phi { edges }))
        }
        Expr::Pi { val, ty } => {
            let slot = ctx.alloc.slot_for(point);
            Ok(Translation {
                fwd: vec![FwdInstr {
                    var: Some(point),
                    stmt: FwdStmt::Pi {
                        val: ctx.resolve(val)?,
                        ty: ty.clone(),
                        slot,
                        differentiable: is_differentiable(ty),
                    },
                }],
                rev: Some(RevStmt::Pi { slot }),
                payload: Some((slot, PayloadSpec::Pi { ty: ty.clone() })),
            })
        }
        Expr::Const { val } => {
            let val = ctx.constant(val)?;
            Ok(constant(point, val, ctx))
        }
        Expr::Call {
            call: Call::Dynamic { .. },
        } => Err(Error::DynamicDispatch { point: point.var() }),
        Expr::Call {
            call: Call::Static { callee, args },
        } => call(point, callee, args, ctx),
        Expr::BoundsCheck => Ok(copy(FwdStmt::Copy {
            val: Val::Bool(true),
        })),
        Expr::Meta { .. } => Ok(copy(FwdStmt::Copy { val: Val::Nothing })),
        Expr::Unsupported { name } => Err(Error::UnsupportedStmt {
            point: point.var(),
            name: name.to_string(),
        }),
    }
}

/// Translate a normalized function into forward and reverse programs sharing one capture shape.
pub(crate) fn translate_function(
    ctx: &mut Context,
    f: &Function,
) -> Result<(FwdFunction, RevFunction, CaptureShape), Error> {
    let exit = match cfg::exits(f).as_slice() {
        &[exit] => exit,
        exits => {
            return Err(Error::Malformed(format!(
                "expected one exit block, found {}",
                exits.len()
            )))
        }
    };
    let preds = cfg::predecessors(f);

    let mut slots: Vec<Option<PayloadSpec>> = vec![];
    let mut fwd_blocks = Vec::with_capacity(f.blocks.len());
    let mut rev_blocks = Vec::with_capacity(f.blocks.len());
    for (i, block) in f.blocks.iter().enumerate() {
        let b = id::block(i);
        let mut fwd = vec![];
        let mut rev = vec![];
        for instr in &block.code {
            if instr.expr.is_terminator() && b != exit {
                fwd.push(FwdInstr {
                    var: None,
                    stmt: FwdStmt::PushBlock { block: b },
                });
            }
            let t = translate(instr, ctx)?;
            trace!("x{} {:?} => {:?}", instr.var.var(), instr.expr, t.fwd);
            fwd.extend(t.fwd);
            rev.extend(t.rev);
            if let Some((slot, spec)) = t.payload {
                let i = slot.slot();
                if slots.len() <= i {
                    slots.resize_with(i + 1, || None);
                }
                slots[i] = Some(spec);
            }
        }

        let mut code = vec![RevStmt::PopBlock];
        code.extend(rev.into_iter().rev());
        let mut dispatch: Vec<(BlockTag, RevTarget)> = preds[i]
            .iter()
            .map(|&p| (BlockTag::Block(p), RevTarget::Block(p)))
            .collect();
        if b == f.entry() {
            dispatch.push((ctx.sentinel, RevTarget::Exit));
        }
        fwd_blocks.push(FwdBlock { code: fwd });
        rev_blocks.push(RevBlock { code, dispatch });
    }

    let slots = slots
        .into_iter()
        .enumerate()
        .map(|(i, spec)| spec.ok_or_else(|| Error::Malformed(format!("slot {i} has no payload"))))
        .collect::<Result<Vec<_>, _>>()?;
    let fwd = FwdFunction {
        params: ctx.params().to_vec(),
        vars: ctx.vars().to_vec(),
        blocks: fwd_blocks,
    };
    let rev = RevFunction {
        exit,
        blocks: rev_blocks,
    };
    Ok((fwd, rev, CaptureShape { slots }))
}
