//! Control-flow queries over [`Function`] bodies.

use crate::{id, Block, Error, Expr, Function, Instr, Operand, Type};
use std::mem::replace;

/// Blocks that `b` may transfer control to, in the order the terminator lists them.
///
/// Targets outside the function are left out; [`bad_target`] finds them.
pub fn successors(f: &Function, b: id::Block) -> Vec<id::Block> {
    let i = b.block();
    let n = f.blocks.len();
    let next = (i + 1 < n).then(|| id::block(i + 1));
    let last = f.blocks.get(i).and_then(|block| block.code.last());
    let succs = match last.map(|instr| &instr.expr) {
        Some(&Expr::Goto { target }) => vec![target],
        Some(&Expr::GotoIfNot { target, .. }) => match next {
            Some(next) if next != target => vec![next, target],
            _ => vec![target],
        },
        Some(Expr::Return { .. }) => vec![],
        _ => next.into_iter().collect(),
    };
    succs.into_iter().filter(|t| t.block() < n).collect()
}

/// The first block whose terminator jumps outside the function, with that target.
pub fn bad_target(f: &Function) -> Option<(id::Block, id::Block)> {
    f.blocks.iter().enumerate().find_map(|(i, block)| {
        match block.code.last().map(|instr| &instr.expr) {
            Some(&Expr::Goto { target } | &Expr::GotoIfNot { target, .. })
                if target.block() >= f.blocks.len() =>
            {
                Some((id::block(i), target))
            }
            _ => None,
        }
    })
}

/// Predecessors of every block, each list without duplicates and ordered by block index.
pub fn predecessors(f: &Function) -> Vec<Vec<id::Block>> {
    let mut preds = vec![vec![]; f.blocks.len()];
    for i in 0..f.blocks.len() {
        let b = id::block(i);
        for succ in successors(f, b) {
            let list: &mut Vec<id::Block> = &mut preds[succ.block()];
            if !list.contains(&b) {
                list.push(b);
            }
        }
    }
    preds
}

/// Blocks that end in a return.
pub fn exits(f: &Function) -> Vec<id::Block> {
    f.blocks
        .iter()
        .enumerate()
        .filter(|(_, block)| {
            matches!(
                block.code.last(),
                Some(Instr {
                    expr: Expr::Return { .. },
                    ..
                })
            )
        })
        .map(|(i, _)| id::block(i))
        .collect()
}

/// Rewrite `f` so that every block ends in an explicit terminator and exactly one block returns.
///
/// Fall-through from a non-terminator becomes a `Goto`. If several blocks return, each of them
/// jumps instead to a fresh exit block which merges the returned values with a phi.
pub fn normalize(f: &Function) -> Result<Function, Error> {
    if let Some((block, target)) = bad_target(f) {
        return Err(Error::BadTarget {
            block: block.block(),
            target: target.block(),
        });
    }
    let mut g = f.clone();
    let n = g.blocks.len();
    for (i, block) in g.blocks.iter_mut().enumerate() {
        let last = block.code.last().ok_or(Error::EmptyBlock(i))?;
        match last.expr {
            Expr::Goto { .. } | Expr::Return { .. } => {}
            Expr::GotoIfNot { .. } => {
                if i + 1 == n {
                    return Err(Error::FallsOffEnd(i));
                }
            }
            _ => {
                if i + 1 == n {
                    return Err(Error::FallsOffEnd(i));
                }
                let var = id::var(g.vars.len());
                g.vars.push(Type::Nothing);
                block.code.push(Instr {
                    var,
                    expr: Expr::Goto {
                        target: id::block(i + 1),
                    },
                });
            }
        }
    }

    let returns = exits(&g);
    match returns.len() {
        0 => Err(Error::NoReturn),
        1 => Ok(g),
        _ => {
            let exit = id::block(g.blocks.len());
            let mut edges = vec![];
            for b in returns {
                if let Some(instr) = g.blocks[b.block()].code.last_mut() {
                    if let Expr::Return { val } =
                        replace(&mut instr.expr, Expr::Goto { target: exit })
                    {
                        edges.push((b, val));
                    }
                }
            }
            let phi = id::var(g.vars.len());
            g.vars.push(g.ret.clone());
            let ret = id::var(g.vars.len());
            g.vars.push(Type::Nothing);
            g.blocks.push(Block {
                code: vec![
                    Instr {
                        var: phi,
                        expr: Expr::Phi { edges },
                    },
                    Instr {
                        var: ret,
                        expr: Expr::Return {
                            val: Operand::Var(phi),
                        },
                    },
                ],
            });
            Ok(g)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{build::FunctionBuilder, Builtin, Callee};

    fn branchy() -> Function {
        let mut b = FunctionBuilder::new(vec![Type::Bool, Type::F64], Type::F64);
        let then = b.block();
        let other = b.block();
        b.goto_if_not(b.arg(0), other);
        b.switch_to(then);
        b.ret(b.arg(1));
        b.switch_to(other);
        let y = b.call(
            Type::F64,
            Callee::Builtin(Builtin::Neg),
            vec![b.arg(1)],
        );
        b.ret(y);
        b.finish()
    }

    #[test]
    fn test_loop_predecessors() {
        let mut b = FunctionBuilder::new(vec![], Type::Nothing);
        let head = b.block();
        let body = b.block();
        let done = b.block();
        b.goto(head);
        b.switch_to(head);
        b.goto_if_not(Operand::lit(crate::Val::Bool(true)), done);
        b.switch_to(body);
        b.goto(head);
        b.switch_to(done);
        b.ret(Operand::lit(crate::Val::Nothing));
        let f = b.finish();

        assert_eq!(successors(&f, head), vec![body, done]);
        let preds = predecessors(&f);
        assert_eq!(preds[head.block()], vec![id::block(0), body]);
        assert_eq!(preds[done.block()], vec![head]);
        assert!(preds[0].is_empty());
    }

    #[test]
    fn test_normalize_merges_returns() {
        let f = branchy();
        assert_eq!(exits(&f).len(), 2);
        let g = normalize(&f).unwrap();
        let exits = exits(&g);
        assert_eq!(exits, vec![id::block(3)]);
        match &g.blocks[3].code[0].expr {
            Expr::Phi { edges } => assert_eq!(edges.len(), 2),
            expr => panic!("expected phi, got {expr:?}"),
        }
        assert_eq!(g.vars.len(), f.vars.len() + 2);
    }

    #[test]
    fn test_normalize_makes_fallthrough_explicit() {
        let mut b = FunctionBuilder::new(vec![Type::F64], Type::F64);
        let next = b.block();
        b.push(Type::Nothing, Expr::Nop);
        b.switch_to(next);
        b.ret(b.arg(0));
        let g = normalize(&b.finish()).unwrap();
        assert_eq!(
            g.blocks[0].code.last().map(|instr| &instr.expr),
            Some(&Expr::Goto { target: next })
        );
    }

    #[test]
    fn test_normalize_rejects_no_return() {
        let mut b = FunctionBuilder::new(vec![], Type::Nothing);
        let again = b.block();
        b.goto(again);
        b.switch_to(again);
        b.goto(id::block(0));
        assert!(matches!(normalize(&b.finish()), Err(Error::NoReturn)));
    }

    #[test]
    fn test_jump_out_of_range() {
        let mut b = FunctionBuilder::new(vec![Type::Bool], Type::Nothing);
        let next = b.block();
        b.goto_if_not(b.arg(0), id::block(99));
        b.switch_to(next);
        b.ret(Operand::lit(crate::Val::Nothing));
        let f = b.finish();

        assert_eq!(successors(&f, id::block(0)), vec![next]);
        assert_eq!(predecessors(&f)[next.block()], vec![id::block(0)]);
        assert_eq!(bad_target(&f), Some((id::block(0), id::block(99))));
        assert!(matches!(
            normalize(&f),
            Err(Error::BadTarget {
                block: 0,
                target: 99
            })
        ));
    }
}
