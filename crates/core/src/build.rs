use crate::{id, Block, Call, Callee, Const, Expr, Function, Instr, Operand, Type, Val};

/// A function body under construction. Not guaranteed to be well-formed.
///
/// Every method that emits a statement appends it to the current block and returns an operand
/// referring to the new program point.
pub struct FunctionBuilder {
    params: Vec<Type>,
    ret: Type,
    vars: Vec<Type>,
    blocks: Vec<Block>,
    current: id::Block,
}

impl FunctionBuilder {
    pub fn new(params: Vec<Type>, ret: Type) -> Self {
        FunctionBuilder {
            params,
            ret,
            vars: vec![],
            blocks: vec![Block::default()],
            current: id::block(0),
        }
    }

    pub fn arg(&self, i: usize) -> Operand {
        Operand::Arg(id::arg(i))
    }

    /// Start a new empty block without switching to it.
    pub fn block(&mut self) -> id::Block {
        let id = id::block(self.blocks.len());
        self.blocks.push(Block::default());
        id
    }

    pub fn switch_to(&mut self, b: id::Block) {
        self.current = b;
    }

    pub fn current(&self) -> id::Block {
        self.current
    }

    pub fn push(&mut self, ty: Type, expr: Expr) -> id::Var {
        let var = id::var(self.vars.len());
        self.vars.push(ty);
        self.blocks[self.current.block()]
            .code
            .push(Instr { var, expr });
        var
    }

    pub fn call(&mut self, ty: Type, callee: Callee, args: Vec<Operand>) -> Operand {
        Operand::Var(self.push(
            ty,
            Expr::Call {
                call: Call::Static { callee, args },
            },
        ))
    }

    pub fn call_dynamic(&mut self, ty: Type, callee: Operand, args: Vec<Operand>) -> Operand {
        Operand::Var(self.push(
            ty,
            Expr::Call {
                call: Call::Dynamic { callee, args },
            },
        ))
    }

    pub fn constant(&mut self, val: Val) -> Operand {
        let ty = val.ty();
        Operand::Var(self.push(
            ty,
            Expr::Const {
                val: Const::Literal(val),
            },
        ))
    }

    pub fn global(&mut self, ty: Type, name: &str) -> Operand {
        Operand::Var(self.push(
            ty,
            Expr::Const {
                val: Const::Global(name.into()),
            },
        ))
    }

    pub fn pi(&mut self, val: Operand, ty: Type) -> Operand {
        Operand::Var(self.push(ty.clone(), Expr::Pi { val, ty }))
    }

    /// Emit a phi with no edges yet; fill them in with [`FunctionBuilder::set_edges`] once the
    /// incoming values exist.
    pub fn phi(&mut self, ty: Type) -> id::Var {
        self.push(ty, Expr::Phi { edges: vec![] })
    }

    pub fn set_edges(&mut self, phi: id::Var, new: Vec<(id::Block, Operand)>) {
        for block in &mut self.blocks {
            for instr in &mut block.code {
                if instr.var == phi {
                    if let Expr::Phi { edges } = &mut instr.expr {
                        *edges = new;
                    }
                    return;
                }
            }
        }
    }

    pub fn goto(&mut self, target: id::Block) {
        self.push(Type::Nothing, Expr::Goto { target });
    }

    pub fn goto_if_not(&mut self, cond: Operand, target: id::Block) {
        self.push(Type::Nothing, Expr::GotoIfNot { cond, target });
    }

    pub fn ret(&mut self, val: Operand) {
        self.push(Type::Nothing, Expr::Return { val });
    }

    pub fn finish(self) -> Function {
        let FunctionBuilder {
            params,
            ret,
            vars,
            blocks,
            current: _,
        } = self;
        Function {
            params,
            ret,
            vars,
            blocks,
        }
    }
}
