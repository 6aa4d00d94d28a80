use crate::{
    alloc::SlotAllocator, cache::RuleCache, ir::FwdOperand, stack::BlockTag, Error,
};
use rewind::{id, Const, Function, Operand, Provider, Type, Val};

/// State shared by every statement translated while building one rule.
pub struct Context<'a> {
    pub(crate) provider: &'a dyn Provider,
    pub(crate) rules: &'a RuleCache,
    /// Pushed before the forward program runs, so that the reversed entry block knows when to
    /// leave.
    pub(crate) sentinel: BlockTag,
    pub(crate) alloc: SlotAllocator,
    params: Vec<Type>,
    vars: Vec<Type>,
}

impl<'a> Context<'a> {
    pub fn new(rules: &'a RuleCache, f: &Function) -> Self {
        Context {
            provider: rules.provider(),
            rules,
            sentinel: BlockTag::sentinel(),
            alloc: SlotAllocator::new(),
            params: f.params.clone(),
            vars: f.vars.clone(),
        }
    }

    pub fn var_type(&self, v: id::Var) -> Result<&Type, Error> {
        self.vars
            .get(v.var())
            .ok_or_else(|| Error::Malformed(format!("program point {} has no type", v.var())))
    }

    pub fn type_of(&self, op: &Operand) -> Result<Type, Error> {
        match op {
            Operand::Arg(a) => self
                .params
                .get(a.arg())
                .cloned()
                .ok_or_else(|| Error::Malformed(format!("argument {} is out of range", a.arg()))),
            &Operand::Var(v) => self.var_type(v).cloned(),
            Operand::Const(Const::Literal(val) | Const::Quoted(val)) => Ok(val.ty()),
            Operand::Const(Const::Global(name)) => self
                .provider
                .global(name)
                .map(|(_, ty)| ty)
                .ok_or_else(|| Error::UnknownGlobal(name.to_string())),
        }
    }

    pub(crate) fn constant(&self, c: &Const) -> Result<Val, Error> {
        match c {
            Const::Literal(val) | Const::Quoted(val) => Ok(val.clone()),
            Const::Global(name) => self
                .provider
                .global(name)
                .map(|(val, _)| val)
                .ok_or_else(|| Error::UnknownGlobal(name.to_string())),
        }
    }

    pub(crate) fn resolve(&self, op: &Operand) -> Result<FwdOperand, Error> {
        match op {
            &Operand::Arg(a) => Ok(FwdOperand::Arg(a)),
            &Operand::Var(v) => Ok(FwdOperand::Var(v)),
            Operand::Const(c) => self.constant(c).map(FwdOperand::Const),
        }
    }

    pub(crate) fn params(&self) -> &[Type] {
        &self.params
    }

    pub(crate) fn vars(&self) -> &[Type] {
        &self.vars
    }
}
