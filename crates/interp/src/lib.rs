use indexmap::IndexMap;
use log::trace;
use rewind::{
    id, Builtin, Call, Callee, Const, Expr, Function, Instr, Operand, Provider, Signature, Type,
    Val,
};
use std::rc::Rc;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{op:?} cannot be applied to arguments of types {args:?}")]
    BuiltinType { op: Builtin, args: Vec<Type> },

    #[error("integer overflow in {0:?}")]
    Overflow(Builtin),

    #[error("index {index} is out of bounds for length {len}")]
    Bounds { index: i64, len: usize },

    #[error("no method matching {0}")]
    NoMethod(String),

    #[error("unknown global `{0}`")]
    UnknownGlobal(String),

    #[error("value of type {actual} cannot be narrowed to {expected}")]
    Sharpen { expected: Type, actual: Type },

    #[error("branch condition has type {0}, expected Bool")]
    Condition(Type),

    #[error("phi in block {block} has no edge from block {from}")]
    PhiEdge { block: usize, from: usize },

    #[error("phi in block {0} was reached without a predecessor")]
    PhiEntry(usize),

    #[error("argument {0} is out of range")]
    BadArg(usize),

    #[error("variable {0} is read before it is set")]
    UnsetVar(usize),

    #[error("block {0} does not exist")]
    BadBlock(usize),

    #[error("callee of type {0} is not a function")]
    NotCallable(Type),

    #[error("statement `{0}` is not supported")]
    Unsupported(String),
}

fn index(i: i64, len: usize) -> Result<usize, Error> {
    usize::try_from(i)
        .ok()
        .filter(|&j| j < len)
        .ok_or(Error::Bounds { index: i, len })
}

/// Evaluate a builtin on concrete arguments.
///
/// `SetIndex` writes into the vector's shared storage and returns that same vector.
pub fn eval_builtin(op: Builtin, args: &[Val]) -> Result<Val, Error> {
    use Builtin::*;
    match (op, args) {
        (Add, [Val::F64(a), Val::F64(b)]) => Ok(Val::F64(a + b)),
        (Sub, [Val::F64(a), Val::F64(b)]) => Ok(Val::F64(a - b)),
        (Mul, [Val::F64(a), Val::F64(b)]) => Ok(Val::F64(a * b)),
        (Div, [Val::F64(a), Val::F64(b)]) => Ok(Val::F64(a / b)),

        (Neg, [Val::F64(a)]) => Ok(Val::F64(-a)),
        (Sin, [Val::F64(a)]) => Ok(Val::F64(a.sin())),
        (Cos, [Val::F64(a)]) => Ok(Val::F64(a.cos())),
        (Exp, [Val::F64(a)]) => Ok(Val::F64(a.exp())),
        (Log, [Val::F64(a)]) => Ok(Val::F64(a.ln())),
        (Sqrt, [Val::F64(a)]) => Ok(Val::F64(a.sqrt())),
        (Acos, [Val::F64(a)]) => Ok(Val::F64(a.acos())),

        (Lt, [Val::F64(a), Val::F64(b)]) => Ok(Val::Bool(a < b)),
        (Lt, [Val::Int(a), Val::Int(b)]) => Ok(Val::Bool(a < b)),
        (Gt, [Val::F64(a), Val::F64(b)]) => Ok(Val::Bool(a > b)),
        (Gt, [Val::Int(a), Val::Int(b)]) => Ok(Val::Bool(a > b)),
        (Eq, [Val::F64(a), Val::F64(b)]) => Ok(Val::Bool(a == b)),
        (Eq, [Val::Int(a), Val::Int(b)]) => Ok(Val::Bool(a == b)),

        (AddInt, [Val::Int(a), Val::Int(b)]) => {
            a.checked_add(*b).map(Val::Int).ok_or(Error::Overflow(op))
        }

        (GetIndex, [Val::Vector(x), Val::Int(i)]) => {
            let x = x.borrow();
            let i = index(*i, x.len())?;
            Ok(Val::F64(x[i]))
        }
        (SetIndex, [Val::Vector(x), Val::F64(v), Val::Int(i)]) => {
            {
                let mut buf = x.borrow_mut();
                let i = index(*i, buf.len())?;
                buf[i] = *v;
            }
            Ok(Val::Vector(Rc::clone(x)))
        }
        (Length, [Val::Vector(x)]) => Ok(Val::Int(x.borrow().len() as i64)),

        (Tuple, members) => Ok(Val::tuple(members.to_vec())),
        (GetField, [Val::Tuple(t), Val::Int(i)]) => {
            let i = index(*i, t.len())?;
            Ok(t[i].clone())
        }

        _ => Err(Error::BuiltinType {
            op,
            args: args.iter().map(Val::ty).collect(),
        }),
    }
}

/// Named functions and globals; the in-memory stand-in for a front-end.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, Default)]
pub struct Module {
    funcs: IndexMap<Rc<str>, Vec<Rc<Function>>>,
    globals: IndexMap<Rc<str>, (Val, Type)>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a method to `name`. Earlier methods take priority when several match.
    pub fn define(&mut self, name: &str, f: Function) -> Rc<Function> {
        let f = Rc::new(f);
        self.funcs.entry(name.into()).or_default().push(Rc::clone(&f));
        f
    }

    pub fn set_global(&mut self, name: &str, val: Val, ty: Type) {
        self.globals.insert(name.into(), (val, ty));
    }

    /// The first method of `name` whose parameters admit `args`.
    pub fn method(&self, name: &str, args: &[Type]) -> Option<&Rc<Function>> {
        self.funcs.get(name)?.iter().find(|f| {
            f.params.len() == args.len() && f.params.iter().zip(args).all(|(p, a)| p.admits(a))
        })
    }
}

impl Provider for Module {
    fn typed_ir(&self, sig: &Signature) -> Result<(Rc<Function>, Type), rewind::Error> {
        match &sig.callee {
            &Callee::Builtin(op) => Err(rewind::Error::BuiltinIr(op)),
            Callee::Func(name) => {
                if !sig.args.iter().all(Type::is_concrete) {
                    return Err(rewind::Error::AbstractSignature(sig.to_string()));
                }
                let f = self
                    .method(name, &sig.args)
                    .ok_or_else(|| rewind::Error::NoMethod(sig.to_string()))?;
                Ok((Rc::clone(f), f.ret.clone()))
            }
        }
    }

    fn global(&self, name: &str) -> Option<(Val, Type)> {
        self.globals.get(name).cloned()
    }
}

/// Resolve a constant to its value.
pub fn constant(module: &Module, c: &Const) -> Result<Val, Error> {
    match c {
        Const::Literal(val) | Const::Quoted(val) => Ok(val.clone()),
        Const::Global(name) => module
            .global(name)
            .map(|(val, _)| val)
            .ok_or_else(|| Error::UnknownGlobal(name.to_string())),
    }
}

struct Interpreter<'a> {
    module: &'a Module,
    f: &'a Function,
    args: Vec<Val>,
    vars: Vec<Option<Val>>,
}

impl<'a> Interpreter<'a> {
    fn operand(&self, op: &Operand) -> Result<Val, Error> {
        match op {
            Operand::Arg(a) => self.args.get(a.arg()).cloned().ok_or(Error::BadArg(a.arg())),
            Operand::Var(v) => self
                .vars
                .get(v.var())
                .cloned()
                .flatten()
                .ok_or(Error::UnsetVar(v.var())),
            Operand::Const(c) => constant(self.module, c),
        }
    }

    fn set(&mut self, var: id::Var, val: Val) {
        if let Some(slot) = self.vars.get_mut(var.var()) {
            *slot = Some(val);
        }
    }

    fn call(&self, call: &Call) -> Result<Val, Error> {
        match call {
            Call::Static { callee, args } => {
                let vals = args
                    .iter()
                    .map(|arg| self.operand(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                match callee {
                    &Callee::Builtin(op) => eval_builtin(op, &vals),
                    Callee::Func(name) => call_named(self.module, name, vals),
                }
            }
            Call::Dynamic { callee, args } => {
                let name = match self.operand(callee)? {
                    Val::Symbol(name) => name,
                    val => return Err(Error::NotCallable(val.ty())),
                };
                let vals = args
                    .iter()
                    .map(|arg| self.operand(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                call_named(self.module, &name, vals)
            }
        }
    }

    fn run(&mut self) -> Result<Val, Error> {
        let f = self.f;
        let mut prev: Option<id::Block> = None;
        let mut cur = f.entry();
        loop {
            let block = f.blocks.get(cur.block()).ok_or(Error::BadBlock(cur.block()))?;
            let mut next = id::block(cur.block() + 1);
            let mut phis = vec![];
            for Instr { var, expr } in &block.code {
                if !matches!(expr, Expr::Phi { .. }) {
                    for (var, val) in phis.drain(..) {
                        self.set(var, val);
                    }
                }
                let val = match expr {
                    Expr::Nop | Expr::Meta { .. } => Val::Nothing,
                    Expr::BoundsCheck => Val::Bool(true),
                    &Expr::Goto { target } => {
                        next = target;
                        break;
                    }
                    &Expr::GotoIfNot { ref cond, target } => {
                        match self.operand(cond)? {
                            Val::Bool(true) => {}
                            Val::Bool(false) => next = target,
                            val => return Err(Error::Condition(val.ty())),
                        }
                        break;
                    }
                    Expr::Return { val } => return self.operand(val),
                    Expr::Phi { edges } => {
                        let from = prev.ok_or(Error::PhiEntry(cur.block()))?;
                        let (_, op) = edges.iter().find(|(b, _)| *b == from).ok_or(
                            Error::PhiEdge {
                                block: cur.block(),
                                from: from.block(),
                            },
                        )?;
                        self.operand(op)?
                    }
                    Expr::Pi { val, ty } => {
                        let val = self.operand(val)?;
                        if !ty.admits(&val.ty()) {
                            return Err(Error::Sharpen {
                                expected: ty.clone(),
                                actual: val.ty(),
                            });
                        }
                        val
                    }
                    Expr::Const { val } => constant(self.module, val)?,
                    Expr::Call { call } => self.call(call)?,
                    Expr::Unsupported { name } => return Err(Error::Unsupported(name.to_string())),
                };
                match expr {
                    Expr::Phi { .. } => phis.push((*var, val)),
                    _ => self.set(*var, val),
                }
            }
            for (var, val) in phis {
                self.set(var, val);
            }
            prev = Some(cur);
            cur = next;
        }
    }
}

/// Run `f` on `args`.
///
/// The phis at the top of a block read all their edges before any of them is set.
pub fn interp(module: &Module, f: &Function, args: Vec<Val>) -> Result<Val, Error> {
    let mut interpreter = Interpreter {
        module,
        f,
        args,
        vars: vec![None; f.vars.len()],
    };
    interpreter.run()
}

/// Dispatch on the runtime types of `args` and run the matching method of `name`.
pub fn call_named(module: &Module, name: &str, args: Vec<Val>) -> Result<Val, Error> {
    let types: Vec<Type> = args.iter().map(Val::ty).collect();
    let sig = Signature::func(name, types);
    trace!("interpreting {sig}");
    let f = module
        .method(name, &sig.args)
        .ok_or_else(|| Error::NoMethod(sig.to_string()))?;
    interp(module, f, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rewind::build::FunctionBuilder;

    fn builtin(op: Builtin) -> Callee {
        Callee::Builtin(op)
    }

    #[test]
    fn test_two_plus_two() {
        let mut b = FunctionBuilder::new(vec![Type::F64, Type::F64], Type::F64);
        let z = b.call(Type::F64, builtin(Builtin::Add), vec![b.arg(0), b.arg(1)]);
        b.ret(z);
        let answer = interp(&Module::new(), &b.finish(), vec![Val::F64(2.), Val::F64(2.)]);
        assert_eq!(answer.unwrap(), Val::F64(4.));
    }

    #[test]
    fn test_nested_call() {
        let mut module = Module::new();
        let mut b = FunctionBuilder::new(vec![], Type::F64);
        b.ret(Operand::f64(42.));
        module.define("answer", b.finish());

        let mut b = FunctionBuilder::new(vec![], Type::F64);
        let x = b.call(Type::F64, Callee::Func("answer".into()), vec![]);
        let y = b.call(Type::F64, builtin(Builtin::Mul), vec![x.clone(), x]);
        b.ret(y);
        let answer = interp(&module, &b.finish(), vec![]).unwrap();
        assert_eq!(answer, Val::F64(1764.));
    }

    #[test]
    fn test_loop_power() {
        // acc = 1; i = 0; while i < n { acc *= x; i += 1 }; acc
        let mut b = FunctionBuilder::new(vec![Type::F64, Type::Int], Type::F64);
        let head = b.block();
        let body = b.block();
        let done = b.block();
        b.goto(head);

        b.switch_to(head);
        let acc = b.phi(Type::F64);
        let i = b.phi(Type::Int);
        let cond = b.call(
            Type::Bool,
            builtin(Builtin::Lt),
            vec![Operand::Var(i), b.arg(1)],
        );
        b.goto_if_not(cond, done);

        b.switch_to(body);
        let acc2 = b.call(
            Type::F64,
            builtin(Builtin::Mul),
            vec![Operand::Var(acc), b.arg(0)],
        );
        let i2 = b.call(
            Type::Int,
            builtin(Builtin::AddInt),
            vec![Operand::Var(i), Operand::int(1)],
        );
        b.goto(head);

        b.switch_to(done);
        b.ret(Operand::Var(acc));

        b.set_edges(acc, vec![(id::block(0), Operand::f64(1.)), (body, acc2)]);
        b.set_edges(i, vec![(id::block(0), Operand::int(0)), (body, i2)]);

        let answer = interp(&Module::new(), &b.finish(), vec![Val::F64(3.), Val::Int(4)]);
        assert_eq!(answer.unwrap(), Val::F64(81.));
    }

    #[test]
    fn test_phis_swap() {
        // a, b = x, y; swap once; a
        let mut b = FunctionBuilder::new(vec![Type::F64, Type::F64], Type::F64);
        let head = b.block();
        let body = b.block();
        let done = b.block();
        b.goto(head);

        b.switch_to(head);
        let first = b.phi(Type::Bool);
        let x = b.phi(Type::F64);
        let y = b.phi(Type::F64);
        b.goto_if_not(Operand::Var(first), done);

        b.switch_to(body);
        b.goto(head);

        b.switch_to(done);
        b.ret(Operand::Var(x));

        let entry = id::block(0);
        b.set_edges(
            first,
            vec![
                (entry, Operand::lit(Val::Bool(true))),
                (body, Operand::lit(Val::Bool(false))),
            ],
        );
        b.set_edges(x, vec![(entry, b.arg(0)), (body, Operand::Var(y))]);
        b.set_edges(y, vec![(entry, b.arg(1)), (body, Operand::Var(x))]);

        let answer = interp(&Module::new(), &b.finish(), vec![Val::F64(1.), Val::F64(2.)]);
        assert_eq!(answer.unwrap(), Val::F64(2.));
    }

    #[test]
    fn test_dynamic_call() {
        let mut module = Module::new();
        let mut b = FunctionBuilder::new(vec![Type::F64], Type::F64);
        let y = b.call(Type::F64, builtin(Builtin::Neg), vec![b.arg(0)]);
        b.ret(y);
        module.define("negate", b.finish());
        module.set_global("which", Val::symbol("negate"), Type::Symbol);

        let mut b = FunctionBuilder::new(vec![Type::F64], Type::F64);
        let callee = b.global(Type::Symbol, "which");
        let y = b.call_dynamic(Type::F64, callee, vec![b.arg(0)]);
        b.ret(y);
        let answer = interp(&module, &b.finish(), vec![Val::F64(2.5)]).unwrap();
        assert_eq!(answer, Val::F64(-2.5));
    }

    #[test]
    fn test_set_index_aliases() {
        let x = Val::vector(vec![1., 2., 3.]);
        let y = eval_builtin(Builtin::SetIndex, &[x.clone(), Val::F64(9.), Val::Int(1)]).unwrap();
        assert_eq!(x, Val::vector(vec![1., 9., 3.]));
        match (&x, &y) {
            (Val::Vector(a), Val::Vector(b)) => assert!(Rc::ptr_eq(a, b)),
            _ => panic!("expected vectors"),
        }
    }

    #[test]
    fn test_bounds() {
        let x = Val::vector(vec![1.]);
        assert!(matches!(
            eval_builtin(Builtin::GetIndex, &[x, Val::Int(3)]),
            Err(Error::Bounds { index: 3, len: 1 })
        ));
    }

    #[test]
    fn test_sharpen_failure() {
        let mut b = FunctionBuilder::new(vec![Type::Any], Type::F64);
        let y = b.pi(b.arg(0), Type::F64);
        b.ret(y);
        let res = interp(&Module::new(), &b.finish(), vec![Val::Int(1)]);
        assert!(matches!(res, Err(Error::Sharpen { .. })));
    }
}
