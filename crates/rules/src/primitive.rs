use rewind::{Builtin, Val};
use rewind_autodiff::{zero_rdata, CoDual, Error, FData, Pullback, RData, Rule};
use rewind_interp::eval_builtin;
use std::{cell::RefCell, rc::Rc};

/// The hand-written rule for one builtin.
#[derive(Clone, Copy, Debug)]
pub struct Primitive {
    op: Builtin,
}

impl Primitive {
    pub fn new(op: Builtin) -> Self {
        Primitive { op }
    }
}

fn real(dy: &RData) -> Result<f64, Error> {
    dy.f64()
        .ok_or_else(|| Error::TangentType(format!("expected a real reverse seed, got {dy:?}")))
}

/// Pullback of a function from reals to a real, given its partial derivatives.
fn scalar(partials: Vec<f64>) -> Pullback {
    Box::new(move |dy: RData| -> Result<Vec<RData>, Error> {
        let d = real(&dy)?;
        Ok(partials.iter().map(|p| RData::F64(d * p)).collect())
    })
}

fn zeros(xs: &[Val]) -> Pullback {
    let dxs: Vec<RData> = xs.iter().map(zero_rdata).collect();
    Box::new(move |_: RData| -> Result<Vec<RData>, Error> { Ok(dxs) })
}

fn primals(args: &[CoDual]) -> Vec<Val> {
    args.iter().map(|arg| arg.primal.clone()).collect()
}

type Buffer = Rc<RefCell<Vec<f64>>>;

/// The primal and tangent buffers of a vector argument.
fn buffers(x: &CoDual) -> Result<(Buffer, Buffer), Error> {
    match (&x.primal, &x.tangent) {
        (Val::Vector(buf), FData::Vector(dbuf)) if buf.borrow().len() == dbuf.borrow().len() => {
            Ok((Rc::clone(buf), Rc::clone(dbuf)))
        }
        (primal, tangent) => Err(Error::TangentType(format!(
            "{} has forward data {tangent:?}",
            primal.ty()
        ))),
    }
}

/// An index that `eval_builtin` has already checked.
fn position(i: &Val) -> Result<usize, Error> {
    match *i {
        Val::Int(i) => usize::try_from(i)
            .map_err(|_| Error::Primal(rewind_interp::Error::Bounds { index: i, len: 0 })),
        ref val => Err(Error::Malformed(format!("index of type {}", val.ty()))),
    }
}

fn get_index(args: &[CoDual]) -> Result<(CoDual, Pullback), Error> {
    let y = eval_builtin(Builtin::GetIndex, &primals(args))?;
    let (_, dbuf) = buffers(&args[0])?;
    let k = position(&args[1].primal)?;
    let pullback: Pullback = Box::new(move |dy: RData| -> Result<Vec<RData>, Error> {
        dbuf.borrow_mut()[k] += real(&dy)?;
        Ok(vec![RData::NoRData, RData::NoRData])
    });
    Ok((CoDual::zero(y), pullback))
}

/// Writes `v` into `x[i]` in place. The pullback moves the gradient at `x[i]` over to `v` and
/// puts back the primal and tangent entries the write overwrote.
fn set_index(args: &[CoDual]) -> Result<(CoDual, Pullback), Error> {
    let [x, _, i] = args else {
        return Err(Error::Primal(rewind_interp::Error::BuiltinType {
            op: Builtin::SetIndex,
            args: args.iter().map(|arg| arg.primal.ty()).collect(),
        }));
    };
    let old = eval_builtin(Builtin::GetIndex, &[x.primal.clone(), i.primal.clone()])?;
    let (buf, dbuf) = buffers(x)?;
    let k = position(&i.primal)?;
    let y = eval_builtin(Builtin::SetIndex, &primals(args))?;
    let old_dx = std::mem::replace(&mut dbuf.borrow_mut()[k], 0.);

    let tangent = FData::Vector(Rc::clone(&dbuf));
    let pullback: Pullback = Box::new(move |_: RData| -> Result<Vec<RData>, Error> {
        let dv = std::mem::replace(&mut dbuf.borrow_mut()[k], old_dx);
        if let Val::F64(old) = old {
            buf.borrow_mut()[k] = old;
        }
        Ok(vec![RData::NoRData, RData::F64(dv), RData::NoRData])
    });
    Ok((CoDual::new(y, tangent), pullback))
}

fn tuple(args: &[CoDual]) -> Result<(CoDual, Pullback), Error> {
    let xs = primals(args);
    let tangent = FData::tuple(args.iter().map(|arg| arg.tangent.clone()).collect());
    let n = args.len();
    let zero: Vec<RData> = xs.iter().map(zero_rdata).collect();
    let pullback: Pullback = Box::new(move |dy: RData| -> Result<Vec<RData>, Error> {
        match dy {
            RData::NoRData => Ok(zero),
            RData::Tuple(dxs) if dxs.len() == n => Ok(dxs),
            dy => Err(Error::TangentType(format!(
                "tuple of {n} members got reverse data {dy:?}"
            ))),
        }
    });
    Ok((CoDual::new(Val::tuple(xs), tangent), pullback))
}

fn get_field(args: &[CoDual]) -> Result<(CoDual, Pullback), Error> {
    let y = eval_builtin(Builtin::GetField, &primals(args))?;
    let members = match &args[0].primal {
        Val::Tuple(members) => Rc::clone(members),
        val => return Err(Error::Malformed(format!("field of a {}", val.ty()))),
    };
    let i = position(&args[1].primal)?;
    let tangent = match &args[0].tangent {
        FData::NoFData => FData::NoFData,
        FData::Tuple(fs) if fs.len() == members.len() => fs[i].clone(),
        f => return Err(Error::TangentType(format!("tuple has forward data {f:?}"))),
    };
    let pullback: Pullback = Box::new(move |dy: RData| -> Result<Vec<RData>, Error> {
        let mut dxs: Vec<RData> = members.iter().map(zero_rdata).collect();
        dxs[i] = dy;
        Ok(vec![RData::tuple(dxs), RData::NoRData])
    });
    Ok((CoDual::new(y, tangent), pullback))
}

impl Rule for Primitive {
    fn call(&self, args: &[CoDual]) -> Result<(CoDual, Pullback), Error> {
        use Builtin::*;

        match self.op {
            GetIndex => return get_index(args),
            SetIndex => return set_index(args),
            Tuple => return tuple(args),
            GetField => return get_field(args),
            _ => {}
        }

        let xs = primals(args);
        let y = eval_builtin(self.op, &xs)?;
        let pullback = match (self.op, xs.as_slice(), &y) {
            (Add, _, _) => scalar(vec![1., 1.]),
            (Sub, _, _) => scalar(vec![1., -1.]),
            (Mul, &[Val::F64(a), Val::F64(b)], _) => scalar(vec![b, a]),
            (Div, &[Val::F64(a), Val::F64(b)], _) => scalar(vec![1. / b, -a / (b * b)]),
            (Neg, _, _) => scalar(vec![-1.]),
            (Sin, &[Val::F64(x)], _) => scalar(vec![x.cos()]),
            (Cos, &[Val::F64(x)], _) => scalar(vec![-x.sin()]),
            (Exp, _, &Val::F64(y)) => scalar(vec![y]),
            (Log, &[Val::F64(x)], _) => scalar(vec![1. / x]),
            (Sqrt, _, &Val::F64(y)) => scalar(vec![0.5 / y]),
            (Acos, &[Val::F64(x)], _) => scalar(vec![-1. / (1. - x * x).sqrt()]),
            _ => zeros(&xs),
        };
        Ok((CoDual::zero(y), pullback))
    }
}
