//! Tangents and their split into forward and reverse data.

use crate::Error;
use rand::Rng;
use rewind::{Type, Val};
use std::{cell::RefCell, rc::Rc};

/// Shape of the tangent of a primal type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TangentType {
    NoTangent,
    F64,
    Vector,
    /// Never all `NoTangent`; such a tuple is itself `NoTangent`.
    Tuple {
        members: Vec<TangentType>,
    },
    /// The primal type is not concrete, so the tangent can only be determined from a value.
    Dynamic,
}

pub fn tangent_type(ty: &Type) -> TangentType {
    match ty {
        Type::Nothing | Type::Bool | Type::Int | Type::Symbol => TangentType::NoTangent,
        Type::F64 => TangentType::F64,
        Type::Vector => TangentType::Vector,
        Type::Tuple { members } => {
            let members: Vec<TangentType> = members.iter().map(tangent_type).collect();
            if members.iter().all(|t| *t == TangentType::NoTangent) {
                TangentType::NoTangent
            } else {
                TangentType::Tuple { members }
            }
        }
        Type::Any => TangentType::Dynamic,
    }
}

/// Whether values of this type can carry a nonzero tangent.
pub fn is_differentiable(ty: &Type) -> bool {
    tangent_type(ty) != TangentType::NoTangent
}

#[derive(Clone, Debug, PartialEq)]
pub enum Tangent {
    NoTangent,
    F64(f64),
    /// Shared with every other tangent of the same primal buffer.
    Vector(Rc<RefCell<Vec<f64>>>),
    Tuple(Vec<Tangent>),
}

/// The part of a tangent that is passed alongside the primal during the forward pass.
#[derive(Clone, Debug, PartialEq)]
pub enum FData {
    NoFData,
    Vector(Rc<RefCell<Vec<f64>>>),
    Tuple(Vec<FData>),
}

/// The part of a tangent that flows backwards through pullbacks.
#[derive(Clone, Debug, PartialEq)]
pub enum RData {
    NoRData,
    F64(f64),
    Tuple(Vec<RData>),
}

impl FData {
    pub fn tuple(members: Vec<FData>) -> Self {
        if members.iter().all(|m| *m == FData::NoFData) {
            FData::NoFData
        } else {
            FData::Tuple(members)
        }
    }
}

impl RData {
    pub fn tuple(members: Vec<RData>) -> Self {
        if members.iter().all(|m| *m == RData::NoRData) {
            RData::NoRData
        } else {
            RData::Tuple(members)
        }
    }

    pub fn f64(&self) -> Option<f64> {
        match *self {
            RData::F64(x) => Some(x),
            _ => None,
        }
    }

    /// Sum of two reverse data of the same shape. `NoRData` acts as zero.
    pub fn add(&self, other: &RData) -> Result<RData, Error> {
        match (self, other) {
            (RData::NoRData, r) | (r, RData::NoRData) => Ok(r.clone()),
            (RData::F64(a), RData::F64(b)) => Ok(RData::F64(a + b)),
            (RData::Tuple(a), RData::Tuple(b)) if a.len() == b.len() => a
                .iter()
                .zip(b)
                .map(|(a, b)| a.add(b))
                .collect::<Result<Vec<_>, _>>()
                .map(RData::tuple),
            (a, b) => Err(Error::TangentType(format!("cannot add {a:?} to {b:?}"))),
        }
    }
}

impl Tangent {
    pub fn ty(&self) -> TangentType {
        match self {
            Tangent::NoTangent => TangentType::NoTangent,
            Tangent::F64(_) => TangentType::F64,
            Tangent::Vector(_) => TangentType::Vector,
            Tangent::Tuple(members) => TangentType::Tuple {
                members: members.iter().map(Tangent::ty).collect(),
            },
        }
    }

    pub fn fdata(&self) -> FData {
        match self {
            Tangent::NoTangent | Tangent::F64(_) => FData::NoFData,
            Tangent::Vector(buf) => FData::Vector(Rc::clone(buf)),
            Tangent::Tuple(members) => FData::tuple(members.iter().map(Tangent::fdata).collect()),
        }
    }

    pub fn rdata(&self) -> RData {
        match self {
            Tangent::NoTangent | Tangent::Vector(_) => RData::NoRData,
            &Tangent::F64(x) => RData::F64(x),
            Tangent::Tuple(members) => RData::tuple(members.iter().map(Tangent::rdata).collect()),
        }
    }

    /// Inverse of [`Tangent::fdata`] and [`Tangent::rdata`].
    pub fn from_parts(ty: &TangentType, fdata: FData, rdata: RData) -> Result<Self, Error> {
        match (ty, fdata, rdata) {
            (TangentType::NoTangent, FData::NoFData, RData::NoRData) => Ok(Tangent::NoTangent),
            (TangentType::F64, FData::NoFData, RData::F64(x)) => Ok(Tangent::F64(x)),
            (TangentType::Vector, FData::Vector(buf), RData::NoRData) => Ok(Tangent::Vector(buf)),
            (TangentType::Tuple { members }, fdata, rdata) => {
                let n = members.len();
                let fs = match fdata {
                    FData::NoFData => vec![FData::NoFData; n],
                    FData::Tuple(fs) if fs.len() == n => fs,
                    f => return Err(Error::TangentType(format!("{f:?} does not fit {ty:?}"))),
                };
                let rs = match rdata {
                    RData::NoRData => vec![RData::NoRData; n],
                    RData::Tuple(rs) if rs.len() == n => rs,
                    r => return Err(Error::TangentType(format!("{r:?} does not fit {ty:?}"))),
                };
                members
                    .iter()
                    .zip(fs)
                    .zip(rs)
                    .map(|((t, f), r)| Tangent::from_parts(t, f, r))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Tangent::Tuple)
            }
            (ty, f, r) => Err(Error::TangentType(format!(
                "cannot assemble a {ty:?} tangent from {f:?} and {r:?}"
            ))),
        }
    }

    /// A fresh tangent for `x` with the given forward data and zero reverse data.
    pub fn seed(x: &Val, fdata: FData) -> Result<Self, Error> {
        Tangent::from_parts(&tangent_type(&x.ty()), fdata, zero_rdata(x))
    }

    pub fn increment_rdata(&mut self, dx: &RData) -> Result<(), Error> {
        match (self, dx) {
            (_, RData::NoRData) => Ok(()),
            (Tangent::F64(x), RData::F64(d)) => {
                *x += d;
                Ok(())
            }
            (Tangent::Tuple(members), RData::Tuple(ds)) if members.len() == ds.len() => members
                .iter_mut()
                .zip(ds)
                .try_for_each(|(m, d)| m.increment_rdata(d)),
            (t, d) => Err(Error::TangentType(format!("cannot increment {t:?} by {d:?}"))),
        }
    }
}

fn fill(x: &Val, elem: &mut dyn FnMut() -> f64) -> Tangent {
    match x {
        Val::Nothing | Val::Bool(_) | Val::Int(_) | Val::Symbol(_) => Tangent::NoTangent,
        Val::F64(_) => Tangent::F64(elem()),
        Val::Vector(buf) => {
            let n = buf.borrow().len();
            Tangent::Vector(Rc::new(RefCell::new((0..n).map(|_| elem()).collect())))
        }
        Val::Tuple(members) => {
            let members: Vec<Tangent> = members.iter().map(|m| fill(m, elem)).collect();
            if members.iter().all(|m| *m == Tangent::NoTangent) {
                Tangent::NoTangent
            } else {
                Tangent::Tuple(members)
            }
        }
    }
}

pub fn zero_tangent(x: &Val) -> Tangent {
    fill(x, &mut || 0.)
}

/// A tangent with freshly allocated storage whose contents callers must overwrite before reading.
pub fn uninit_tangent(x: &Val) -> Tangent {
    fill(x, &mut || 0.)
}

/// Box-Muller; `1 - u` keeps the logarithm finite.
fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let u: f64 = 1. - rng.gen::<f64>();
    let v: f64 = rng.gen();
    (-2. * u.ln()).sqrt() * (std::f64::consts::TAU * v).cos()
}

pub fn randn_tangent<R: Rng + ?Sized>(rng: &mut R, x: &Val) -> Tangent {
    fill(x, &mut || standard_normal(rng))
}

pub fn zero_rdata(x: &Val) -> RData {
    match x {
        Val::F64(_) => RData::F64(0.),
        Val::Tuple(members) => RData::tuple(members.iter().map(zero_rdata).collect()),
        _ => RData::NoRData,
    }
}

/// Check that `fdata` is the forward data of some tangent of `x`.
pub fn check_fdata(x: &Val, fdata: &FData) -> Result<(), String> {
    match (x, fdata) {
        (Val::Nothing | Val::Bool(_) | Val::Int(_) | Val::F64(_) | Val::Symbol(_), FData::NoFData) => {
            Ok(())
        }
        (Val::Vector(buf), FData::Vector(d)) => {
            let (n, m) = (buf.borrow().len(), d.borrow().len());
            if n == m {
                Ok(())
            } else {
                Err(format!("vector of length {n} has a tangent of length {m}"))
            }
        }
        (Val::Tuple(members), FData::NoFData) => members
            .iter()
            .try_for_each(|m| check_fdata(m, &FData::NoFData)),
        (Val::Tuple(members), FData::Tuple(fs)) => {
            if members.len() != fs.len() {
                return Err(format!(
                    "tuple of {} members has forward data for {}",
                    members.len(),
                    fs.len()
                ));
            }
            if fs.iter().all(|f| *f == FData::NoFData) {
                return Err("empty tuple forward data must be collapsed".to_string());
            }
            members.iter().zip(fs).try_for_each(|(m, f)| check_fdata(m, f))
        }
        (x, f) => Err(format!("value of type {} has forward data {f:?}", x.ty())),
    }
}

/// Check that `rdata` is the reverse data of some tangent of `x`.
pub fn check_rdata(x: &Val, rdata: &RData) -> Result<(), String> {
    match (x, rdata) {
        (Val::F64(_), RData::F64(_)) => Ok(()),
        (Val::Nothing | Val::Bool(_) | Val::Int(_) | Val::Symbol(_) | Val::Vector(_), RData::NoRData) => {
            Ok(())
        }
        (Val::Tuple(members), RData::NoRData) => members
            .iter()
            .try_for_each(|m| check_rdata(m, &RData::NoRData)),
        (Val::Tuple(members), RData::Tuple(rs)) => {
            if members.len() != rs.len() {
                return Err(format!(
                    "tuple of {} members has reverse data for {}",
                    members.len(),
                    rs.len()
                ));
            }
            if rs.iter().all(|r| *r == RData::NoRData) {
                return Err("empty tuple reverse data must be collapsed".to_string());
            }
            members.iter().zip(rs).try_for_each(|(m, r)| check_rdata(m, r))
        }
        (x, r) => Err(format!("value of type {} has reverse data {r:?}", x.ty())),
    }
}

/// A primal value paired with the forward data of its tangent.
#[derive(Clone, Debug, PartialEq)]
pub struct CoDual {
    pub primal: Val,
    pub tangent: FData,
}

impl CoDual {
    pub fn new(primal: Val, tangent: FData) -> Self {
        CoDual { primal, tangent }
    }

    pub fn zero(primal: Val) -> Self {
        let tangent = zero_tangent(&primal).fdata();
        CoDual { primal, tangent }
    }

    pub fn check(&self) -> Result<(), Error> {
        check_fdata(&self.primal, &self.tangent).map_err(Error::TangentType)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn pair() -> Val {
        Val::tuple(vec![Val::F64(1.), Val::vector(vec![1., 2., 3.]), Val::Int(4)])
    }

    #[test]
    fn test_tangent_type_depends_only_on_type() {
        let a = Val::tuple(vec![Val::F64(1.), Val::Int(2)]);
        let b = Val::tuple(vec![Val::F64(-7.), Val::Int(9)]);
        assert_eq!(tangent_type(&a.ty()), tangent_type(&b.ty()));
        assert_eq!(zero_tangent(&a).ty(), tangent_type(&a.ty()));
        assert_eq!(
            tangent_type(&Val::tuple(vec![Val::Int(1), Val::Bool(true)]).ty()),
            TangentType::NoTangent
        );
        assert_eq!(tangent_type(&Type::Any), TangentType::Dynamic);
    }

    #[test]
    fn test_split_and_reassemble() {
        let x = pair();
        let mut rng = StdRng::seed_from_u64(0);
        let t = randn_tangent(&mut rng, &x);
        assert_eq!(t.ty(), tangent_type(&x.ty()));
        let back = Tangent::from_parts(&tangent_type(&x.ty()), t.fdata(), t.rdata()).unwrap();
        assert_eq!(back, t);

        match (t.fdata(), back.fdata()) {
            (FData::Tuple(a), FData::Tuple(b)) => match (&a[1], &b[1]) {
                (FData::Vector(a), FData::Vector(b)) => assert!(Rc::ptr_eq(a, b)),
                other => panic!("unexpected forward data {other:?}"),
            },
            other => panic!("unexpected forward data {other:?}"),
        }
    }

    #[test]
    fn test_scalar_split() {
        let t = Tangent::F64(2.5);
        assert_eq!(t.fdata(), FData::NoFData);
        assert_eq!(t.rdata(), RData::F64(2.5));
        assert_eq!(Tangent::Vector(Rc::default()).rdata(), RData::NoRData);
    }

    #[test]
    fn test_increment() {
        let x = pair();
        let mut t = zero_tangent(&x);
        t.increment_rdata(&RData::Tuple(vec![RData::F64(2.), RData::NoRData, RData::NoRData]))
            .unwrap();
        t.increment_rdata(&RData::Tuple(vec![RData::F64(0.5), RData::NoRData, RData::NoRData]))
            .unwrap();
        assert_eq!(t.rdata(), RData::Tuple(vec![RData::F64(2.5), RData::NoRData, RData::NoRData]));
        assert!(t.increment_rdata(&RData::F64(1.)).is_err());
    }

    #[test]
    fn test_rdata_add() {
        let a = RData::Tuple(vec![RData::F64(1.), RData::NoRData]);
        assert_eq!(a.add(&RData::NoRData).unwrap(), a);
        assert_eq!(
            a.add(&a).unwrap(),
            RData::Tuple(vec![RData::F64(2.), RData::NoRData])
        );
    }

    #[test]
    fn test_check_fdata() {
        let x = Val::vector(vec![1., 2.]);
        assert!(CoDual::zero(x.clone()).check().is_ok());
        let short = CoDual::new(x, FData::Vector(Rc::new(RefCell::new(vec![0.]))));
        assert!(matches!(short.check(), Err(Error::TangentType(_))));
        assert!(check_fdata(&Val::F64(1.), &FData::Tuple(vec![])).is_err());
        assert!(check_rdata(&Val::F64(1.), &RData::NoRData).is_err());
        assert!(check_rdata(&pair(), &zero_rdata(&pair())).is_ok());
    }
}
