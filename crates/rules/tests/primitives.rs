use rand::{rngs::StdRng, SeedableRng};
use rewind::{Builtin, Val};
use rewind_autodiff::{value_and_gradient, CoDual, FData, RData, Rule, Tangent};
use rewind_interp::eval_builtin;
use rewind_rules::{check_gradient, Domain, Primitive};
use std::{cell::RefCell, rc::Rc};

#[test]
fn test_mul() {
    let (y, grad) = value_and_gradient(
        &Primitive::new(Builtin::Mul),
        &[Val::F64(5.), Val::F64(4.)],
    )
    .unwrap();
    assert_eq!(y, 20.);
    assert_eq!(grad, vec![Tangent::F64(4.), Tangent::F64(5.)]);
}

#[test]
fn test_comparison_has_no_gradient() {
    let rule = Primitive::new(Builtin::Lt);
    let args = [CoDual::zero(Val::F64(1.)), CoDual::zero(Val::F64(2.))];
    let (y, pullback) = rule.call(&args).unwrap();
    assert_eq!(y.primal, Val::Bool(true));
    let dxs = pullback(RData::NoRData).unwrap();
    assert_eq!(dxs, vec![RData::F64(0.), RData::F64(0.)]);
}

#[test]
fn test_get_index_accumulates_into_buffer() {
    let dbuf = Rc::new(RefCell::new(vec![0.5, 0., 0.]));
    let x = CoDual::new(Val::vector(vec![1., 2., 3.]), FData::Vector(Rc::clone(&dbuf)));
    let rule = Primitive::new(Builtin::GetIndex);
    let (y, pullback) = rule.call(&[x, CoDual::zero(Val::Int(2))]).unwrap();
    assert_eq!(y.primal, Val::F64(3.));
    let dxs = pullback(RData::F64(2.)).unwrap();
    assert_eq!(dxs, vec![RData::NoRData, RData::NoRData]);
    assert_eq!(*dbuf.borrow(), vec![0.5, 0., 2.]);
}

#[test]
fn test_set_index_restores_overwritten_entries() {
    let buf = Rc::new(RefCell::new(vec![1., 2., 3.]));
    let dbuf = Rc::new(RefCell::new(vec![0.25, 0.5, 0.75]));
    let x = CoDual::new(Val::Vector(Rc::clone(&buf)), FData::Vector(Rc::clone(&dbuf)));
    let v = CoDual::zero(Val::F64(9.));
    let i = CoDual::zero(Val::Int(1));

    let rule = Primitive::new(Builtin::SetIndex);
    let (y, pullback) = rule.call(&[x, v, i]).unwrap();
    assert_eq!(*buf.borrow(), vec![1., 9., 3.]);
    assert_eq!(*dbuf.borrow(), vec![0.25, 0., 0.75]);
    match y.tangent {
        FData::Vector(d) => assert!(Rc::ptr_eq(&d, &dbuf)),
        f => panic!("expected a vector tangent, got {f:?}"),
    }

    // seed the result's tangent at the written index
    dbuf.borrow_mut()[1] = 4.;
    let dxs = pullback(RData::NoRData).unwrap();
    assert_eq!(dxs, vec![RData::NoRData, RData::F64(4.), RData::NoRData]);
    assert_eq!(*dbuf.borrow(), vec![0.25, 0.5, 0.75]);
    assert_eq!(*buf.borrow(), vec![1., 2., 3.]);
}

#[test]
fn test_set_index_out_of_bounds() {
    let x = CoDual::zero(Val::vector(vec![1.]));
    let rule = Primitive::new(Builtin::SetIndex);
    let res = rule.call(&[x, CoDual::zero(Val::F64(0.)), CoDual::zero(Val::Int(3))]);
    assert!(res.is_err());
}

#[test]
fn test_tuple_and_get_field() {
    let tuple = Primitive::new(Builtin::Tuple);
    let (t, tuple_pullback) = tuple
        .call(&[CoDual::zero(Val::F64(1.)), CoDual::zero(Val::Int(7))])
        .unwrap();
    assert_eq!(t.primal, Val::tuple(vec![Val::F64(1.), Val::Int(7)]));
    assert_eq!(t.tangent, FData::NoFData);

    let field = Primitive::new(Builtin::GetField);
    let (y, field_pullback) = field.call(&[t, CoDual::zero(Val::Int(0))]).unwrap();
    assert_eq!(y.primal, Val::F64(1.));

    let dxs = field_pullback(RData::F64(3.)).unwrap();
    assert_eq!(
        dxs,
        vec![
            RData::Tuple(vec![RData::F64(3.), RData::NoRData]),
            RData::NoRData
        ]
    );
    let [dt, _] = <[RData; 2]>::try_from(dxs).unwrap();
    assert_eq!(
        tuple_pullback(dt).unwrap(),
        vec![RData::F64(3.), RData::NoRData]
    );
}

fn real_builtin(op: Builtin) -> impl Fn(&[f64]) -> f64 {
    move |v: &[f64]| {
        let args: Vec<Val> = v.iter().map(|&x| Val::F64(x)).collect();
        eval_builtin(op, &args).unwrap().f64().unwrap()
    }
}

#[test]
fn test_unary_against_finite_differences() {
    let domain = Domain::new();
    let mut rng = StdRng::seed_from_u64(0);
    let ops = [
        Builtin::Neg,
        Builtin::Sin,
        Builtin::Cos,
        Builtin::Exp,
        Builtin::Log,
        Builtin::Sqrt,
        Builtin::Acos,
    ];
    for op in ops {
        for _ in 0..20 {
            let x = domain.sample(op, &mut rng);
            let err = check_gradient(&Primitive::new(op), real_builtin(op), &[x], 1e-6).unwrap();
            assert!(err < 1e-5, "{op:?} at {x}: error {err}");
        }
    }
}

#[test]
fn test_binary_against_finite_differences() {
    let domain = Domain::new().with(Builtin::Div, 0.5, 3.);
    let mut rng = StdRng::seed_from_u64(1);
    for op in [Builtin::Add, Builtin::Sub, Builtin::Mul, Builtin::Div] {
        for _ in 0..20 {
            let point = [
                domain.sample(Builtin::Add, &mut rng),
                domain.sample(op, &mut rng),
            ];
            let err =
                check_gradient(&Primitive::new(op), real_builtin(op), &point, 1e-6).unwrap();
            assert!(err < 1e-5, "{op:?} at {point:?}: error {err}");
        }
    }
}
