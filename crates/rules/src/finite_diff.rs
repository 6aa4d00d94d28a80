//! Numerical gradients for checking derived ones.

use rewind::Val;
use rewind_autodiff::{value_and_gradient, Error, Rule, Tangent};

/// Central finite differences of `f` at `point`.
///
/// ```
/// use rewind_rules::finite_diff_grad;
///
/// let f = |v: &[f64]| v[0] * v[0] + v[1] * v[1];
/// let grads = finite_diff_grad(f, &[3.0, 4.0], 1e-7);
/// assert!((grads[0] - 6.0).abs() < 1e-5);
/// assert!((grads[1] - 8.0).abs() < 1e-5);
/// ```
pub fn finite_diff_grad<F>(f: F, point: &[f64], eps: f64) -> Vec<f64>
where
    F: Fn(&[f64]) -> f64,
{
    let mut grads = Vec::with_capacity(point.len());
    let mut perturbed = point.to_vec();
    for i in 0..point.len() {
        perturbed[i] = point[i] + eps;
        let plus = f(&perturbed);
        perturbed[i] = point[i] - eps;
        let minus = f(&perturbed);
        perturbed[i] = point[i];
        grads.push((plus - minus) / (2. * eps));
    }
    grads
}

/// Largest absolute elementwise difference, or infinity if the lengths differ.
pub fn max_grad_error(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() {
        return f64::INFINITY;
    }
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0., f64::max)
}

/// Largest difference between the gradient `rule` computes at `point` and central finite
/// differences of `f`, which must compute the same function as `rule` on real arguments.
pub fn check_gradient<F>(rule: &dyn Rule, f: F, point: &[f64], eps: f64) -> Result<f64, Error>
where
    F: Fn(&[f64]) -> f64,
{
    let args: Vec<Val> = point.iter().map(|&x| Val::F64(x)).collect();
    let (_, grads) = value_and_gradient(rule, &args)?;
    let grads = grads
        .iter()
        .map(|t| match *t {
            Tangent::F64(x) => Ok(x),
            ref t => Err(Error::TangentType(format!("expected a real gradient, got {t:?}"))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(max_grad_error(&grads, &finite_diff_grad(f, point, eps)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcendental() {
        let f = |v: &[f64]| v[0].sin() * v[0].exp();
        let grads = finite_diff_grad(f, &[1.0], 1e-7);
        let expected = (1.0_f64.cos() + 1.0_f64.sin()) * 1.0_f64.exp();
        assert!((grads[0] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_max_grad_error() {
        assert!((max_grad_error(&[1.0, 2.0, 3.0], &[1.1, 2.0, 2.8]) - 0.2).abs() < 1e-10);
        assert_eq!(max_grad_error(&[1.0], &[]), f64::INFINITY);
    }
}
