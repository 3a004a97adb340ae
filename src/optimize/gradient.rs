//! # Gradient Synthesis
//!
//! $$
//! \partial_i f(x) \approx \frac{f(x+\epsilon e_i)-f(x-\epsilon e_i)}{2\epsilon}
//! $$
//!
//! Central-difference gradients for scalar functions that carry no analytic
//! gradient. A synthesized gradient costs `2n` extra evaluations per call.

use ndarray::Array1;

use super::GradientFn;
use super::ScalarFn;

/// Central-difference gradient of `f` at `x` with step `eps`.
pub fn central_difference(
  f: &dyn Fn(&Array1<f64>) -> f64,
  x: &Array1<f64>,
  eps: f64,
) -> Array1<f64> {
  let mut grad = Array1::zeros(x.len());
  let mut probe = x.clone();

  for i in 0..x.len() {
    probe[i] = x[i] + eps;
    let hi = f(&probe);
    probe[i] = x[i] - eps;
    let lo = f(&probe);
    probe[i] = x[i];
    grad[i] = (hi - lo) / (2.0 * eps);
  }

  grad
}

/// A scalar function paired with an optional analytic gradient.
///
/// Registration substitutes a synthesized gradient permanently when
/// auto-gradient mode is on and no analytic gradient was supplied.
#[derive(Clone)]
pub struct Differentiable {
  value: ScalarFn,
  gradient: Option<GradientFn>,
}

impl Differentiable {
  /// A value-only function; gradient-based solvers will fall back to
  /// finite differences at evaluation time.
  pub fn new(value: ScalarFn) -> Self {
    Self { value, gradient: None }
  }

  /// A function with a caller-supplied analytic gradient; used verbatim.
  pub fn with_gradient(value: ScalarFn, gradient: GradientFn) -> Self {
    Self { value, gradient: Some(gradient) }
  }

  /// Permanently attaches a central-difference gradient with step `eps`.
  pub fn synthesized(value: ScalarFn, eps: f64) -> Self {
    let f = value.clone();
    let gradient: GradientFn = std::sync::Arc::new(move |x| central_difference(&*f, x, eps));
    Self { value, gradient: Some(gradient) }
  }

  pub fn has_gradient(&self) -> bool {
    self.gradient.is_some()
  }

  pub fn value(&self, x: &Array1<f64>) -> f64 {
    (self.value)(x)
  }

  /// Analytic gradient when registered, central difference otherwise.
  pub fn grad(&self, x: &Array1<f64>, eps: f64) -> Array1<f64> {
    match &self.gradient {
      Some(g) => g(x),
      None => central_difference(&*self.value, x, eps),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;

  use approx::assert_abs_diff_eq;
  use ndarray::array;

  use super::*;

  #[test]
  fn central_difference_matches_analytic_gradient() {
    // f(x) = sum(x_i^2), grad = 2x, central difference error is O(eps^2)
    let f = |x: &Array1<f64>| x.dot(x);
    let x = array![1.0, -2.0, 0.5];
    let grad = central_difference(&f, &x, 1e-6);

    for i in 0..x.len() {
      assert_abs_diff_eq!(grad[i], 2.0 * x[i], epsilon = 1e-6);
    }
  }

  #[test]
  fn synthesized_gradient_is_permanent() {
    let f: ScalarFn = Arc::new(|x| x.sum());
    let d = Differentiable::synthesized(f, 1e-6);
    assert!(d.has_gradient());

    let grad = d.grad(&array![0.3, 0.7], 1e-2);
    assert_abs_diff_eq!(grad[0], 1.0, epsilon = 1e-6);
    assert_abs_diff_eq!(grad[1], 1.0, epsilon = 1e-6);
  }

  #[test]
  fn value_only_function_falls_back_to_finite_difference() {
    let f: ScalarFn = Arc::new(|x| x[0] * x[0]);
    let d = Differentiable::new(f);
    assert!(!d.has_gradient());

    let grad = d.grad(&array![3.0], 1e-6);
    assert_abs_diff_eq!(grad[0], 6.0, epsilon = 1e-5);
  }
}
