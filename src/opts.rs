//! # Optimizer Defaults
//!
//! $$
//! \epsilon_{step},\ \epsilon_{con},\ tol_x,\ tol_f
//! $$
//!
//! Process-wide default tolerances and the scalar-or-vector tolerance
//! canonicalization used by every optimizer layer.

use ndarray::Array1;

use crate::optimize::Numeric;
use crate::optimize::OptimizeError;

/// Default step size for central-difference gradients.
pub const EPS_STEP: f64 = 1e-6;

/// Default feasibility tolerance for equality and inequality constraints.
pub const EPS_CONSTRAINT: f64 = 1e-7;

/// Default absolute tolerance on decision-variable change.
pub const XTOL_ABS: f64 = 1e-6;

/// Default absolute tolerance on objective-value change.
pub const FTOL_ABS: f64 = 1e-6;

/// Default cap on objective evaluations per solve attempt.
pub const MAX_EVAL: usize = 100_000;

/// Default retry budget for unstable solves.
pub const MAX_ATTEMPTS: usize = 100;

/// Canonicalizes a per-dimension tolerance.
///
/// `None` disables the criterion, as does a non-positive scalar. A scalar is
/// broadcast to length `n`; a vector must already have length `n`.
pub fn validate_tolerance(
  tol: Option<Numeric>,
  n: usize,
) -> Result<Option<Array1<f64>>, OptimizeError> {
  match tol {
    None => Ok(None),
    Some(Numeric::Scalar(t)) => {
      if t <= 0.0 {
        Ok(None)
      } else {
        Ok(Some(Array1::from_elem(n, t)))
      }
    }
    Some(Numeric::Vector(v)) => {
      if v.len() != n {
        return Err(OptimizeError::ShapeMismatch {
          what: "tolerance vector",
          expected: n,
          found: v.len(),
        });
      }
      Ok(Some(v))
    }
  }
}

/// Canonicalizes a scalar tolerance: `None` or a non-positive value
/// disables the criterion.
pub fn validate_scalar_tolerance(tol: Option<f64>) -> Option<f64> {
  tol.filter(|&t| t > 0.0)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn scalar_tolerance_broadcasts() {
    let tol = validate_tolerance(Some(1e-4.into()), 3).unwrap().unwrap();
    assert_eq!(tol.len(), 3);
    assert!(tol.iter().all(|&t| t == 1e-4));
  }

  #[test]
  fn non_positive_tolerance_disables_criterion() {
    assert!(validate_tolerance(Some(0.0.into()), 3).unwrap().is_none());
    assert!(validate_tolerance(Some((-1.0).into()), 3).unwrap().is_none());
    assert!(validate_tolerance(None, 3).unwrap().is_none());
    assert_eq!(validate_scalar_tolerance(Some(-1e-3)), None);
    assert_eq!(validate_scalar_tolerance(Some(1e-3)), Some(1e-3));
  }

  #[test]
  fn wrong_length_vector_is_rejected() {
    let err = validate_tolerance(Some(vec![1e-4, 1e-4].into()), 3).unwrap_err();
    assert!(matches!(
      err,
      OptimizeError::ShapeMismatch { expected: 3, found: 2, .. }
    ));
  }
}
