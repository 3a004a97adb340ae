//! # Optimization Engine
//!
//! $$
//! \min_{\mathbf{w}}\ f(\mathbf{w}) \quad s.t. \quad g(\mathbf{w}) \leq 0,\ h(\mathbf{w}) = 0,\ l \leq \mathbf{w} \leq u
//! $$
//!
//! Constrained nonlinear program orchestration: a program adapter over a
//! pluggable solver capability, a discrete-scenario orchestrator and a
//! two-stage regret minimizer.

use std::sync::Arc;

use ndarray::Array1;
use thiserror::Error;

pub mod base;
pub mod constraint;
pub mod gradient;
pub mod regret;
pub mod retry;
pub mod solver;
pub mod uncertainty;

/// Scalar function of the decision vector.
pub type ScalarFn = Arc<dyn Fn(&Array1<f64>) -> f64 + Send + Sync>;

/// Gradient of a scalar function of the decision vector.
pub type GradientFn = Arc<dyn Fn(&Array1<f64>) -> Array1<f64> + Send + Sync>;

/// Distance metric applied to the per-scenario regret gap. Must satisfy
/// `D(0) == 0`.
pub type DistanceFn = Arc<dyn Fn(f64) -> f64 + Send + Sync>;

/// A scalar-or-vector numeric input. Scalars broadcast to the program
/// dimension; vectors must match it exactly.
#[derive(Clone, Debug)]
pub enum Numeric {
  Scalar(f64),
  Vector(Array1<f64>),
}

impl Numeric {
  /// Broadcast to length `n`, failing with a shape error when a vector's
  /// length differs.
  pub fn broadcast(self, n: usize, what: &'static str) -> Result<Array1<f64>> {
    match self {
      Numeric::Scalar(v) => Ok(Array1::from_elem(n, v)),
      Numeric::Vector(v) => {
        if v.len() != n {
          return Err(OptimizeError::ShapeMismatch { what, expected: n, found: v.len() });
        }
        Ok(v)
      }
    }
  }
}

impl From<f64> for Numeric {
  fn from(v: f64) -> Self {
    Self::Scalar(v)
  }
}

impl From<Array1<f64>> for Numeric {
  fn from(v: Array1<f64>) -> Self {
    Self::Vector(v)
  }
}

impl From<Vec<f64>> for Numeric {
  fn from(v: Vec<f64>) -> Self {
    Self::Vector(Array1::from_vec(v))
  }
}

/// Objective direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
  Minimize,
  Maximize,
}

impl Direction {
  /// Sign applied to objective values so that every solve is a
  /// minimization internally.
  pub fn sign(self) -> f64 {
    match self {
      Direction::Minimize => 1.0,
      Direction::Maximize => -1.0,
    }
  }
}

/// Stopping criteria shared by every program. `None` disables a criterion;
/// `max_eval` of `None` means unlimited.
#[derive(Clone, Debug, Default)]
pub struct StopCriteria {
  pub xtol_abs: Option<Array1<f64>>,
  pub xtol_rel: Option<f64>,
  pub ftol_abs: Option<f64>,
  pub ftol_rel: Option<f64>,
  pub max_eval: Option<usize>,
  pub stop_val: Option<f64>,
}

/// Configuration and contract errors. Solver instability and infeasibility
/// are not errors; they flow through [`solver::Outcome`] and the NaN
/// sentinel.
#[derive(Debug, Error)]
pub enum OptimizeError {
  #[error("{what}: expected length {expected}, got {found}")]
  ShapeMismatch {
    what: &'static str,
    expected: usize,
    found: usize,
  },

  #[error("number of scenarios do not match: given {given}, expected {expected}")]
  ScenarioCount { expected: usize, given: usize },

  #[error("scenario probabilities must be non-negative with a positive sum")]
  InvalidProbability,

  #[error("invalid option: {0}")]
  InvalidOption(String),

  #[error("objective is not set; call set_min_objective or set_max_objective first")]
  ObjectiveNotSet,
}

pub type Result<T> = std::result::Result<T, OptimizeError>;

/// All-NaN sentinel returned when a solve yields no usable solution.
pub fn nan_vector(n: usize) -> Array1<f64> {
  Array1::from_elem(n, f64::NAN)
}

/// True if any entry of the vector is NaN. Callers must check a solution
/// with this before trusting it.
pub fn is_nan_solution(x: &Array1<f64>) -> bool {
  x.iter().any(|v| v.is_nan())
}
