//! # Retry Policy
//!
//! $$
//! x_0 \sim \mathcal{U}(l, u) \ \text{until solved or attempts exhausted}
//! $$
//!
//! Shared restart policy for unstable solves: perturb the start vector and
//! re-attempt, up to a configured budget. Exhaustion and infeasibility both
//! yield the NaN sentinel, never a panic.

use ndarray::Array1;
use tracing::debug;
use tracing::warn;

use super::base::BaseOptimizer;
use super::nan_vector;
use super::solver::Outcome;
use super::OptimizeError;
use super::Result;

/// Restart budget and diagnostics flag.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
  max_attempts: usize,
  verbose: bool,
}

impl RetryPolicy {
  pub fn new(max_attempts: usize) -> Result<Self> {
    if max_attempts == 0 {
      return Err(OptimizeError::InvalidOption(
        "max_attempts must be at least 1".to_string(),
      ));
    }
    Ok(Self { max_attempts, verbose: false })
  }

  pub fn verbose(mut self, verbose: bool) -> Self {
    self.verbose = verbose;
    self
  }

  pub fn max_attempts(&self) -> usize {
    self.max_attempts
  }

  /// Drives `model` to a solution. Each `Unstable` attempt is followed by
  /// a bound-uniform restart; an `Infeasible` report stops the loop
  /// immediately since another start will not change feasibility
  /// semantics. Returns the NaN sentinel when no attempt solved.
  pub fn run(
    &self,
    model: &mut BaseOptimizer,
    x0: Option<Array1<f64>>,
    random_start: bool,
  ) -> Result<Array1<f64>> {
    let mut start = model.start_vector(x0, random_start);

    for attempt in 0..self.max_attempts {
      match model.attempt(start)? {
        Outcome::Solved(x) => return Ok(x),
        Outcome::Unstable => {
          debug!(attempt, "solver unstable; restarting from perturbed x0");
          start = model.random_start();
        }
        Outcome::Infeasible => break,
      }
    }

    if self.verbose {
      warn!(
        max_attempts = self.max_attempts,
        "no solution was found for the given problem; check summary() for more information"
      );
    }
    Ok(nan_vector(model.dim()))
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::AtomicUsize;
  use std::sync::atomic::Ordering;
  use std::sync::Arc;

  use approx::assert_abs_diff_eq;
  use ndarray::array;

  use super::super::is_nan_solution;
  use super::super::solver::Algorithm;
  use super::*;

  #[test]
  fn retry_budget_must_be_positive() {
    assert!(RetryPolicy::new(0).is_err());
    assert_eq!(RetryPolicy::new(7).unwrap().max_attempts(), 7);
  }

  #[test]
  fn always_unstable_program_exhausts_exactly_max_attempts() {
    // the objective is evaluated once per attempt before anything else, so
    // the evaluation count equals the attempt count
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();

    let mut model = BaseOptimizer::new(2, Algorithm::AugLag);
    model.set_bounds(0.0, 1.0).unwrap();
    model.set_min_objective(move |_| {
      seen.fetch_add(1, Ordering::Relaxed);
      f64::NAN
    });

    let policy = RetryPolicy::new(5).unwrap();
    let w = policy.run(&mut model, Some(array![0.5, 0.5]), false).unwrap();

    assert_eq!(w.len(), 2);
    assert!(is_nan_solution(&w));
    assert_eq!(calls.load(Ordering::Relaxed), 5);
  }

  #[test]
  fn solved_on_first_attempt_does_not_retry() {
    let mut model = BaseOptimizer::new(2, Algorithm::AugLag);
    model.set_bounds(0.0, 1.0).unwrap();
    model.set_min_objective(|x| x.dot(x));

    let policy = RetryPolicy::new(3).unwrap();
    let w = policy.run(&mut model, Some(array![0.7, 0.7]), false).unwrap();
    assert_abs_diff_eq!(w[0], 0.0, epsilon = 1e-4);
    assert_abs_diff_eq!(w[1], 0.0, epsilon = 1e-4);
  }

  #[test]
  fn infeasible_program_yields_sentinel_without_retrying() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();

    let mut model = BaseOptimizer::new(2, Algorithm::AugLag);
    model.set_bounds(0.0, 1.0).unwrap();
    model.set_min_objective(move |x| {
      seen.fetch_add(1, Ordering::Relaxed);
      x.dot(x)
    });
    // x0 >= 2 cannot hold inside [0, 1]
    model.add_inequality_constraint("floor", |x| 2.0 - x[0], None);

    let policy = RetryPolicy::new(10).unwrap();
    let w = policy.run(&mut model, Some(array![0.5, 0.5]), false).unwrap();
    assert!(is_nan_solution(&w));
    // a single attempt ran; the feasibility verdict is not retried
    assert!(calls.load(Ordering::Relaxed) > 0);
  }
}
