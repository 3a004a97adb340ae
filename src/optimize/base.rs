//! # Program Adapter
//!
//! $$
//! \text{BaseOptimizer}: (f, g, h, l, u) \to x^\*
//! $$
//!
//! Wraps one solver capability for a fixed decision dimension: bounds,
//! stopping tolerances, constraint registries, objective registration and
//! the single-attempt solve. Retrying is the caller's policy, see
//! [`super::retry`].

use std::fmt;
use std::fmt::Display;
use std::sync::Arc;

use ndarray::Array1;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::thread_rng;
use rand::Rng;
use tracing::debug;
use tracing::warn;

use crate::opts;

use super::constraint::matrix_constraint;
use super::constraint::matrix_constraint_name;
use super::constraint::translate_matrix;
use super::constraint::Constraint;
use super::constraint::ConstraintKind;
use super::constraint::ConstraintSet;
use super::constraint::Rhs;
use super::gradient::Differentiable;
use super::nan_vector;
use super::solver::Algorithm;
use super::solver::Outcome;
use super::solver::ProgramSpec;
use super::Direction;
use super::GradientFn;
use super::Numeric;
use super::OptimizeError;
use super::Result;
use super::ScalarFn;
use super::StopCriteria;

/// Diagnostics of the most recent successful solve. Superseded wholesale by
/// the next success; a failed attempt leaves the previous record intact.
#[derive(Clone, Debug)]
pub struct SolveRecord {
  /// Solution vector.
  pub x: Array1<f64>,
  /// Inequality constraints sitting on their feasibility boundary.
  pub tight: Vec<String>,
  /// Constraints violated beyond tolerance, with magnitudes.
  pub violations: Vec<(String, f64)>,
}

/// Raw constrained-program adapter over a pluggable solver.
pub struct BaseOptimizer {
  n: usize,
  algorithm: Algorithm,
  auto_grad: bool,
  eps: f64,
  c_eps: f64,
  lower: Array1<f64>,
  upper: Array1<f64>,
  stop: StopCriteria,
  direction: Option<Direction>,
  objective: Option<Differentiable>,
  hin: ConstraintSet,
  heq: ConstraintSet,
  record: Option<SolveRecord>,
  verbose: bool,
}

impl BaseOptimizer {
  /// A program of dimension `n` solved by `algorithm`. Bounds start
  /// unbounded; tolerances start at the process defaults.
  pub fn new(n: usize, algorithm: Algorithm) -> Self {
    Self {
      n,
      algorithm,
      auto_grad: algorithm.requires_gradient(),
      eps: opts::EPS_STEP,
      c_eps: opts::EPS_CONSTRAINT,
      lower: Array1::from_elem(n, f64::NEG_INFINITY),
      upper: Array1::from_elem(n, f64::INFINITY),
      stop: StopCriteria {
        xtol_abs: Some(Array1::from_elem(n, opts::XTOL_ABS)),
        ftol_abs: Some(opts::FTOL_ABS),
        max_eval: Some(opts::MAX_EVAL),
        ..Default::default()
      },
      direction: None,
      objective: None,
      hin: ConstraintSet::new(),
      heq: ConstraintSet::new(),
      record: None,
      verbose: false,
    }
  }

  pub fn dim(&self) -> usize {
    self.n
  }

  pub fn algorithm(&self) -> Algorithm {
    self.algorithm
  }

  pub fn lower_bounds(&self) -> &Array1<f64> {
    &self.lower
  }

  pub fn upper_bounds(&self) -> &Array1<f64> {
    &self.upper
  }

  pub fn constraint_epsilon(&self) -> f64 {
    self.c_eps
  }

  /// Diagnostics of the last successful solve, if any.
  pub fn record(&self) -> Option<&SolveRecord> {
    self.record.as_ref()
  }

  pub fn set_verbose(&mut self, verbose: bool) -> &mut Self {
    self.verbose = verbose;
    self
  }

  /// Enables or disables automatic gradient synthesis for functions
  /// registered without an analytic gradient.
  pub fn set_auto_grad(&mut self, auto_grad: bool) -> &mut Self {
    self.auto_grad = auto_grad;
    self
  }

  /// Step size for synthesized central-difference gradients.
  pub fn set_epsilon(&mut self, eps: f64) -> Result<&mut Self> {
    if !(eps.is_finite() && eps > 0.0) {
      return Err(OptimizeError::InvalidOption(format!("eps_step must be positive, got {eps}")));
    }
    self.eps = eps;
    Ok(self)
  }

  /// Default feasibility tolerance for constraints registered without one.
  pub fn set_epsilon_constraint(&mut self, c_eps: f64) -> Result<&mut Self> {
    if !(c_eps.is_finite() && c_eps > 0.0) {
      return Err(OptimizeError::InvalidOption(format!("c_eps must be positive, got {c_eps}")));
    }
    self.c_eps = c_eps;
    Ok(self)
  }

  pub fn set_bounds(
    &mut self,
    lb: impl Into<Numeric>,
    ub: impl Into<Numeric>,
  ) -> Result<&mut Self> {
    self.set_lower_bounds(lb)?;
    self.set_upper_bounds(ub)
  }

  pub fn set_lower_bounds(&mut self, lb: impl Into<Numeric>) -> Result<&mut Self> {
    self.lower = lb.into().broadcast(self.n, "lower bounds")?;
    Ok(self)
  }

  pub fn set_upper_bounds(&mut self, ub: impl Into<Numeric>) -> Result<&mut Self> {
    self.upper = ub.into().broadcast(self.n, "upper bounds")?;
    Ok(self)
  }

  /// Absolute tolerance on decision-variable change; `None` or a
  /// non-positive scalar disables the criterion.
  pub fn set_xtol_abs(&mut self, tol: Option<Numeric>) -> Result<&mut Self> {
    self.stop.xtol_abs = opts::validate_tolerance(tol, self.n)?;
    Ok(self)
  }

  pub fn set_xtol_rel(&mut self, tol: Option<f64>) -> &mut Self {
    self.stop.xtol_rel = opts::validate_scalar_tolerance(tol);
    self
  }

  pub fn set_ftol_abs(&mut self, tol: Option<f64>) -> &mut Self {
    self.stop.ftol_abs = opts::validate_scalar_tolerance(tol);
    self
  }

  pub fn set_ftol_rel(&mut self, tol: Option<f64>) -> &mut Self {
    self.stop.ftol_rel = opts::validate_scalar_tolerance(tol);
    self
  }

  /// Cap on objective evaluations; zero or negative means unlimited.
  pub fn set_maxeval(&mut self, n: i64) -> &mut Self {
    self.stop.max_eval = (n > 0).then_some(n as usize);
    self
  }

  /// Early stop once the objective reaches at least (maximize) or at most
  /// (minimize) this value.
  pub fn set_stopval(&mut self, stopval: Option<f64>) -> &mut Self {
    self.stop.stop_val = stopval;
    self
  }

  pub(crate) fn set_stop_criteria(&mut self, stop: StopCriteria) -> &mut Self {
    self.stop = stop;
    self
  }

  pub fn set_min_objective<F>(&mut self, fun: F) -> &mut Self
  where
    F: Fn(&Array1<f64>) -> f64 + Send + Sync + 'static,
  {
    self.register_objective(Direction::Minimize, self.wrap(Arc::new(fun)))
  }

  pub fn set_max_objective<F>(&mut self, fun: F) -> &mut Self
  where
    F: Fn(&Array1<f64>) -> f64 + Send + Sync + 'static,
  {
    self.register_objective(Direction::Maximize, self.wrap(Arc::new(fun)))
  }

  /// Registers a minimization objective with an analytic gradient; no
  /// synthesis is applied.
  pub fn set_min_objective_with_gradient(&mut self, fun: ScalarFn, grad: GradientFn) -> &mut Self {
    self.register_objective(Direction::Minimize, Differentiable::with_gradient(fun, grad))
  }

  pub fn set_max_objective_with_gradient(&mut self, fun: ScalarFn, grad: GradientFn) -> &mut Self {
    self.register_objective(Direction::Maximize, Differentiable::with_gradient(fun, grad))
  }

  /// Inequality constraint `fun(x) <= tol`; default tolerance is the
  /// configured constraint epsilon.
  pub fn add_inequality_constraint<F>(&mut self, name: &str, fun: F, tol: Option<f64>) -> &mut Self
  where
    F: Fn(&Array1<f64>) -> f64 + Send + Sync + 'static,
  {
    let fun = self.wrap(Arc::new(fun));
    self.push_constraint(ConstraintKind::Inequality, name, fun, tol)
  }

  /// Equality constraint `|fun(x)| <= tol`.
  pub fn add_equality_constraint<F>(&mut self, name: &str, fun: F, tol: Option<f64>) -> &mut Self
  where
    F: Fn(&Array1<f64>) -> f64 + Send + Sync + 'static,
  {
    let fun = self.wrap(Arc::new(fun));
    self.push_constraint(ConstraintKind::Equality, name, fun, tol)
  }

  pub fn add_inequality_constraint_with_gradient(
    &mut self,
    name: &str,
    fun: ScalarFn,
    grad: GradientFn,
    tol: Option<f64>,
  ) -> &mut Self {
    let fun = Differentiable::with_gradient(fun, grad);
    self.push_constraint(ConstraintKind::Inequality, name, fun, tol)
  }

  pub fn add_equality_constraint_with_gradient(
    &mut self,
    name: &str,
    fun: ScalarFn,
    grad: GradientFn,
    tol: Option<f64>,
  ) -> &mut Self {
    let fun = Differentiable::with_gradient(fun, grad);
    self.push_constraint(ConstraintKind::Equality, name, fun, tol)
  }

  /// Linear inequality system `A x <= b`, one registered constraint per
  /// row under `A_0..A_{m-1}`.
  pub fn add_inequality_matrix_constraint(
    &mut self,
    a: &ndarray::Array2<f64>,
    b: impl Into<Rhs>,
    tol: Option<f64>,
  ) -> Result<&mut Self> {
    self.add_matrix_rows(ConstraintKind::Inequality, a, b.into(), tol)
  }

  /// Linear equality system `A x = b`, registered under `Aeq_0..`.
  pub fn add_equality_matrix_constraint(
    &mut self,
    a: &ndarray::Array2<f64>,
    b: impl Into<Rhs>,
    tol: Option<f64>,
  ) -> Result<&mut Self> {
    self.add_matrix_rows(ConstraintKind::Equality, a, b.into(), tol)
  }

  pub fn remove_all_constraints(&mut self) -> &mut Self {
    self.hin = ConstraintSet::new();
    self.heq = ConstraintSet::new();
    self
  }

  /// Bound-uniform random start; uniform over `[0, 1)` in any dimension
  /// with an infinite bound.
  pub fn random_start(&self) -> Array1<f64> {
    if self.lower.iter().chain(self.upper.iter()).any(|b| b.is_infinite()) {
      return Array1::random(self.n, Uniform::new(0.0, 1.0));
    }

    let mut rng = thread_rng();
    Array1::from_shape_fn(self.n, |i| {
      if self.lower[i] < self.upper[i] {
        rng.gen_range(self.lower[i]..self.upper[i])
      } else {
        self.lower[i]
      }
    })
  }

  /// Start-vector policy: a provided `x0` is used as-is; otherwise random
  /// within bounds when `random_start`, else the bound midpoint.
  pub fn start_vector(&self, x0: Option<Array1<f64>>, random_start: bool) -> Array1<f64> {
    match x0 {
      Some(x) => x,
      None if random_start => self.random_start(),
      None => Array1::from_shape_fn(self.n, |i| {
        if self.lower[i].is_finite() && self.upper[i].is_finite() {
          0.5 * (self.lower[i] + self.upper[i])
        } else {
          0.5
        }
      }),
    }
  }

  /// Assembles the owned program value handed to the solver.
  pub fn program_spec(&self) -> Result<ProgramSpec> {
    let direction = self.direction.ok_or(OptimizeError::ObjectiveNotSet)?;
    let objective = self.objective.clone().ok_or(OptimizeError::ObjectiveNotSet)?;

    Ok(ProgramSpec {
      n: self.n,
      direction,
      objective,
      equality: self.heq.iter().cloned().collect(),
      inequality: self.hin.iter().cloned().collect(),
      lower: self.lower.clone(),
      upper: self.upper.clone(),
      stop: self.stop.clone(),
      eps_step: self.eps,
    })
  }

  /// One solve attempt from `x0`. Records diagnostics on success; failures
  /// leave the previous record untouched.
  pub fn attempt(&mut self, x0: Array1<f64>) -> Result<Outcome> {
    let spec = self.program_spec()?;
    if x0.len() != self.n {
      return Err(OptimizeError::ShapeMismatch {
        what: "start vector",
        expected: self.n,
        found: x0.len(),
      });
    }

    let outcome = self.algorithm.solver().solve(&spec, x0);
    if let Outcome::Solved(x) = &outcome {
      let mut violations = self.heq.violations(x);
      violations.extend(self.hin.violations(x));
      self.record = Some(SolveRecord { x: x.clone(), tight: self.hin.tight(x), violations });
    }

    Ok(outcome)
  }

  /// Runs the solver once and returns the solution, or the all-NaN
  /// sentinel when no usable solution was found. Callers wanting retries
  /// should use [`super::retry::RetryPolicy`].
  pub fn optimize(&mut self, x0: Option<Array1<f64>>, random_start: bool) -> Result<Array1<f64>> {
    let start = self.start_vector(x0, random_start);
    match self.attempt(start)? {
      Outcome::Solved(x) => Ok(x),
      outcome => {
        if self.verbose {
          warn!(
            outcome = ?outcome,
            "no solution was found for the given problem; check summary() for more information"
          );
        }
        Ok(nan_vector(self.n))
      }
    }
  }

  /// Read-only snapshot of the configured program and, when available,
  /// the last solution's diagnostics.
  pub fn summary(&self) -> Summary {
    Summary {
      algorithm: self.algorithm.name(),
      direction: self.direction,
      n: self.n,
      n_eq: self.heq.len(),
      n_ineq: self.hin.len(),
      stop: self.stop.clone(),
      lower: self.lower.clone(),
      upper: self.upper.clone(),
      solution: self.record.as_ref().map(|r| r.x.clone()),
      tight: self.record.as_ref().map(|r| r.tight.clone()).unwrap_or_default(),
      violations: self.record.as_ref().map(|r| r.violations.clone()).unwrap_or_default(),
    }
  }

  fn register_objective(&mut self, direction: Direction, objective: Differentiable) -> &mut Self {
    self.direction = Some(direction);
    self.objective = Some(objective);
    self
  }

  /// Auto-gradient substitution point: permanent for the registration.
  fn wrap(&self, fun: ScalarFn) -> Differentiable {
    if self.auto_grad {
      debug!(eps = self.eps, "synthesizing central-difference gradient");
      Differentiable::synthesized(fun, self.eps)
    } else {
      Differentiable::new(fun)
    }
  }

  fn push_constraint(
    &mut self,
    kind: ConstraintKind,
    name: &str,
    fun: Differentiable,
    tol: Option<f64>,
  ) -> &mut Self {
    let constraint = Constraint {
      name: name.to_string(),
      kind,
      fun,
      tol: tol.unwrap_or(self.c_eps),
    };
    match kind {
      ConstraintKind::Inequality => self.hin.upsert(constraint),
      ConstraintKind::Equality => self.heq.upsert(constraint),
    }
    self
  }

  fn add_matrix_rows(
    &mut self,
    kind: ConstraintKind,
    a: &ndarray::Array2<f64>,
    b: Rhs,
    tol: Option<f64>,
  ) -> Result<&mut Self> {
    let rows = translate_matrix(a, b, self.n)?;
    for (i, (row, rhs)) in rows.into_iter().enumerate() {
      let name = matrix_constraint_name(kind, i);
      let fun = self.wrap(matrix_constraint(row, rhs));
      self.push_constraint(kind, &name, fun, tol);
    }
    Ok(self)
  }
}

/// Read-only report of a program's configuration and latest solution.
#[derive(Clone, Debug)]
pub struct Summary {
  pub algorithm: &'static str,
  pub direction: Option<Direction>,
  pub n: usize,
  pub n_eq: usize,
  pub n_ineq: usize,
  pub stop: StopCriteria,
  pub lower: Array1<f64>,
  pub upper: Array1<f64>,
  pub solution: Option<Array1<f64>>,
  pub tight: Vec<String>,
  pub violations: Vec<(String, f64)>,
}

impl Display for Summary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "Optimizer: {}", self.algorithm)?;
    match self.direction {
      Some(Direction::Maximize) => writeln!(f, "Objective: maximize")?,
      Some(Direction::Minimize) => writeln!(f, "Objective: minimize")?,
      None => writeln!(f, "Objective: unset")?,
    }
    writeln!(f, "Variables: {}", self.n)?;
    writeln!(f, "Equality constraints: {}", self.n_eq)?;
    writeln!(f, "Inequality constraints: {}", self.n_ineq)?;
    writeln!(
      f,
      "xtol_abs: {:?}  xtol_rel: {:?}  ftol_abs: {:?}  ftol_rel: {:?}",
      self.stop.xtol_abs.as_ref().map(|t| t.to_vec()),
      self.stop.xtol_rel,
      self.stop.ftol_abs,
      self.stop.ftol_rel
    )?;
    writeln!(
      f,
      "max_eval: {:?}  stop_val: {:?}",
      self.stop.max_eval, self.stop.stop_val
    )?;
    writeln!(f, "Lower bounds: {}", self.lower)?;
    writeln!(f, "Upper bounds: {}", self.upper)?;

    if let Some(x) = &self.solution {
      writeln!(f, "Solution: {x}")?;
      if !self.tight.is_empty() {
        writeln!(f, "Tight constraints: {}", self.tight.join(", "))?;
      }
      for (name, magnitude) in &self.violations {
        writeln!(f, "Violated: {name} by {magnitude:.3e}")?;
      }
    } else {
      writeln!(f, "Solution: none")?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use ndarray::array;

  use super::super::is_nan_solution;
  use super::*;

  #[test]
  fn scalar_bounds_broadcast_and_vectors_are_validated() {
    let mut opt = BaseOptimizer::new(3, Algorithm::AugLag);
    opt.set_bounds(0.0, 1.0).unwrap();
    assert_eq!(opt.lower_bounds(), &array![0.0, 0.0, 0.0]);
    assert_eq!(opt.upper_bounds(), &array![1.0, 1.0, 1.0]);

    assert!(matches!(
      opt.set_lower_bounds(vec![0.0, 0.0]),
      Err(OptimizeError::ShapeMismatch { expected: 3, found: 2, .. })
    ));
  }

  #[test]
  fn random_start_respects_finite_bounds() {
    let mut opt = BaseOptimizer::new(4, Algorithm::AugLag);
    opt.set_bounds(array![0.0, 1.0, -2.0, 0.5], array![0.5, 2.0, -1.0, 0.6]).unwrap();

    for _ in 0..20 {
      let x = opt.random_start();
      for i in 0..4 {
        assert!(x[i] >= opt.lower_bounds()[i] && x[i] <= opt.upper_bounds()[i]);
      }
    }
  }

  #[test]
  fn solution_stays_within_bounds() {
    // min sum(x^2) over [1, 2]^2 pins both variables at the lower bound
    let mut opt = BaseOptimizer::new(2, Algorithm::AugLag);
    opt.set_bounds(1.0, 2.0).unwrap();
    opt.set_min_objective(|x| x.dot(x));

    let w = opt.optimize(Some(array![1.5, 1.5]), false).unwrap();
    assert_abs_diff_eq!(w[0], 1.0, epsilon = 1e-4);
    assert_abs_diff_eq!(w[1], 1.0, epsilon = 1e-4);
  }

  #[test]
  fn maximize_linear_returns_under_budget_constraint() {
    let r = array![0.05, 0.10];
    let mut opt = BaseOptimizer::new(2, Algorithm::AugLag);
    opt.set_bounds(0.0, 1.0).unwrap();
    opt.set_max_objective(move |x| r.dot(x));
    opt.add_equality_constraint("budget", |x| x.sum() - 1.0, None);

    let w = opt.optimize(Some(array![0.5, 0.5]), false).unwrap();
    assert_abs_diff_eq!(w[0], 0.0, epsilon = 1e-3);
    assert_abs_diff_eq!(w[1], 1.0, epsilon = 1e-3);
    assert_abs_diff_eq!(w.sum(), 1.0, epsilon = 1e-6);
  }

  #[test]
  fn solve_without_objective_is_a_contract_error() {
    let mut opt = BaseOptimizer::new(2, Algorithm::AugLag);
    assert!(matches!(
      opt.optimize(Some(array![0.5, 0.5]), false),
      Err(OptimizeError::ObjectiveNotSet)
    ));
  }

  #[test]
  fn failed_attempt_keeps_previous_record() {
    let mut opt = BaseOptimizer::new(2, Algorithm::AugLag);
    opt.set_bounds(0.0, 1.0).unwrap();
    opt.set_min_objective(|x| x.dot(x));

    let first = opt.optimize(Some(array![0.5, 0.5]), false).unwrap();
    assert!(!is_nan_solution(&first));
    let recorded = opt.record().unwrap().x.clone();

    opt.set_min_objective(|_| f64::NAN);
    let second = opt.optimize(Some(array![0.5, 0.5]), false).unwrap();
    assert!(is_nan_solution(&second));
    assert_eq!(opt.record().unwrap().x, recorded);
  }

  #[test]
  fn summary_reports_program_setup() {
    let mut opt = BaseOptimizer::new(2, Algorithm::AugLag);
    opt.set_bounds(0.0, 1.0).unwrap();
    opt.set_min_objective(|x| x.sum());
    opt.add_equality_constraint("budget", |x| x.sum() - 1.0, None);

    let text = opt.summary().to_string();
    assert!(text.contains("augmented-lagrangian"));
    assert!(text.contains("Equality constraints: 1"));
    assert!(text.contains("Solution: none"));
  }

  #[test]
  fn summary_renders_a_zero_dimension_program() {
    let opt = BaseOptimizer::new(0, Algorithm::AugLag);
    let text = opt.summary().to_string();
    assert!(text.contains("Variables: 0"));
    assert!(text.contains("xtol_abs"));
  }
}
