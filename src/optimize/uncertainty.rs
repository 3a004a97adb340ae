//! # Discrete Uncertainty
//!
//! $$
//! \{(\text{cube}_s, p_s)\}_{s=1}^{S} \ \to\ S \ \text{independent programs}
//! $$
//!
//! Orchestrates a probability-weighted set of scenarios. Objective and
//! constraint functions are registered once together with one data cube per
//! scenario; `build(index)` materializes the independent program for a
//! single scenario by binding every registered function to that scenario's
//! cube.

use std::sync::Arc;

use ndarray::Array1;

use crate::scenario::ScenarioCube;

use super::base::BaseOptimizer;
use super::constraint::matrix_constraint;
use super::constraint::matrix_constraint_name;
use super::constraint::translate_matrix;
use super::constraint::Constraint;
use super::constraint::ConstraintKind;
use super::constraint::ConstraintSet;
use super::constraint::Rhs;
use super::gradient::Differentiable;
use super::solver::Algorithm;
use super::Direction;
use super::Numeric;
use super::OptimizeError;
use super::Result;
use super::ScalarFn;
use super::StopCriteria;

use crate::opts;

/// A function of one scenario's data cube and the weight vector, bound to a
/// specific cube at registration time.
pub type CubeFn = Arc<dyn Fn(&ScenarioCube, &Array1<f64>) -> f64 + Send + Sync>;

/// Binds a cube function to one scenario's data. The cube is shared, never
/// copied; scenario data stays read-only for the closure's whole life.
fn bind(fun: CubeFn, cube: Arc<ScenarioCube>) -> ScalarFn {
  Arc::new(move |x: &Array1<f64>| fun(&cube, x))
}

/// One named constraint with its per-scenario bound functions.
struct ScenarioConstraint {
  name: String,
  fns: Vec<ScalarFn>,
}

/// Builder for the per-scenario programs of a discrete-uncertainty
/// optimization. Bounds and tolerances are shared across scenarios;
/// objectives and constraints are bound per scenario.
pub struct ModelBuilder {
  num_assets: usize,
  num_scenarios: usize,
  algorithm: Algorithm,
  auto_grad: bool,
  eps: f64,
  c_eps: f64,
  stop: StopCriteria,
  lower: Array1<f64>,
  upper: Array1<f64>,
  prob: Array1<f64>,
  direction: Option<Direction>,
  objectives: Vec<ScalarFn>,
  hin: Vec<ScenarioConstraint>,
  heq: Vec<ScenarioConstraint>,
  matrix_in: Vec<(String, Array1<f64>, f64)>,
  matrix_eq: Vec<(String, Array1<f64>, f64)>,
  sum_to_1: bool,
  verbose: bool,
}

impl std::fmt::Debug for ModelBuilder {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ModelBuilder")
      .field("num_assets", &self.num_assets)
      .field("num_scenarios", &self.num_scenarios)
      .finish_non_exhaustive()
  }
}

impl ModelBuilder {
  pub fn new(num_assets: usize, num_scenarios: usize, algorithm: Algorithm) -> Self {
    Self {
      num_assets,
      num_scenarios,
      algorithm,
      auto_grad: algorithm.requires_gradient(),
      eps: opts::EPS_STEP,
      c_eps: opts::EPS_CONSTRAINT,
      stop: StopCriteria {
        xtol_abs: Some(Array1::from_elem(num_assets, opts::XTOL_ABS)),
        ftol_abs: Some(opts::FTOL_ABS),
        max_eval: Some(opts::MAX_EVAL),
        ..Default::default()
      },
      lower: Array1::zeros(num_assets),
      upper: Array1::from_elem(num_assets, 1.0),
      prob: Array1::from_elem(num_scenarios, 1.0 / num_scenarios as f64),
      direction: None,
      objectives: Vec::new(),
      hin: Vec::new(),
      heq: Vec::new(),
      matrix_in: Vec::new(),
      matrix_eq: Vec::new(),
      sum_to_1: true,
      verbose: false,
    }
  }

  pub fn num_assets(&self) -> usize {
    self.num_assets
  }

  pub fn num_scenarios(&self) -> usize {
    self.num_scenarios
  }

  pub fn algorithm(&self) -> Algorithm {
    self.algorithm
  }

  pub fn direction(&self) -> Option<Direction> {
    self.direction
  }

  pub fn prob(&self) -> &Array1<f64> {
    &self.prob
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

  pub fn epsilon(&self) -> f64 {
    self.eps
  }

  pub(crate) fn stop_criteria(&self) -> &StopCriteria {
    &self.stop
  }

  /// Bound objective function of scenario `index`.
  pub fn objective(&self, index: usize) -> Option<ScalarFn> {
    self.objectives.get(index).cloned()
  }

  pub fn set_verbose(&mut self, verbose: bool) -> &mut Self {
    self.verbose = verbose;
    self
  }

  pub fn set_auto_grad(&mut self, auto_grad: bool) -> &mut Self {
    self.auto_grad = auto_grad;
    self
  }

  pub fn set_epsilon(&mut self, eps: f64) -> Result<&mut Self> {
    if !(eps.is_finite() && eps > 0.0) {
      return Err(OptimizeError::InvalidOption(format!("eps_step must be positive, got {eps}")));
    }
    self.eps = eps;
    Ok(self)
  }

  pub fn set_epsilon_constraint(&mut self, c_eps: f64) -> Result<&mut Self> {
    if !(c_eps.is_finite() && c_eps > 0.0) {
      return Err(OptimizeError::InvalidOption(format!("c_eps must be positive, got {c_eps}")));
    }
    self.c_eps = c_eps;
    Ok(self)
  }

  /// Scenario probabilities; `None` resets to uniform. Entries must be
  /// non-negative with a positive sum and are renormalized to sum to 1.
  pub fn set_prob(&mut self, prob: Option<Array1<f64>>) -> Result<&mut Self> {
    match prob {
      None => {
        self.prob = Array1::from_elem(self.num_scenarios, 1.0 / self.num_scenarios as f64);
      }
      Some(p) => {
        if p.len() != self.num_scenarios {
          return Err(OptimizeError::ShapeMismatch {
            what: "probability vector",
            expected: self.num_scenarios,
            found: p.len(),
          });
        }
        let total = p.sum();
        if p.iter().any(|&v| v < 0.0 || !v.is_finite()) || total <= 0.0 {
          return Err(OptimizeError::InvalidProbability);
        }
        self.prob = p / total;
      }
    }
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
    self.lower = lb.into().broadcast(self.num_assets, "lower bounds")?;
    Ok(self)
  }

  pub fn set_upper_bounds(&mut self, ub: impl Into<Numeric>) -> Result<&mut Self> {
    self.upper = ub.into().broadcast(self.num_assets, "upper bounds")?;
    Ok(self)
  }

  pub fn set_xtol_abs(&mut self, tol: Option<Numeric>) -> Result<&mut Self> {
    self.stop.xtol_abs = opts::validate_tolerance(tol, self.num_assets)?;
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

  pub fn set_maxeval(&mut self, n: i64) -> &mut Self {
    self.stop.max_eval = (n > 0).then_some(n as usize);
    self
  }

  pub fn set_stopval(&mut self, stopval: Option<f64>) -> &mut Self {
    self.stop.stop_val = stopval;
    self
  }

  /// Whether every built program carries a "weights sum to 1" equality
  /// constraint.
  pub fn set_sum_to_1(&mut self, sum_to_1: bool) -> &mut Self {
    self.sum_to_1 = sum_to_1;
    self
  }

  pub fn set_max_objective<F>(
    &mut self,
    fun: F,
    scenarios: &[Arc<ScenarioCube>],
  ) -> Result<&mut Self>
  where
    F: Fn(&ScenarioCube, &Array1<f64>) -> f64 + Send + Sync + 'static,
  {
    self.register_objective(Direction::Maximize, Arc::new(fun), scenarios)
  }

  pub fn set_min_objective<F>(
    &mut self,
    fun: F,
    scenarios: &[Arc<ScenarioCube>],
  ) -> Result<&mut Self>
  where
    F: Fn(&ScenarioCube, &Array1<f64>) -> f64 + Send + Sync + 'static,
  {
    self.register_objective(Direction::Minimize, Arc::new(fun), scenarios)
  }

  /// Inequality constraint bound to every scenario's cube; requires one
  /// cube per scenario.
  pub fn add_inequality_constraint<F>(
    &mut self,
    name: &str,
    fun: F,
    scenarios: &[Arc<ScenarioCube>],
  ) -> Result<&mut Self>
  where
    F: Fn(&ScenarioCube, &Array1<f64>) -> f64 + Send + Sync + 'static,
  {
    let fns = self.bind_all(Arc::new(fun), scenarios)?;
    upsert(&mut self.hin, name, fns);
    Ok(self)
  }

  pub fn add_equality_constraint<F>(
    &mut self,
    name: &str,
    fun: F,
    scenarios: &[Arc<ScenarioCube>],
  ) -> Result<&mut Self>
  where
    F: Fn(&ScenarioCube, &Array1<f64>) -> f64 + Send + Sync + 'static,
  {
    let fns = self.bind_all(Arc::new(fun), scenarios)?;
    upsert(&mut self.heq, name, fns);
    Ok(self)
  }

  /// Linear inequality system broadcast identically to all scenarios.
  pub fn add_inequality_matrix_constraint(
    &mut self,
    a: &ndarray::Array2<f64>,
    b: impl Into<Rhs>,
  ) -> Result<&mut Self> {
    let rows = translate_matrix(a, b.into(), self.num_assets)?;
    for (i, (row, rhs)) in rows.into_iter().enumerate() {
      let name = matrix_constraint_name(ConstraintKind::Inequality, i);
      self.matrix_in.push((name, row, rhs));
    }
    Ok(self)
  }

  pub fn add_equality_matrix_constraint(
    &mut self,
    a: &ndarray::Array2<f64>,
    b: impl Into<Rhs>,
  ) -> Result<&mut Self> {
    let rows = translate_matrix(a, b.into(), self.num_assets)?;
    for (i, (row, rhs)) in rows.into_iter().enumerate() {
      let name = matrix_constraint_name(ConstraintKind::Equality, i);
      self.matrix_eq.push((name, row, rhs));
    }
    Ok(self)
  }

  pub fn remove_all_constraints(&mut self) -> &mut Self {
    self.hin.clear();
    self.heq.clear();
    self.matrix_in.clear();
    self.matrix_eq.clear();
    self
  }

  /// Materializes the independent program for scenario `index`.
  pub fn build(&self, index: usize) -> Result<BaseOptimizer> {
    if index >= self.num_scenarios {
      return Err(OptimizeError::InvalidOption(format!(
        "scenario index {index} out of range for {} scenarios",
        self.num_scenarios
      )));
    }
    let direction = self.direction.ok_or(OptimizeError::ObjectiveNotSet)?;
    let objective = self.objectives[index].clone();

    let mut model = BaseOptimizer::new(self.num_assets, self.algorithm);
    model.set_verbose(self.verbose);
    model.set_auto_grad(self.auto_grad);
    model.set_epsilon(self.eps)?;
    model.set_epsilon_constraint(self.c_eps)?;
    model.set_stop_criteria(self.stop.clone());
    model.set_bounds(self.lower.clone(), self.upper.clone())?;

    for (name, row, rhs) in &self.matrix_in {
      let g = matrix_constraint(row.clone(), *rhs);
      model.add_inequality_constraint(name, move |x: &Array1<f64>| g(x), None);
    }
    for (name, row, rhs) in &self.matrix_eq {
      let h = matrix_constraint(row.clone(), *rhs);
      model.add_equality_constraint(name, move |x: &Array1<f64>| h(x), None);
    }

    for entry in &self.hin {
      let g = entry.fns[index].clone();
      model.add_inequality_constraint(&entry.name, move |x: &Array1<f64>| g(x), None);
    }
    for entry in &self.heq {
      let h = entry.fns[index].clone();
      model.add_equality_constraint(&entry.name, move |x: &Array1<f64>| h(x), None);
    }

    if self.sum_to_1 {
      model.add_equality_constraint("sum_to_1", |x: &Array1<f64>| x.sum() - 1.0, None);
    }

    match direction {
      Direction::Maximize => model.set_max_objective(move |x: &Array1<f64>| objective(x)),
      Direction::Minimize => model.set_min_objective(move |x: &Array1<f64>| objective(x)),
    };

    Ok(model)
  }

  /// The scenario-independent constraints (matrix rows and the optional
  /// budget constraint) as a diagnostic set, used to judge the final
  /// blended weights.
  pub fn scenario_free_constraints(&self) -> ConstraintSet {
    let mut set = ConstraintSet::new();
    for (kind, rows) in [
      (ConstraintKind::Inequality, &self.matrix_in),
      (ConstraintKind::Equality, &self.matrix_eq),
    ] {
      for (name, row, rhs) in rows {
        set.upsert(Constraint {
          name: name.clone(),
          kind,
          fun: Differentiable::new(matrix_constraint(row.clone(), *rhs)),
          tol: self.c_eps,
        });
      }
    }
    if self.sum_to_1 {
      set.upsert(Constraint {
        name: "sum_to_1".to_string(),
        kind: ConstraintKind::Equality,
        fun: Differentiable::new(Arc::new(|x: &Array1<f64>| x.sum() - 1.0)),
        tol: self.c_eps,
      });
    }
    set
  }

  fn register_objective(
    &mut self,
    direction: Direction,
    fun: CubeFn,
    scenarios: &[Arc<ScenarioCube>],
  ) -> Result<&mut Self> {
    let objectives = self.bind_all(fun, scenarios)?;
    self.direction = Some(direction);
    self.objectives = objectives;
    Ok(self)
  }

  /// Binds one function to every scenario cube. The count check runs
  /// before any registry mutation, so a failed registration leaves prior
  /// state untouched.
  fn bind_all(&self, fun: CubeFn, scenarios: &[Arc<ScenarioCube>]) -> Result<Vec<ScalarFn>> {
    if scenarios.len() != self.num_scenarios {
      return Err(OptimizeError::ScenarioCount {
        expected: self.num_scenarios,
        given: scenarios.len(),
      });
    }
    Ok(
      scenarios
        .iter()
        .map(|cube| bind(fun.clone(), cube.clone()))
        .collect(),
    )
  }
}

fn upsert(registry: &mut Vec<ScenarioConstraint>, name: &str, fns: Vec<ScalarFn>) {
  match registry.iter_mut().find(|c| c.name == name) {
    Some(slot) => slot.fns = fns,
    None => registry.push(ScenarioConstraint { name: name.to_string(), fns }),
  }
}
