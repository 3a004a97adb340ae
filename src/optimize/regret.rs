//! # Regret Minimization
//!
//! $$
//! \min_w \sum_{s=1}^{S} p_s \, D\big(f_s(w_s^\ast) - f_s(w)\big)
//! $$
//!
//! Two-stage procedure over discrete scenarios. Stage one solves every
//! scenario's program independently for the scenario optima \\(w_s^\ast\\).
//! Stage two searches for a single weight vector whose probability-weighted
//! distance to those optima is smallest, either over convex blends of the
//! stage-one solutions (approximate) or over the full weight space (actual).

use std::fmt;
use std::sync::Arc;

use ndarray::Array1;
use ndarray::Array2;

use crate::opts;
use crate::scenario::ScenarioCube;

use super::base::BaseOptimizer;
use super::constraint::ConstraintKind;
use super::is_nan_solution;
use super::retry::RetryPolicy;
use super::solver::Algorithm;
use super::uncertainty::ModelBuilder;
use super::Direction;
use super::DistanceFn;
use super::Numeric;
use super::OptimizeError;
use super::Result;
use super::StopCriteria;

/// Search space of the second stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegretMode {
  /// Optimize proportions over convex blends of the scenario optima. An
  /// S-dimensional problem, cheap and usually close to the true optimum.
  Approx,
  /// Optimize over the full weight space under the original bounds and
  /// scenario-independent constraints.
  Actual,
}

impl RegretMode {
  pub fn from_str(s: &str) -> Self {
    match s.to_lowercase().as_str() {
      "actual" | "exact" | "full" => RegretMode::Actual,
      _ => RegretMode::Approx,
    }
  }
}

/// Everything the last regret solve produced.
#[derive(Clone, Debug)]
pub struct RegretResult {
  /// Final weight vector, the NaN sentinel when no solution was found.
  pub weights: Array1<f64>,
  /// Scenario blend proportions; `None` for [`RegretMode::Actual`].
  pub proportions: Option<Array1<f64>>,
  /// Stage-one optima, one row per scenario.
  pub scenario_solutions: Array2<f64>,
  /// Objective value of each scenario at its own optimum.
  pub scenario_values: Array1<f64>,
  /// Scenario-independent constraints tight at the final weights.
  pub tight: Vec<String>,
  /// Scenario-independent constraints violated at the final weights.
  pub violations: Vec<(String, f64)>,
}

/// Two-stage regret minimizer over a discrete scenario set. All scenario
/// and constraint registration is delegated to the inner [`ModelBuilder`].
pub struct RegretOptimizer {
  builder: ModelBuilder,
  max_attempts: usize,
  verbose: bool,
  result: Option<RegretResult>,
}

impl RegretOptimizer {
  pub fn new(num_assets: usize, num_scenarios: usize, algorithm: Algorithm) -> Self {
    Self {
      builder: ModelBuilder::new(num_assets, num_scenarios, algorithm),
      max_attempts: opts::MAX_ATTEMPTS,
      verbose: false,
      result: None,
    }
  }

  pub fn num_assets(&self) -> usize {
    self.builder.num_assets()
  }

  pub fn num_scenarios(&self) -> usize {
    self.builder.num_scenarios()
  }

  pub fn prob(&self) -> &Array1<f64> {
    self.builder.prob()
  }

  pub fn max_attempts(&self) -> usize {
    self.max_attempts
  }

  /// Result of the last [`optimize`](Self::optimize) call.
  pub fn result(&self) -> Option<&RegretResult> {
    self.result.as_ref()
  }

  /// The per-scenario program builder, for registration calls not
  /// mirrored here.
  pub fn model(&mut self) -> &mut ModelBuilder {
    &mut self.builder
  }

  pub fn set_max_attempts(&mut self, max_attempts: usize) -> Result<&mut Self> {
    if max_attempts == 0 {
      return Err(OptimizeError::InvalidOption(
        "max_attempts must be at least 1".to_string(),
      ));
    }
    self.max_attempts = max_attempts;
    Ok(self)
  }

  pub fn set_verbose(&mut self, verbose: bool) -> &mut Self {
    self.verbose = verbose;
    self.builder.set_verbose(verbose);
    self
  }

  pub fn set_prob(&mut self, prob: Option<Array1<f64>>) -> Result<&mut Self> {
    self.builder.set_prob(prob)?;
    Ok(self)
  }

  pub fn set_bounds(
    &mut self,
    lb: impl Into<Numeric>,
    ub: impl Into<Numeric>,
  ) -> Result<&mut Self> {
    self.builder.set_bounds(lb, ub)?;
    Ok(self)
  }

  pub fn set_sum_to_1(&mut self, sum_to_1: bool) -> &mut Self {
    self.builder.set_sum_to_1(sum_to_1);
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
    self.builder.set_max_objective(fun, scenarios)?;
    Ok(self)
  }

  pub fn set_min_objective<F>(
    &mut self,
    fun: F,
    scenarios: &[Arc<ScenarioCube>],
  ) -> Result<&mut Self>
  where
    F: Fn(&ScenarioCube, &Array1<f64>) -> f64 + Send + Sync + 'static,
  {
    self.builder.set_min_objective(fun, scenarios)?;
    Ok(self)
  }

  pub fn add_inequality_constraint<F>(
    &mut self,
    name: &str,
    fun: F,
    scenarios: &[Arc<ScenarioCube>],
  ) -> Result<&mut Self>
  where
    F: Fn(&ScenarioCube, &Array1<f64>) -> f64 + Send + Sync + 'static,
  {
    self.builder.add_inequality_constraint(name, fun, scenarios)?;
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
    self.builder.add_equality_constraint(name, fun, scenarios)?;
    Ok(self)
  }

  pub fn add_inequality_matrix_constraint(
    &mut self,
    a: &Array2<f64>,
    b: impl Into<super::constraint::Rhs>,
  ) -> Result<&mut Self> {
    self.builder.add_inequality_matrix_constraint(a, b)?;
    Ok(self)
  }

  pub fn add_equality_matrix_constraint(
    &mut self,
    a: &Array2<f64>,
    b: impl Into<super::constraint::Rhs>,
  ) -> Result<&mut Self> {
    self.builder.add_equality_matrix_constraint(a, b)?;
    Ok(self)
  }

  /// Runs both stages and returns the final weight vector. `dist` shapes
  /// the per-scenario gap before probability weighting; the default is the
  /// squared gap. Returns the NaN sentinel when either stage finds no
  /// solution.
  pub fn optimize(
    &mut self,
    x0: Option<Array1<f64>>,
    random_start: bool,
    mode: RegretMode,
    dist: Option<DistanceFn>,
  ) -> Result<Array1<f64>> {
    let direction = self.builder.direction().ok_or(OptimizeError::ObjectiveNotSet)?;
    let s = self.builder.num_scenarios();
    let n = self.builder.num_assets();
    let policy = RetryPolicy::new(self.max_attempts)?.verbose(self.verbose);

    // stage one: every scenario solved on its own
    let mut solutions = Array2::zeros((s, n));
    for i in 0..s {
      let mut model = self.builder.build(i)?;
      let w = policy.run(&mut model, x0.clone(), random_start)?;
      solutions.row_mut(i).assign(&w);
    }

    // baseline objective values, one per scenario, fixed before stage two
    let objectives: Vec<_> = (0..s)
      .map(|i| self.builder.objective(i).ok_or(OptimizeError::ObjectiveNotSet))
      .collect::<Result<_>>()?;
    let scenario_values = Array1::from_iter(
      objectives
        .iter()
        .enumerate()
        .map(|(i, f)| f(&solutions.row(i).to_owned())),
    );

    let dist = dist.unwrap_or_else(|| Arc::new(|gap: f64| gap * gap));
    let regret = self.regret_function(direction, objectives, scenario_values.clone(), dist);

    let (weights, proportions) = match mode {
      RegretMode::Approx => {
        let (w, p) = self.solve_approx(&policy, &solutions, regret)?;
        (w, Some(p))
      }
      RegretMode::Actual => (self.solve_actual(&policy, x0, random_start, regret)?, None),
    };

    let diagnostics = self.builder.scenario_free_constraints();
    let (tight, violations) = if is_nan_solution(&weights) {
      (Vec::new(), Vec::new())
    } else {
      (diagnostics.tight(&weights), diagnostics.violations(&weights))
    };

    self.result = Some(RegretResult {
      weights: weights.clone(),
      proportions,
      scenario_solutions: solutions,
      scenario_values,
      tight,
      violations,
    });
    Ok(weights)
  }

  pub fn summary(&self) -> Summary {
    Summary {
      algorithm: self.builder.algorithm(),
      prob: self.builder.prob().clone(),
      result: self.result.clone(),
    }
  }

  /// The probability-weighted regret of a candidate weight vector. The
  /// gap against each scenario's baseline keeps its sign: a candidate
  /// beating a (possibly suboptimal) baseline feeds a negative gap to the
  /// distance function.
  fn regret_function(
    &self,
    direction: Direction,
    objectives: Vec<super::ScalarFn>,
    scenario_values: Array1<f64>,
    dist: DistanceFn,
  ) -> super::ScalarFn {
    let prob = self.builder.prob().clone();
    // shortfall sign: a maximization regrets falling below the baseline,
    // a minimization regrets rising above it
    let sign = -direction.sign();
    Arc::new(move |w: &Array1<f64>| {
      objectives
        .iter()
        .zip(scenario_values.iter())
        .zip(prob.iter())
        .map(|((f, &best), &p)| p * dist(sign * (best - f(w))))
        .sum()
    })
  }

  /// Stage two over blend proportions: an S-dimensional simplex search
  /// whose candidate weights are `solutions^T p`.
  fn solve_approx(
    &self,
    policy: &RetryPolicy,
    solutions: &Array2<f64>,
    regret: super::ScalarFn,
  ) -> Result<(Array1<f64>, Array1<f64>)> {
    let s = self.builder.num_scenarios();
    let mut model = BaseOptimizer::new(s, self.builder.algorithm());
    model.set_verbose(self.verbose);
    model.set_epsilon(self.builder.epsilon())?;
    model.set_epsilon_constraint(self.builder.constraint_epsilon())?;
    model.set_stop_criteria(self.stage_two_stop(s));
    model.set_bounds(0.0, 1.0)?;
    model.add_equality_constraint("sum_to_1", |p: &Array1<f64>| p.sum() - 1.0, None);

    let blends = solutions.clone();
    model.set_min_objective(move |p: &Array1<f64>| regret(&blends.t().dot(p)));

    let p0 = Array1::from_elem(s, 1.0 / s as f64);
    let p = policy.run(&mut model, Some(p0), false)?;
    let weights = if is_nan_solution(&p) {
      super::nan_vector(self.builder.num_assets())
    } else {
      solutions.t().dot(&p)
    };
    Ok((weights, p))
  }

  /// Stage two over the full weight space, under the original bounds and
  /// the scenario-independent constraints.
  fn solve_actual(
    &self,
    policy: &RetryPolicy,
    x0: Option<Array1<f64>>,
    random_start: bool,
    regret: super::ScalarFn,
  ) -> Result<Array1<f64>> {
    let n = self.builder.num_assets();
    let mut model = BaseOptimizer::new(n, self.builder.algorithm());
    model.set_verbose(self.verbose);
    model.set_epsilon(self.builder.epsilon())?;
    model.set_epsilon_constraint(self.builder.constraint_epsilon())?;
    model.set_stop_criteria(self.stage_two_stop(n));
    model.set_bounds(
      self.builder.lower_bounds().clone(),
      self.builder.upper_bounds().clone(),
    )?;

    for c in self.builder.scenario_free_constraints().iter() {
      let fun = c.fun.clone();
      match c.kind {
        ConstraintKind::Inequality => {
          model.add_inequality_constraint(&c.name, move |x: &Array1<f64>| fun.value(x), None);
        }
        ConstraintKind::Equality => {
          model.add_equality_constraint(&c.name, move |x: &Array1<f64>| fun.value(x), None);
        }
      }
    }

    model.set_min_objective(move |w: &Array1<f64>| regret(w));
    policy.run(&mut model, x0, random_start)
  }

  /// Stage-two stopping criteria in the dimension of the stage-two
  /// problem. The per-coordinate xtol vector cannot be reused when the
  /// dimension differs, so it is rebuilt at the default tolerance.
  fn stage_two_stop(&self, dim: usize) -> StopCriteria {
    let shared = self.builder.stop_criteria();
    StopCriteria {
      xtol_abs: Some(Array1::from_elem(dim, opts::XTOL_ABS)),
      xtol_rel: shared.xtol_rel,
      ftol_abs: shared.ftol_abs,
      ftol_rel: shared.ftol_rel,
      max_eval: shared.max_eval,
      stop_val: None,
    }
  }
}

/// Plain-text report of the last regret solve.
pub struct Summary {
  algorithm: Algorithm,
  prob: Array1<f64>,
  result: Option<RegretResult>,
}

impl fmt::Display for Summary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "Regret Optimizer")?;
    writeln!(f, "================")?;
    writeln!(f, "Algorithm: {}", self.algorithm.name())?;
    writeln!(f, "Scenario probabilities: {:.4}", self.prob)?;

    match &self.result {
      None => writeln!(f, "No solve has been run yet."),
      Some(r) => {
        writeln!(f)?;
        writeln!(f, "Scenario optima (one row per scenario):")?;
        for row in r.scenario_solutions.rows() {
          writeln!(f, "  {:.6}", row)?;
        }
        writeln!(f, "Scenario objective values: {:.6}", r.scenario_values)?;
        if let Some(p) = &r.proportions {
          writeln!(f, "Blend proportions: {:.6}", p)?;
        }
        writeln!(f, "Final weights: {:.6}", r.weights)?;
        if !r.tight.is_empty() {
          writeln!(f, "Tight constraints: {}", r.tight.join(", "))?;
        }
        if !r.violations.is_empty() {
          writeln!(f, "Violated constraints:")?;
          for (name, amount) in &r.violations {
            writeln!(f, "  {name}: {amount:.3e}")?;
          }
        }
        Ok(())
      }
    }
  }
}
