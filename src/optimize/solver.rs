//! # Solver Capability
//!
//! $$
//! \text{solve}(x_0) \to x^\* \ |\ \text{unstable} \ |\ \text{infeasible}
//! $$
//!
//! The pluggable solver seam. A solver receives a fully assembled
//! [`ProgramSpec`] and a start vector and reports an explicit [`Outcome`];
//! no panic or unwind is used to signal numerical trouble.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use argmin::core::CostFunction;
use argmin::core::Executor;
use argmin::solver::neldermead::NelderMead;
use ndarray::Array1;

use super::constraint::Constraint;
use super::gradient::Differentiable;
use super::Direction;
use super::StopCriteria;

/// Result of a single solve attempt.
#[derive(Clone, Debug)]
pub enum Outcome {
  /// A usable solution within bounds and constraint tolerances.
  Solved(Array1<f64>),
  /// Numerical instability (non-finite evaluation, diverging step). The
  /// attempt may be retried from a perturbed start.
  Unstable,
  /// The solver completed but found no feasible point. Retrying from
  /// another start is the caller's decision; this layer reports it as-is.
  Infeasible,
}

impl Outcome {
  pub fn is_solved(&self) -> bool {
    matches!(self, Outcome::Solved(_))
  }
}

/// A complete, self-contained program handed to a solver: one objective,
/// registries of equality and inequality constraints, bounds and stopping
/// criteria. Constructed once per solve by the program adapter.
#[derive(Clone)]
pub struct ProgramSpec {
  pub n: usize,
  pub direction: Direction,
  pub objective: Differentiable,
  pub equality: Vec<Constraint>,
  pub inequality: Vec<Constraint>,
  pub lower: Array1<f64>,
  pub upper: Array1<f64>,
  pub stop: StopCriteria,
  pub eps_step: f64,
}

impl ProgramSpec {
  /// Objective value with the direction sign applied, so every solver
  /// minimizes internally.
  pub fn signed_value(&self, x: &Array1<f64>) -> f64 {
    self.direction.sign() * self.objective.value(x)
  }

  pub fn signed_grad(&self, x: &Array1<f64>) -> Array1<f64> {
    let mut g = self.objective.grad(x, self.eps_step);
    g.mapv_inplace(|v| v * self.direction.sign());
    g
  }

  pub fn clamp(&self, x: &mut Array1<f64>) {
    for i in 0..x.len() {
      x[i] = x[i].clamp(self.lower[i], self.upper[i]);
    }
  }

  /// Largest constraint violation magnitude at `x`; zero when feasible.
  pub fn max_violation(&self, x: &Array1<f64>) -> f64 {
    self
      .equality
      .iter()
      .chain(self.inequality.iter())
      .map(|c| c.violation(x))
      .fold(0.0, f64::max)
  }

  pub fn is_feasible(&self, x: &Array1<f64>) -> bool {
    self.max_violation(x) <= 0.0
  }

  fn max_eval(&self) -> usize {
    self.stop.max_eval.unwrap_or(usize::MAX)
  }

  /// True once the signed objective value has crossed the configured
  /// stop value.
  fn reached_stop_val(&self, signed: f64) -> bool {
    match self.stop.stop_val {
      Some(sv) => signed <= self.direction.sign() * sv,
      None => false,
    }
  }

  /// Step-change stopping test on the decision vector.
  fn x_converged(&self, x: &Array1<f64>, x_new: &Array1<f64>) -> bool {
    if let Some(tol) = &self.stop.xtol_abs {
      if x
        .iter()
        .zip(x_new.iter())
        .zip(tol.iter())
        .all(|((a, b), t)| (a - b).abs() <= *t)
      {
        return true;
      }
    }
    if let Some(tol) = self.stop.xtol_rel {
      let delta: f64 = x.iter().zip(x_new.iter()).map(|(a, b)| (a - b).abs()).sum();
      let norm: f64 = x_new.iter().map(|v| v.abs()).sum();
      if delta <= tol * norm {
        return true;
      }
    }
    false
  }

  /// Value-change stopping test on the objective.
  fn f_converged(&self, f: f64, f_new: f64) -> bool {
    if let Some(tol) = self.stop.ftol_abs {
      if (f - f_new).abs() <= tol {
        return true;
      }
    }
    if let Some(tol) = self.stop.ftol_rel {
      if (f - f_new).abs() <= tol * f_new.abs() {
        return true;
      }
    }
    false
  }
}

/// A solver capability: one attempt from one start vector.
pub trait Solver {
  fn name(&self) -> &'static str;

  /// Whether the solver consumes gradients. Controls the default for
  /// automatic gradient synthesis.
  fn requires_gradient(&self) -> bool;

  fn solve(&self, spec: &ProgramSpec, x0: Array1<f64>) -> Outcome;
}

/// Stock solver selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Algorithm {
  /// Gradient-based augmented-Lagrangian projected-gradient method.
  AugLag,
  /// Derivative-free Nelder-Mead with a quadratic constraint penalty.
  NelderMead,
}

impl Algorithm {
  /// Parse a string into an [`Algorithm`].
  pub fn from_str(s: &str) -> Self {
    match s.to_lowercase().as_str() {
      "nelder-mead" | "neldermead" | "nm" => Self::NelderMead,
      _ => Self::AugLag,
    }
  }

  pub fn name(self) -> &'static str {
    match self {
      Self::AugLag => "augmented-lagrangian",
      Self::NelderMead => "nelder-mead",
    }
  }

  pub fn requires_gradient(self) -> bool {
    match self {
      Self::AugLag => true,
      Self::NelderMead => false,
    }
  }

  pub fn solver(self) -> Box<dyn Solver + Send + Sync> {
    match self {
      Self::AugLag => Box::new(AugLagSolver),
      Self::NelderMead => Box::new(NelderMeadSolver),
    }
  }
}

/// Augmented-Lagrangian solver. Equality and inequality constraints enter
/// the inner objective with multiplier estimates that are refreshed every
/// outer iteration; the inner problem is minimized by projected gradient
/// descent with a backtracking line search.
pub struct AugLagSolver;

const OUTER_ITERS: usize = 60;
const INNER_ITERS: usize = 250;
const MU_INIT: f64 = 10.0;
const MU_GROWTH: f64 = 5.0;
const MU_MAX: f64 = 1e10;

impl AugLagSolver {
  fn lagrangian(
    spec: &ProgramSpec,
    x: &Array1<f64>,
    lambda: &[f64],
    nu: &[f64],
    mu: f64,
    evals: &mut usize,
  ) -> f64 {
    *evals += 1;
    let mut val = spec.signed_value(x);

    for (c, &l) in spec.equality.iter().zip(lambda) {
      let h = c.fun.value(x);
      val += l * h + 0.5 * mu * h * h;
    }
    for (c, &v) in spec.inequality.iter().zip(nu) {
      let g = c.fun.value(x);
      let active = (v + mu * g).max(0.0);
      val += (active * active - v * v) / (2.0 * mu);
    }

    val
  }

  fn lagrangian_grad(
    spec: &ProgramSpec,
    x: &Array1<f64>,
    lambda: &[f64],
    nu: &[f64],
    mu: f64,
    evals: &mut usize,
  ) -> Array1<f64> {
    *evals += 1;
    let mut grad = spec.signed_grad(x);

    for (c, &l) in spec.equality.iter().zip(lambda) {
      let h = c.fun.value(x);
      let cg = c.fun.grad(x, spec.eps_step);
      grad = grad + cg * (l + mu * h);
    }
    for (c, &v) in spec.inequality.iter().zip(nu) {
      let g = c.fun.value(x);
      let active = (v + mu * g).max(0.0);
      if active > 0.0 {
        let cg = c.fun.grad(x, spec.eps_step);
        grad = grad + cg * active;
      }
    }

    grad
  }

  /// Inner minimization of the augmented Lagrangian at fixed multipliers.
  /// Returns `None` on a non-finite evaluation.
  fn minimize_inner(
    spec: &ProgramSpec,
    mut x: Array1<f64>,
    lambda: &[f64],
    nu: &[f64],
    mu: f64,
    evals: &mut usize,
  ) -> Option<Array1<f64>> {
    let max_eval = spec.max_eval();
    let mut lval = Self::lagrangian(spec, &x, lambda, nu, mu, evals);
    if !lval.is_finite() {
      return None;
    }

    let mut step = 1.0 / mu.max(1.0);
    for _ in 0..INNER_ITERS {
      if *evals >= max_eval {
        break;
      }

      let grad = Self::lagrangian_grad(spec, &x, lambda, nu, mu, evals);
      if grad.iter().any(|g| !g.is_finite()) {
        return None;
      }

      // projected gradient: directions pushing past an active bound carry
      // no descent information
      let mut pnorm2 = 0.0;
      for i in 0..x.len() {
        let at_lower = x[i] <= spec.lower[i] && grad[i] > 0.0;
        let at_upper = x[i] >= spec.upper[i] && grad[i] < 0.0;
        if !at_lower && !at_upper {
          pnorm2 += grad[i] * grad[i];
        }
      }
      if pnorm2.sqrt() <= 1e-12 {
        break;
      }

      // backtracking line search on the projected step
      let mut t = step;
      let mut accepted = false;
      for _ in 0..45 {
        let mut cand = &x - &(&grad * t);
        spec.clamp(&mut cand);
        let cval = Self::lagrangian(spec, &cand, lambda, nu, mu, evals);
        if !cval.is_finite() {
          return None;
        }
        if cval < lval - 1e-4 * t * pnorm2 || (cval < lval && t < 1e-10) {
          let stop = spec.x_converged(&x, &cand) && spec.f_converged(lval, cval);
          x = cand;
          lval = cval;
          step = (t * 2.0).min(1.0);
          accepted = true;
          if stop {
            return Some(x);
          }
          break;
        }
        t *= 0.5;
      }

      if !accepted {
        break;
      }
      if spec.reached_stop_val(spec.signed_value(&x)) {
        break;
      }
    }

    Some(x)
  }
}

impl Solver for AugLagSolver {
  fn name(&self) -> &'static str {
    Algorithm::AugLag.name()
  }

  fn requires_gradient(&self) -> bool {
    true
  }

  fn solve(&self, spec: &ProgramSpec, mut x0: Array1<f64>) -> Outcome {
    spec.clamp(&mut x0);
    let mut evals = 0usize;

    let f0 = spec.signed_value(&x0);
    evals += 1;
    if !f0.is_finite() {
      return Outcome::Unstable;
    }

    let mut lambda = vec![0.0; spec.equality.len()];
    let mut nu = vec![0.0; spec.inequality.len()];
    let mut mu = MU_INIT;
    let mut x = x0;
    let mut last_violation = f64::INFINITY;

    for _ in 0..OUTER_ITERS {
      x = match Self::minimize_inner(spec, x, &lambda, &nu, mu, &mut evals) {
        Some(x) => x,
        None => return Outcome::Unstable,
      };

      for (c, l) in spec.equality.iter().zip(lambda.iter_mut()) {
        *l += mu * c.fun.value(&x);
      }
      for (c, v) in spec.inequality.iter().zip(nu.iter_mut()) {
        *v = (*v + mu * c.fun.value(&x)).max(0.0);
      }

      let violation = spec.max_violation(&x);
      if violation <= 0.0 {
        break;
      }
      if violation > 0.25 * last_violation {
        mu = (mu * MU_GROWTH).min(MU_MAX);
      }
      last_violation = violation;

      if evals >= spec.max_eval() {
        break;
      }
    }

    if spec.is_feasible(&x) {
      Outcome::Solved(x)
    } else {
      Outcome::Infeasible
    }
  }
}

/// Derivative-free solver: Nelder-Mead over a penalized objective with
/// bound clamping inside the cost function.
pub struct NelderMeadSolver;

const PENALTY: f64 = 1e6;

struct PenalizedCost {
  spec: ProgramSpec,
  non_finite: Arc<AtomicBool>,
}

impl CostFunction for PenalizedCost {
  type Param = Vec<f64>;
  type Output = f64;

  fn cost(&self, x: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
    let mut w = Array1::from_vec(x.clone());
    self.spec.clamp(&mut w);

    let mut val = self.spec.signed_value(&w);
    for c in &self.spec.equality {
      let h = c.fun.value(&w);
      val += PENALTY * h * h;
    }
    for c in &self.spec.inequality {
      let g = c.fun.value(&w).max(0.0);
      val += PENALTY * g * g;
    }

    if !val.is_finite() {
      self.non_finite.store(true, Ordering::Relaxed);
      return Ok(f64::MAX / 2.0);
    }
    Ok(val)
  }
}

impl Solver for NelderMeadSolver {
  fn name(&self) -> &'static str {
    Algorithm::NelderMead.name()
  }

  fn requires_gradient(&self) -> bool {
    false
  }

  fn solve(&self, spec: &ProgramSpec, mut x0: Array1<f64>) -> Outcome {
    spec.clamp(&mut x0);
    let non_finite = Arc::new(AtomicBool::new(false));
    let cost = PenalizedCost { spec: spec.clone(), non_finite: non_finite.clone() };

    let x0 = x0.to_vec();
    let mut simplex = Vec::with_capacity(spec.n + 1);
    simplex.push(x0.clone());
    for i in 0..spec.n {
      let mut point = x0.clone();
      point[i] += 0.1;
      simplex.push(point);
    }

    let sd_tol = spec.stop.ftol_abs.unwrap_or(1e-10);
    let max_iters = spec.stop.max_eval.map(|n| n as u64).unwrap_or(5000).min(100_000);

    let best = match NelderMead::new(simplex).with_sd_tolerance(sd_tol) {
      Ok(solver) => {
        match Executor::new(cost, solver)
          .configure(|state| state.max_iters(max_iters))
          .run()
        {
          Ok(res) => res.state.best_param.unwrap_or(x0),
          Err(_) => return Outcome::Unstable,
        }
      }
      Err(_) => return Outcome::Unstable,
    };

    let mut x = Array1::from_vec(best);
    spec.clamp(&mut x);

    if spec.is_feasible(&x) {
      Outcome::Solved(x)
    } else if non_finite.load(Ordering::Relaxed) {
      Outcome::Unstable
    } else {
      Outcome::Infeasible
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::AtomicUsize;

  use approx::assert_abs_diff_eq;
  use ndarray::array;

  use super::super::constraint::ConstraintKind;
  use super::super::gradient::Differentiable;
  use super::super::GradientFn;
  use super::super::ScalarFn;
  use super::*;
  use std::sync::Arc as StdArc;

  fn quadratic_spec(direction: Direction) -> ProgramSpec {
    let f: ScalarFn = StdArc::new(|x: &Array1<f64>| x.dot(x));
    ProgramSpec {
      n: 2,
      direction,
      objective: Differentiable::synthesized(f, 1e-6),
      equality: vec![],
      inequality: vec![],
      lower: array![-5.0, -5.0],
      upper: array![5.0, 5.0],
      stop: StopCriteria {
        xtol_abs: Some(array![1e-9, 1e-9]),
        ftol_abs: Some(1e-12),
        max_eval: Some(100_000),
        ..Default::default()
      },
      eps_step: 1e-6,
    }
  }

  #[test]
  fn algorithm_parsing_follows_aliases() {
    assert_eq!(Algorithm::from_str("nelder-mead"), Algorithm::NelderMead);
    assert_eq!(Algorithm::from_str("NM"), Algorithm::NelderMead);
    assert_eq!(Algorithm::from_str("auglag"), Algorithm::AugLag);
    assert_eq!(Algorithm::from_str("anything-else"), Algorithm::AugLag);
  }

  #[test]
  fn auglag_minimizes_unconstrained_quadratic() {
    let spec = quadratic_spec(Direction::Minimize);
    match AugLagSolver.solve(&spec, array![3.0, -4.0]) {
      Outcome::Solved(x) => {
        assert_abs_diff_eq!(x[0], 0.0, epsilon = 1e-4);
        assert_abs_diff_eq!(x[1], 0.0, epsilon = 1e-4);
      }
      other => panic!("expected solution, got {other:?}"),
    }
  }

  #[test]
  fn auglag_respects_equality_constraint() {
    // min x.x  s.t.  x0 + x1 = 1  ->  [0.5, 0.5]
    let mut spec = quadratic_spec(Direction::Minimize);
    let h: ScalarFn = StdArc::new(|x: &Array1<f64>| x.sum() - 1.0);
    spec.equality.push(Constraint {
      name: "budget".into(),
      kind: ConstraintKind::Equality,
      fun: Differentiable::synthesized(h, 1e-6),
      tol: 1e-6,
    });

    match AugLagSolver.solve(&spec, array![0.9, 0.1]) {
      Outcome::Solved(x) => {
        assert_abs_diff_eq!(x[0], 0.5, epsilon = 1e-3);
        assert_abs_diff_eq!(x[1], 0.5, epsilon = 1e-3);
        assert_abs_diff_eq!(x.sum(), 1.0, epsilon = 1e-6);
      }
      other => panic!("expected solution, got {other:?}"),
    }
  }

  #[test]
  fn non_finite_objective_is_reported_unstable() {
    let mut spec = quadratic_spec(Direction::Minimize);
    let f: ScalarFn = StdArc::new(|_: &Array1<f64>| f64::NAN);
    spec.objective = Differentiable::new(f);

    assert!(matches!(
      AugLagSolver.solve(&spec, array![0.5, 0.5]),
      Outcome::Unstable
    ));
  }

  #[test]
  fn stop_val_halts_minimization_once_satisfied() {
    // f(x0) = 25; the first accepted descent step already satisfies the
    // stop value, so the solver must not descend to the origin
    let mut spec = quadratic_spec(Direction::Minimize);
    spec.stop.stop_val = Some(20.0);

    match AugLagSolver.solve(&spec, array![3.0, -4.0]) {
      Outcome::Solved(x) => {
        let f = x.dot(&x);
        assert!(f <= 20.0, "objective {f} above the stop value");
        assert!(f >= 1.0, "descended past the stop value to {f}");
      }
      other => panic!("expected solution, got {other:?}"),
    }
  }

  fn valley_spec(calls: StdArc<AtomicUsize>, max_eval: Option<usize>) -> ProgramSpec {
    // a curved valley keeps the inner loop busy long enough for the
    // evaluation budget to be the binding stop
    let f: ScalarFn = StdArc::new(move |x: &Array1<f64>| {
      calls.fetch_add(1, Ordering::Relaxed);
      100.0 * (x[1] - x[0] * x[0]).powi(2) + (1.0 - x[0]).powi(2)
    });
    let g: GradientFn = StdArc::new(|x: &Array1<f64>| {
      array![
        -400.0 * x[0] * (x[1] - x[0] * x[0]) - 2.0 * (1.0 - x[0]),
        200.0 * (x[1] - x[0] * x[0]),
      ]
    });

    let mut spec = quadratic_spec(Direction::Minimize);
    spec.objective = Differentiable::with_gradient(f, g);
    spec.stop.xtol_abs = None;
    spec.stop.ftol_abs = None;
    spec.stop.max_eval = max_eval;
    spec
  }

  #[test]
  fn max_eval_bounds_the_evaluation_budget() {
    let capped = StdArc::new(AtomicUsize::new(0));
    AugLagSolver.solve(&valley_spec(capped.clone(), Some(30)), array![-1.2, 1.0]);

    let uncapped = StdArc::new(AtomicUsize::new(0));
    AugLagSolver.solve(&valley_spec(uncapped.clone(), None), array![-1.2, 1.0]);

    // the budget is checked once per inner iteration, so the overshoot is
    // bounded by a single line search
    assert!(capped.load(Ordering::Relaxed) < 30 + 50);
    assert!(capped.load(Ordering::Relaxed) < uncapped.load(Ordering::Relaxed));
  }

  #[test]
  fn nelder_mead_iteration_budget_comes_from_max_eval() {
    let f: ScalarFn =
      StdArc::new(|x: &Array1<f64>| (x[0] - 1.0).powi(2) + (x[1] + 2.0).powi(2));
    let mut spec = quadratic_spec(Direction::Minimize);
    spec.objective = Differentiable::new(f);
    spec.stop.max_eval = Some(5);

    match NelderMeadSolver.solve(&spec, array![0.0, 0.0]) {
      Outcome::Solved(x) => {
        // five simplex iterations from a 0.1-spread start cannot reach the
        // optimum that the unrestricted run converges to
        let dist = ((x[0] - 1.0).powi(2) + (x[1] + 2.0).powi(2)).sqrt();
        assert!(dist > 1e-2, "converged despite the iteration budget: {x}");
      }
      other => panic!("expected solution, got {other:?}"),
    }
  }

  #[test]
  fn nelder_mead_minimizes_penalized_program() {
    // min (x0-1)^2 + (x1+2)^2 within [-5, 5]^2
    let f: ScalarFn =
      StdArc::new(|x: &Array1<f64>| (x[0] - 1.0).powi(2) + (x[1] + 2.0).powi(2));
    let mut spec = quadratic_spec(Direction::Minimize);
    spec.objective = Differentiable::new(f);

    match NelderMeadSolver.solve(&spec, array![0.0, 0.0]) {
      Outcome::Solved(x) => {
        assert_abs_diff_eq!(x[0], 1.0, epsilon = 1e-3);
        assert_abs_diff_eq!(x[1], -2.0, epsilon = 1e-3);
      }
      other => panic!("expected solution, got {other:?}"),
    }
  }

  #[test]
  fn impossible_constraints_are_infeasible() {
    // x0 >= 2 cannot hold within upper bound 1
    let mut spec = quadratic_spec(Direction::Minimize);
    spec.lower = array![0.0, 0.0];
    spec.upper = array![1.0, 1.0];
    let g: ScalarFn = StdArc::new(|x: &Array1<f64>| 2.0 - x[0]);
    spec.inequality.push(Constraint {
      name: "floor".into(),
      kind: ConstraintKind::Inequality,
      fun: Differentiable::synthesized(g, 1e-6),
      tol: 1e-6,
    });

    assert!(matches!(
      AugLagSolver.solve(&spec, array![0.5, 0.5]),
      Outcome::Infeasible
    ));
  }
}
