//! # Constraints
//!
//! $$
//! g(x) \leq tol, \qquad |h(x)| \leq tol, \qquad \mathbf{A}x \leq \mathbf{b}
//! $$
//!
//! Named constraint registry and the translation of linear constraint
//! systems into one scalar function per matrix row.

use std::sync::Arc;

use ndarray::Array1;
use ndarray::Array2;

use super::gradient::Differentiable;
use super::OptimizeError;
use super::Result;
use super::ScalarFn;

/// Constraint kind. Inequality feasibility is `f(x) <= tol`, equality
/// feasibility is `|f(x)| <= tol`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConstraintKind {
  Equality,
  Inequality,
}

/// A named scalar constraint with its feasibility tolerance.
#[derive(Clone)]
pub struct Constraint {
  pub name: String,
  pub kind: ConstraintKind,
  pub fun: Differentiable,
  pub tol: f64,
}

impl Constraint {
  /// Magnitude by which `x` violates the constraint; zero when feasible.
  pub fn violation(&self, x: &Array1<f64>) -> f64 {
    let v = self.fun.value(x);
    match self.kind {
      ConstraintKind::Inequality => (v - self.tol).max(0.0),
      ConstraintKind::Equality => (v.abs() - self.tol).max(0.0),
    }
  }

  /// An inequality constraint is tight when its value sits within the
  /// tolerance of the feasibility boundary.
  pub fn is_tight(&self, x: &Array1<f64>) -> bool {
    match self.kind {
      ConstraintKind::Inequality => self.fun.value(x).abs() <= self.tol,
      ConstraintKind::Equality => false,
    }
  }
}

/// Insertion-ordered constraint registry. Re-registering a name overwrites
/// the entry in place.
#[derive(Clone, Default)]
pub struct ConstraintSet {
  entries: Vec<Constraint>,
}

impl ConstraintSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn upsert(&mut self, constraint: Constraint) {
    match self.entries.iter_mut().find(|c| c.name == constraint.name) {
      Some(slot) => *slot = constraint,
      None => self.entries.push(constraint),
    }
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Constraint> {
    self.entries.iter()
  }

  /// Names of tight inequality constraints at `x`.
  pub fn tight(&self, x: &Array1<f64>) -> Vec<String> {
    self
      .entries
      .iter()
      .filter(|c| c.is_tight(x))
      .map(|c| c.name.clone())
      .collect()
  }

  /// Violated constraints and their magnitudes at `x`.
  pub fn violations(&self, x: &Array1<f64>) -> Vec<(String, f64)> {
    self
      .entries
      .iter()
      .filter_map(|c| {
        let v = c.violation(x);
        (v > 0.0).then(|| (c.name.clone(), v))
      })
      .collect()
  }
}

/// Right-hand side of a matrix constraint: a scalar broadcast across all
/// rows, or one value per row.
#[derive(Clone, Debug)]
pub enum Rhs {
  Scalar(f64),
  Vector(Array1<f64>),
}

impl From<f64> for Rhs {
  fn from(b: f64) -> Self {
    Self::Scalar(b)
  }
}

impl From<Array1<f64>> for Rhs {
  fn from(b: Array1<f64>) -> Self {
    Self::Vector(b)
  }
}

impl From<Vec<f64>> for Rhs {
  fn from(b: Vec<f64>) -> Self {
    Self::Vector(Array1::from_vec(b))
  }
}

/// Validates `A` against the decision dimension and broadcasts `b`,
/// returning one `(row, rhs)` pair per constraint row.
pub fn translate_matrix(
  a: &Array2<f64>,
  b: Rhs,
  n: usize,
) -> Result<Vec<(Array1<f64>, f64)>> {
  let m = a.nrows();
  if a.ncols() != n {
    return Err(OptimizeError::ShapeMismatch {
      what: "constraint matrix columns",
      expected: n,
      found: a.ncols(),
    });
  }

  let b = match b {
    Rhs::Scalar(v) => Array1::from_elem(m, v),
    Rhs::Vector(v) => {
      if v.len() != m {
        return Err(OptimizeError::ShapeMismatch {
          what: "constraint vector",
          expected: m,
          found: v.len(),
        });
      }
      v
    }
  };

  Ok(
    a.rows()
      .into_iter()
      .zip(b.iter())
      .map(|(row, &rhs)| (row.to_owned(), rhs))
      .collect(),
  )
}

/// The scalar function `g(x) = row . x - rhs` for a single matrix row.
pub fn matrix_constraint(row: Array1<f64>, rhs: f64) -> ScalarFn {
  Arc::new(move |x: &Array1<f64>| row.dot(x) - rhs)
}

/// Generated registry name for matrix constraint row `i`.
pub fn matrix_constraint_name(kind: ConstraintKind, i: usize) -> String {
  match kind {
    ConstraintKind::Inequality => format!("A_{i}"),
    ConstraintKind::Equality => format!("Aeq_{i}"),
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use ndarray::array;

  use super::*;

  #[test]
  fn matrix_translation_is_exact() {
    let a = array![[1.0, 2.0], [3.0, -1.0]];
    let rows = translate_matrix(&a, vec![1.0, 0.5].into(), 2).unwrap();
    assert_eq!(rows.len(), 2);

    let x = array![0.7, -0.2];
    for (i, (row, rhs)) in rows.iter().enumerate() {
      let g = matrix_constraint(row.clone(), *rhs);
      let expect = a.row(i).dot(&x) - *rhs;
      assert_abs_diff_eq!(g(&x), expect, epsilon = 0.0);
    }
  }

  #[test]
  fn scalar_rhs_broadcasts_to_all_rows() {
    let a = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
    let rows = translate_matrix(&a, 1.0.into(), 2).unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|(_, rhs)| *rhs == 1.0));
  }

  #[test]
  fn shape_mismatches_are_rejected() {
    let a = array![[1.0, 2.0, 3.0]];
    assert!(matches!(
      translate_matrix(&a, 1.0.into(), 2),
      Err(OptimizeError::ShapeMismatch { .. })
    ));

    let a = array![[1.0, 2.0]];
    assert!(matches!(
      translate_matrix(&a, vec![1.0, 2.0].into(), 2),
      Err(OptimizeError::ShapeMismatch { .. })
    ));
  }

  #[test]
  fn reregistering_a_name_overwrites_in_place() {
    let mut set = ConstraintSet::new();
    let f1: ScalarFn = Arc::new(|x| x.sum() - 1.0);
    let f2: ScalarFn = Arc::new(|x| x.sum() - 2.0);

    set.upsert(Constraint {
      name: "budget".into(),
      kind: ConstraintKind::Equality,
      fun: Differentiable::new(f1),
      tol: 1e-7,
    });
    set.upsert(Constraint {
      name: "budget".into(),
      kind: ConstraintKind::Equality,
      fun: Differentiable::new(f2),
      tol: 1e-7,
    });

    assert_eq!(set.len(), 1);
    let x = array![1.0, 1.0];
    assert_abs_diff_eq!(set.iter().next().unwrap().fun.value(&x), 0.0);
  }

  #[test]
  fn tight_and_violated_diagnostics() {
    let mut set = ConstraintSet::new();
    let at_boundary: ScalarFn = Arc::new(|x| x[0] - 1.0);
    let violated: ScalarFn = Arc::new(|x| x[1] - 0.1);

    set.upsert(Constraint {
      name: "cap_0".into(),
      kind: ConstraintKind::Inequality,
      fun: Differentiable::new(at_boundary),
      tol: 1e-7,
    });
    set.upsert(Constraint {
      name: "cap_1".into(),
      kind: ConstraintKind::Inequality,
      fun: Differentiable::new(violated),
      tol: 1e-7,
    });

    let x = array![1.0, 0.5];
    assert_eq!(set.tight(&x), vec!["cap_0".to_string()]);

    let violations = set.violations(&x);
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].0, "cap_1");
    assert_abs_diff_eq!(violations[0].1, 0.4, epsilon = 1e-7);
  }
}
