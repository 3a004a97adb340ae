//! # Scenario Data
//!
//! $$
//! R \in \mathbb{R}^{T \times N \times A} \quad (\text{time} \times \text{trials} \times \text{assets})
//! $$
//!
//! Simulation cubes that parameterize objective and constraint closures.
//! A cube is read-only once handed to an orchestrator; calibration and
//! horizon-trimming produce new cubes.

use ndarray::Array1;
use ndarray::Array3;
use ndarray::Axis;

use crate::optimize::OptimizeError;
use crate::optimize::Result;

/// Number of periods in the first cube axis that make up one year.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeUnit {
  Monthly,
  Quarterly,
  SemiAnnually,
  Yearly,
}

impl TimeUnit {
  /// Parse a string into a [`TimeUnit`].
  pub fn from_str(s: &str) -> Self {
    match s.to_lowercase().as_str() {
      "monthly" | "month" | "m" => Self::Monthly,
      "semi-annually" | "semiannually" | "sa" => Self::SemiAnnually,
      "yearly" | "annually" | "y" => Self::Yearly,
      _ => Self::Quarterly,
    }
  }

  pub fn periods_per_year(self) -> usize {
    match self {
      Self::Monthly => 12,
      Self::Quarterly => 4,
      Self::SemiAnnually => 2,
      Self::Yearly => 1,
    }
  }
}

/// One discrete scenario: a simulated returns cube with its time unit.
#[derive(Clone, Debug)]
pub struct ScenarioCube {
  data: Array3<f64>,
  periods_per_year: usize,
}

impl ScenarioCube {
  pub fn new(data: Array3<f64>, time_unit: TimeUnit) -> Self {
    Self { data, periods_per_year: time_unit.periods_per_year() }
  }

  pub fn with_periods_per_year(data: Array3<f64>, periods_per_year: usize) -> Self {
    Self { data, periods_per_year: periods_per_year.max(1) }
  }

  pub fn n_periods(&self) -> usize {
    self.data.shape()[0]
  }

  pub fn n_trials(&self) -> usize {
    self.data.shape()[1]
  }

  pub fn n_assets(&self) -> usize {
    self.data.shape()[2]
  }

  pub fn periods_per_year(&self) -> usize {
    self.periods_per_year
  }

  pub fn data(&self) -> &Array3<f64> {
    &self.data
  }

  /// A copy trimmed to the first `years` of simulation.
  pub fn trim_to_horizon(&self, years: usize) -> Self {
    let keep = (years * self.periods_per_year).min(self.n_periods());
    Self {
      data: self.data.slice(ndarray::s![..keep, .., ..]).to_owned(),
      periods_per_year: self.periods_per_year,
    }
  }

  /// A recalibrated copy whose per-asset annualized mean and/or volatility
  /// match the supplied targets. Volatility is rescaled about the current
  /// per-period mean before the mean shift is applied.
  pub fn calibrate(
    &self,
    target_mean: Option<&Array1<f64>>,
    target_vol: Option<&Array1<f64>>,
  ) -> Result<Self> {
    let n = self.n_assets();
    for (target, what) in [(target_mean, "target mean"), (target_vol, "target volatility")] {
      if let Some(t) = target {
        if t.len() != n {
          return Err(OptimizeError::ShapeMismatch { what, expected: n, found: t.len() });
        }
      }
    }

    let ppy = self.periods_per_year as f64;
    let mut data = self.data.clone();

    for a in 0..n {
      let mut slab = data.slice_mut(ndarray::s![.., .., a]);
      let count = slab.len() as f64;
      let mean = slab.sum() / count;

      if let Some(tv) = target_vol {
        let var = slab.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (count - 1.0);
        let sd = var.sqrt();
        if sd > 0.0 {
          let scale = (tv[a] / ppy.sqrt()) / sd;
          slab.mapv_inplace(|r| mean + scale * (r - mean));
        }
      }

      if let Some(tm) = target_mean {
        let current = slab.sum() / count;
        let shift = tm[a] / ppy - current;
        slab.mapv_inplace(|r| r + shift);
      }
    }

    Ok(Self { data, periods_per_year: self.periods_per_year })
  }

  /// Cumulative portfolio return per trial for weights `w`.
  pub fn portfolio_returns(&self, w: &Array1<f64>) -> Result<Array1<f64>> {
    if w.len() != self.n_assets() {
      return Err(OptimizeError::ShapeMismatch {
        what: "weight vector",
        expected: self.n_assets(),
        found: w.len(),
      });
    }

    let mut growth = Array1::from_elem(self.n_trials(), 1.0);
    for t in 0..self.n_periods() {
      let period = self.data.index_axis(Axis(0), t);
      for j in 0..self.n_trials() {
        growth[j] *= 1.0 + period.row(j).dot(w);
      }
    }
    Ok(growth - 1.0)
  }

  /// Annualized geometric mean return of the portfolio across trials.
  pub fn expected_return(&self, w: &Array1<f64>) -> Result<f64> {
    let total = self.portfolio_returns(w)?;
    let years = self.n_periods() as f64 / self.periods_per_year as f64;
    let mean = total
      .iter()
      .map(|r| (1.0 + r).max(0.0).powf(1.0 / years) - 1.0)
      .sum::<f64>()
      / total.len() as f64;
    Ok(mean)
  }

  /// Annualized volatility of per-period portfolio returns.
  pub fn volatility(&self, w: &Array1<f64>) -> Result<f64> {
    if w.len() != self.n_assets() {
      return Err(OptimizeError::ShapeMismatch {
        what: "weight vector",
        expected: self.n_assets(),
        found: w.len(),
      });
    }

    let mut rets = Vec::with_capacity(self.n_periods() * self.n_trials());
    for t in 0..self.n_periods() {
      let period = self.data.index_axis(Axis(0), t);
      for j in 0..self.n_trials() {
        rets.push(period.row(j).dot(w));
      }
    }

    if rets.len() < 2 {
      return Ok(0.0);
    }
    let mean = rets.iter().sum::<f64>() / rets.len() as f64;
    let var = rets.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (rets.len() - 1) as f64;
    Ok(var.sqrt() * (self.periods_per_year as f64).sqrt())
  }

  /// Empirical CVaR of cumulative portfolio returns at tail probability
  /// `alpha`; positive output means tail loss.
  pub fn cvar(&self, w: &Array1<f64>, alpha: f64) -> Result<f64> {
    let mut returns = self.portfolio_returns(w)?.to_vec();
    if returns.is_empty() {
      return Ok(0.0);
    }

    returns.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let cutoff = ((returns.len() as f64) * alpha.clamp(0.0, 1.0)).ceil() as usize;
    let cutoff = cutoff.max(1).min(returns.len());
    let tail_mean: f64 = returns[..cutoff].iter().sum::<f64>() / cutoff as f64;

    Ok(-tail_mean)
  }
}

#[cfg(test)]
mod tests {
  use approx::assert_abs_diff_eq;
  use ndarray::array;
  use ndarray::Array3;

  use super::*;

  fn constant_cube(r0: f64, r1: f64, periods: usize, trials: usize) -> ScenarioCube {
    let data = Array3::from_shape_fn((periods, trials, 2), |(_, _, a)| if a == 0 { r0 } else { r1 });
    ScenarioCube::new(data, TimeUnit::Quarterly)
  }

  #[test]
  fn time_unit_parsing_follows_aliases() {
    assert_eq!(TimeUnit::from_str("monthly").periods_per_year(), 12);
    assert_eq!(TimeUnit::from_str("Quarterly").periods_per_year(), 4);
    assert_eq!(TimeUnit::from_str("sa").periods_per_year(), 2);
    assert_eq!(TimeUnit::from_str("annually").periods_per_year(), 1);
    assert_eq!(TimeUnit::from_str("unknown").periods_per_year(), 4);
  }

  #[test]
  fn trim_keeps_the_first_years() {
    let cube = constant_cube(0.01, 0.02, 12, 5);
    let trimmed = cube.trim_to_horizon(2);
    assert_eq!(trimmed.n_periods(), 8);
    assert_eq!(trimmed.n_trials(), 5);
    assert_eq!(trimmed.n_assets(), 2);

    // requesting more than available keeps everything
    assert_eq!(cube.trim_to_horizon(10).n_periods(), 12);
  }

  #[test]
  fn portfolio_returns_compound_per_trial() {
    let cube = constant_cube(0.01, 0.03, 4, 3);
    let w = array![0.5, 0.5];
    let rets = cube.portfolio_returns(&w).unwrap();

    let expect = 1.02f64.powi(4) - 1.0;
    for r in rets.iter() {
      assert_abs_diff_eq!(*r, expect, epsilon = 1e-12);
    }
  }

  #[test]
  fn expected_return_annualizes_geometrically() {
    let cube = constant_cube(0.01, 0.01, 8, 2);
    let er = cube.expected_return(&array![0.5, 0.5]).unwrap();
    // constant 1% per quarter -> (1.01)^4 - 1 per year
    assert_abs_diff_eq!(er, 1.01f64.powi(4) - 1.0, epsilon = 1e-10);
  }

  #[test]
  fn calibration_hits_target_mean_and_vol() {
    let data = Array3::from_shape_fn((8, 50, 2), |(t, j, a)| {
      0.01 + 0.005 * ((t * 7 + j * 3 + a) % 11) as f64 - 0.02
    });
    let cube = ScenarioCube::new(data, TimeUnit::Quarterly);

    let tm = array![0.08, 0.04];
    let tv = array![0.2, 0.1];
    let adjusted = cube.calibrate(Some(&tm), Some(&tv)).unwrap();

    for a in 0..2 {
      let slab = adjusted.data().slice(ndarray::s![.., .., a]);
      let count = slab.len() as f64;
      let mean = slab.sum() / count;
      let var = slab.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (count - 1.0);

      assert_abs_diff_eq!(mean * 4.0, tm[a], epsilon = 1e-10);
      assert_abs_diff_eq!(var.sqrt() * 2.0, tv[a], epsilon = 1e-10);
    }
  }

  #[test]
  fn mismatched_weight_length_is_rejected() {
    let cube = constant_cube(0.01, 0.02, 4, 3);
    assert!(cube.portfolio_returns(&array![1.0]).is_err());
    assert!(cube.volatility(&array![1.0, 0.0, 0.0]).is_err());
    assert!(cube.calibrate(Some(&array![0.1]), None).is_err());
  }

  #[test]
  fn cvar_reports_tail_loss_as_positive() {
    let mut data = Array3::zeros((1, 10, 1));
    for j in 0..10 {
      data[[0, j, 0]] = -0.10 + 0.02 * j as f64;
    }
    let cube = ScenarioCube::new(data, TimeUnit::Yearly);

    // 20% tail of {-.10, -.08, ...} is the mean of the two worst outcomes
    let cvar = cube.cvar(&array![1.0], 0.2).unwrap();
    assert_abs_diff_eq!(cvar, 0.09, epsilon = 1e-12);
  }
}
