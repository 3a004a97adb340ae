//! # minregret
//!
//! Constrained nonlinear portfolio allocation under discrete scenario
//! uncertainty. Scenarios are Monte Carlo return cubes with attached
//! probabilities; the final allocation minimizes probability-weighted regret
//! against each scenario's own optimum.
//!
//! ## Modules
//!
//! | Module       | Description                                                              |
//! |--------------|--------------------------------------------------------------------------|
//! | [`optimize`] | Program adapter, solvers, constraints and the two-stage regret procedure. |
//! | [`scenario`] | Scenario return cubes and portfolio statistics derived from them.         |
//! | [`opts`]     | Default numeric options and tolerance validation.                         |

pub mod optimize;
pub mod opts;
pub mod scenario;

pub use optimize::base::BaseOptimizer;
pub use optimize::regret::RegretMode;
pub use optimize::regret::RegretOptimizer;
pub use optimize::regret::RegretResult;
pub use optimize::retry::RetryPolicy;
pub use optimize::solver::Algorithm;
pub use optimize::solver::Outcome;
pub use optimize::solver::ProgramSpec;
pub use optimize::solver::Solver;
pub use optimize::uncertainty::ModelBuilder;
pub use optimize::Direction;
pub use optimize::DistanceFn;
pub use optimize::GradientFn;
pub use optimize::Numeric;
pub use optimize::OptimizeError;
pub use optimize::ScalarFn;
pub use optimize::StopCriteria;
pub use scenario::ScenarioCube;
pub use scenario::TimeUnit;
