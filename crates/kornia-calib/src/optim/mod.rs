//! Small dense non-linear least squares toolkit.
//!
//! A [`Problem`] holds named Euclidean variables and the [`Factor`]s that
//! constrain them; [`LevenbergMarquardt`] minimizes the sum of squared residuals.

/// Variables, factors and the problem container.
pub mod core;

/// Solvers for problems built from the core types.
pub mod solvers;

pub use self::core::{
    numerical_jacobian, Factor, FactorError, FactorResult, LinearizationResult, Problem,
    ProblemError, Variable,
};
pub use self::solvers::{
    LevenbergMarquardt, LinearSystemBuilder, OptimizerError, OptimizerResult, TerminationReason,
    VariableLayout,
};
