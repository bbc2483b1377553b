mod factor;
mod problem;

pub use factor::{numerical_jacobian, Factor, FactorError, FactorResult, LinearizationResult};
pub use problem::{Problem, ProblemError, Variable};

#[cfg(test)]
pub(crate) use factor::PriorFactor;
