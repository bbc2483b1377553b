//! Levenberg-Marquardt optimizer for non-linear least squares optimization
//!
//! The Levenberg-Marquardt algorithm is a trust-region method that combines
//! the advantages of gradient descent and Gauss-Newton methods. It solves
//! the damped normal equations: (J^T J + λI) δ = -J^T r

use faer::prelude::SpSolver;
use thiserror::Error;

use super::linear_system::{LinearSystemBuilder, VariableLayout};
use crate::optim::core::{FactorError, Problem, ProblemError};

/// Errors that can occur during optimization.
#[derive(Debug, Error)]
pub enum OptimizerError {
    /// Problem-related error
    #[error("Problem error: {0}")]
    Problem(#[from] ProblemError),

    /// Factor evaluation failed
    #[error("Factor evaluation failed: {0}")]
    Factor(#[from] FactorError),

    /// Linear system solve failed (singular matrix)
    #[error("Linear system solve failed: {0}")]
    SolveFailed(String),

    /// Numerical instability detected
    #[error("Numerical instability: {0}")]
    NumericalInstability(String),
}

/// Result of an optimization run.
#[derive(Debug, Clone)]
pub struct OptimizerResult {
    /// Cost (sum of squared residuals) before the first step
    pub initial_cost: f64,
    /// Final cost (sum of squared residuals)
    pub final_cost: f64,
    /// Number of iterations performed
    pub iterations: usize,
    /// Reason for termination
    pub termination_reason: TerminationReason,
}

/// Reason why the optimizer terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Converged: cost change below tolerance
    CostConverged,
    /// Converged: gradient norm below tolerance
    GradientConverged,
    /// Maximum iterations reached
    MaxIterations,
    /// Lambda exceeded maximum (likely numerical issues)
    LambdaMaxExceeded,
}

/// Levenberg-Marquardt optimizer configuration.
#[derive(Debug, Clone)]
pub struct LevenbergMarquardt {
    /// Initial damping parameter
    pub lambda_init: f64,
    /// Maximum damping parameter
    pub lambda_max: f64,
    /// Factor for lambda adaptation
    pub lambda_factor: f64,
    /// Maximum number of iterations
    pub max_iterations: usize,
    /// Convergence threshold for the relative cost change
    pub cost_tolerance: f64,
    /// Convergence threshold for gradient norm
    pub gradient_tolerance: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            lambda_init: 1e-3,
            lambda_max: 1e10,
            lambda_factor: 10.0,
            max_iterations: 50,
            cost_tolerance: 1e-10,
            gradient_tolerance: 1e-10,
        }
    }
}

impl LevenbergMarquardt {
    /// Minimum step norm threshold. Steps smaller than this are considered zero.
    const STEP_SIZE_TOLERANCE: f64 = 1e-12;

    /// Minimize the total cost of `problem`, updating its variables in place.
    ///
    /// Only steps that lower the cost are kept, so the final cost never exceeds
    /// the initial one.
    ///
    /// # Errors
    ///
    /// Fails if the problem is empty, a factor cannot be evaluated, the initial
    /// cost is not finite or the damped system cannot be solved.
    pub fn optimize(&self, problem: &mut Problem) -> Result<OptimizerResult, OptimizerError> {
        if problem.get_variables().is_empty() {
            return Err(OptimizerError::NumericalInstability(
                "No variables in problem".to_string(),
            ));
        }

        if problem.get_factors().is_empty() {
            return Err(OptimizerError::NumericalInstability(
                "No factors in problem".to_string(),
            ));
        }

        let layout = VariableLayout::from_problem(problem);
        if layout.total_dim == 0 {
            return Err(OptimizerError::NumericalInstability(
                "Total parameter dimension is zero".to_string(),
            ));
        }

        let initial_cost = problem.compute_total_cost()?;
        if !initial_cost.is_finite() {
            return Err(OptimizerError::NumericalInstability(format!(
                "initial cost is not finite: {initial_cost}"
            )));
        }

        let mut current_cost = initial_cost;
        let mut lambda = self.lambda_init;
        let mut iterations = 0;

        let finish = |final_cost, iterations, termination_reason| OptimizerResult {
            initial_cost,
            final_cost,
            iterations,
            termination_reason,
        };

        loop {
            if iterations >= self.max_iterations {
                return Ok(finish(
                    current_cost,
                    iterations,
                    TerminationReason::MaxIterations,
                ));
            }

            // Build normal equations: J^T J and J^T r
            let (jtj, jtr) = LinearSystemBuilder::build(problem, &layout)?;

            let gradient_norm = jtr.iter().map(|g| g * g).sum::<f64>().sqrt();
            if !gradient_norm.is_finite() {
                return Err(OptimizerError::NumericalInstability(
                    "gradient is not finite".to_string(),
                ));
            }
            if gradient_norm < self.gradient_tolerance {
                return Ok(finish(
                    current_cost,
                    iterations,
                    TerminationReason::GradientConverged,
                ));
            }

            // Solve damped system: (J^T J + λI) δ = -J^T r
            let delta = self.solve_damped_system(jtj, &jtr, lambda)?;

            let step_norm = delta.iter().map(|d| d * d).sum::<f64>().sqrt();
            if step_norm < Self::STEP_SIZE_TOLERANCE {
                return Ok(finish(
                    current_cost,
                    iterations,
                    TerminationReason::CostConverged,
                ));
            }

            // Apply step and compute new cost (also returns snapshot for reverting)
            let (new_cost, snapshot) = self.apply_step(problem, &layout, &delta)?;
            iterations += 1;

            if new_cost.is_finite() && new_cost < current_cost {
                let relative_cost_change = if current_cost > 0.0 {
                    (current_cost - new_cost) / current_cost
                } else {
                    0.0
                };
                current_cost = new_cost;
                lambda = (lambda / self.lambda_factor).max(1e-10);

                log::trace!(
                    "lm iteration {}: cost {:.6e}, lambda {:.1e}",
                    iterations,
                    current_cost,
                    lambda
                );

                if relative_cost_change < self.cost_tolerance {
                    return Ok(finish(
                        current_cost,
                        iterations,
                        TerminationReason::CostConverged,
                    ));
                }
            } else {
                // Step increased cost: reject it and increase lambda
                self.revert_step(problem, &layout, snapshot)?;
                lambda *= self.lambda_factor;

                if lambda > self.lambda_max {
                    return Ok(finish(
                        current_cost,
                        iterations,
                        TerminationReason::LambdaMaxExceeded,
                    ));
                }
            }
        }
    }

    /// Solve the damped system (J^T J + λI) δ = -J^T r.
    fn solve_damped_system(
        &self,
        mut jtj: faer::Mat<f64>,
        jtr: &[f64],
        lambda: f64,
    ) -> Result<Vec<f64>, OptimizerError> {
        let dim = jtr.len();
        for i in 0..dim {
            jtj.write(i, i, jtj.read(i, i) + lambda);
        }

        let rhs = faer::Mat::<f64>::from_fn(dim, 1, |i, _| -jtr[i]);
        let sol = jtj.partial_piv_lu().solve(rhs);

        let delta: Vec<f64> = (0..dim).map(|i| sol.read(i, 0)).collect();
        if delta.iter().any(|d| !d.is_finite()) {
            return Err(OptimizerError::SolveFailed(
                "damped normal equations are singular".to_string(),
            ));
        }

        Ok(delta)
    }

    fn apply_step(
        &self,
        problem: &mut Problem,
        layout: &VariableLayout,
        delta: &[f64],
    ) -> Result<(f64, Vec<Vec<f64>>), OptimizerError> {
        let variables = problem.get_variables_mut();
        let mut snapshot = Vec::with_capacity(layout.var_names.len());

        for (idx, var_name) in layout.var_names.iter().enumerate() {
            let var = variables
                .get_mut(var_name)
                .ok_or_else(|| ProblemError::VariableNotFound {
                    name: var_name.clone(),
                })?;

            snapshot.push(var.values.clone());

            let start = layout.global_starts[idx];
            let block = &delta[start..start + layout.dims[idx]];
            for (v, d) in var.values.iter_mut().zip(block) {
                *v += d;
            }
        }

        let cost = problem.compute_total_cost()?;
        Ok((cost, snapshot))
    }

    /// Revert the step to the previous values.
    fn revert_step(
        &self,
        problem: &mut Problem,
        layout: &VariableLayout,
        snapshot: Vec<Vec<f64>>,
    ) -> Result<(), OptimizerError> {
        let variables = problem.get_variables_mut();

        for (var_name, old_vals) in layout.var_names.iter().zip(snapshot) {
            let var = variables
                .get_mut(var_name)
                .ok_or_else(|| ProblemError::VariableNotFound {
                    name: var_name.clone(),
                })?;
            var.values = old_vals;
        }

        Ok(())
    }
}
