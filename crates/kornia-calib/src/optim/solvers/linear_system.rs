use std::collections::HashMap;

use super::OptimizerError;
use crate::optim::core::{FactorError, Problem, ProblemError};

/// Precomputed variable ordering and dimension layout for optimization.
#[derive(Debug, Clone)]
pub struct VariableLayout {
    /// Variable names, sorted.
    pub var_names: Vec<String>,
    /// Position of each variable in `var_names`.
    pub var_index_map: HashMap<String, usize>,
    /// First column of each variable in the stacked parameter vector.
    pub global_starts: Vec<usize>,
    /// Dimension of each variable.
    pub dims: Vec<usize>,
    /// Dimension of the stacked parameter vector.
    pub total_dim: usize,
}

impl VariableLayout {
    /// Lay out the variables of `problem` in name order.
    pub fn from_problem(problem: &Problem) -> Self {
        let variables = problem.get_variables();
        let mut var_names: Vec<String> = variables.keys().cloned().collect();
        var_names.sort();

        let var_index_map: HashMap<String, usize> = var_names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        let mut total_dim = 0;
        let mut dims = Vec::with_capacity(var_names.len());
        let mut global_starts = Vec::with_capacity(var_names.len());

        for name in &var_names {
            global_starts.push(total_dim);
            let dim = variables[name].dim();
            dims.push(dim);
            total_dim += dim;
        }

        Self {
            var_names,
            var_index_map,
            global_starts,
            dims,
            total_dim,
        }
    }
}

/// Builds normal equations from factors for a given layout.
pub struct LinearSystemBuilder;

impl LinearSystemBuilder {
    /// Accumulate `J^T J` and `J^T r` over every factor of the problem.
    pub fn build(
        problem: &Problem,
        layout: &VariableLayout,
    ) -> Result<(faer::Mat<f64>, Vec<f64>), OptimizerError> {
        let n = layout.total_dim;
        let mut jtj = faer::Mat::<f64>::zeros(n, n);
        let mut jtr = vec![0.0; n];

        for (factor, factor_var_names) in problem.get_factors() {
            let params = problem.factor_params(factor_var_names)?;
            let result = factor.linearize(&params, true)?;

            let jacobian = result.jacobian.as_ref().ok_or_else(|| {
                FactorError::JacobianFailed("Jacobian required for optimization".to_string())
            })?;

            let residual_dim = result.residual_dim();
            let cols = result.jacobian_cols;

            // (global start, dim, column offset inside the factor jacobian)
            let mut mapping = Vec::with_capacity(factor_var_names.len());
            let mut factor_col_offset = 0;
            for var_name in factor_var_names {
                let var_idx = *layout.var_index_map.get(var_name).ok_or_else(|| {
                    ProblemError::VariableNotFound {
                        name: var_name.clone(),
                    }
                })?;
                let dim = layout.dims[var_idx];
                mapping.push((layout.global_starts[var_idx], dim, factor_col_offset));
                factor_col_offset += dim;
            }

            if cols != factor_col_offset || jacobian.len() != residual_dim * cols {
                return Err(FactorError::DimensionMismatch {
                    expected: factor_col_offset,
                    actual: cols,
                }
                .into());
            }

            for row in 0..residual_dim {
                let jac_row = &jacobian[row * cols..(row + 1) * cols];
                let residual_val = result.residual[row];

                for &(start_i, dim_i, offset_i) in &mapping {
                    for di in 0..dim_i {
                        let jac_i = jac_row[offset_i + di];
                        if jac_i == 0.0 {
                            continue;
                        }
                        jtr[start_i + di] += jac_i * residual_val;

                        for &(start_j, dim_j, offset_j) in &mapping {
                            for dj in 0..dim_j {
                                let (r, c) = (start_i + di, start_j + dj);
                                jtj.write(r, c, jtj.read(r, c) + jac_i * jac_row[offset_j + dj]);
                            }
                        }
                    }
                }
            }
        }

        Ok((jtj, jtr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::core::{PriorFactor, Variable};

    #[test]
    fn test_layout_is_sorted() -> Result<(), ProblemError> {
        let mut problem = Problem::new();
        problem.add_variable(Variable::euclidean("b", 2), vec![0.0; 2])?;
        problem.add_variable(Variable::euclidean("a", 3), vec![0.0; 3])?;

        let layout = VariableLayout::from_problem(&problem);
        assert_eq!(layout.var_names, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(layout.global_starts, vec![0, 3]);
        assert_eq!(layout.total_dim, 5);
        Ok(())
    }

    #[test]
    fn test_build_prior_system() -> Result<(), Box<dyn std::error::Error>> {
        let mut problem = Problem::new();
        problem.add_variable(Variable::euclidean("x", 2), vec![1.0, 1.0])?;
        problem.add_factor(Box::new(PriorFactor::new(vec![0.0, 3.0])), vec!["x".into()])?;

        let layout = VariableLayout::from_problem(&problem);
        let (jtj, jtr) = LinearSystemBuilder::build(&problem, &layout)?;
        assert_eq!(jtj.read(0, 0), 1.0);
        assert_eq!(jtj.read(0, 1), 0.0);
        assert_eq!(jtj.read(1, 1), 1.0);
        assert_eq!(jtr, vec![1.0, -2.0]);
        Ok(())
    }
}
