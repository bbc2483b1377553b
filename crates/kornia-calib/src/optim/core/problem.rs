//! A least squares problem: named variables plus the factors that constrain them.

use std::collections::HashMap;

use thiserror::Error;

use super::factor::{Factor, FactorError};

/// Errors that can occur when working with optimization problems.
#[derive(Debug, Error)]
pub enum ProblemError {
    /// Variable with this name already exists
    #[error("Variable '{name}' already exists")]
    DuplicateVariable {
        /// Name of the variable.
        name: String,
    },
    /// Variable with this name was not found
    #[error("Variable '{name}' not found")]
    VariableNotFound {
        /// Name of the variable.
        name: String,
    },
    /// Dimension mismatch between expected and actual values
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected dimension.
        expected: usize,
        /// Dimension found.
        actual: usize,
    },
    /// Factor evaluation failed
    #[error("Factor evaluation failed: {0}")]
    FactorEvaluation(#[from] FactorError),
}

/// A Euclidean block of parameters to optimize.
#[derive(Debug, Clone)]
pub struct Variable {
    /// Name of the variable (used for referencing in factors)
    pub name: String,
    /// Current parameter values
    pub values: Vec<f64>,
}

impl Variable {
    /// Create a new variable of dimension `dim` initialized at zero.
    pub fn euclidean(name: impl Into<String>, dim: usize) -> Self {
        Self {
            name: name.into(),
            values: vec![0.0; dim],
        }
    }

    /// Get the dimension of this variable.
    pub fn dim(&self) -> usize {
        self.values.len()
    }
}

/// An optimization problem containing variables and factors.
#[derive(Default)]
pub struct Problem {
    /// Variables in the problem, indexed by name
    variables: HashMap<String, Variable>,
    /// Factors in the problem, each with the names of variables it connects
    factors: Vec<(Box<dyn Factor>, Vec<String>)>,
}

impl Problem {
    /// Create a new empty problem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a variable to the problem.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable with the same name already exists or the
    /// initial values do not match the variable's dimension.
    pub fn add_variable(
        &mut self,
        mut var: Variable,
        initial_values: Vec<f64>,
    ) -> Result<(), ProblemError> {
        if self.variables.contains_key(&var.name) {
            return Err(ProblemError::DuplicateVariable {
                name: var.name.clone(),
            });
        }
        if initial_values.len() != var.dim() {
            return Err(ProblemError::DimensionMismatch {
                expected: var.dim(),
                actual: initial_values.len(),
            });
        }
        var.values = initial_values;
        self.variables.insert(var.name.clone(), var);
        Ok(())
    }

    /// Add a factor connected to the named variables.
    ///
    /// # Errors
    ///
    /// Returns an error if any variable name doesn't exist or its dimension
    /// disagrees with what the factor expects.
    pub fn add_factor(
        &mut self,
        factor: Box<dyn Factor>,
        var_names: Vec<String>,
    ) -> Result<(), ProblemError> {
        if factor.num_variables() != var_names.len() {
            return Err(ProblemError::DimensionMismatch {
                expected: factor.num_variables(),
                actual: var_names.len(),
            });
        }
        for (idx, name) in var_names.iter().enumerate() {
            let var = self
                .variables
                .get(name)
                .ok_or_else(|| ProblemError::VariableNotFound { name: name.clone() })?;
            if var.dim() != factor.variable_dim(idx) {
                return Err(ProblemError::DimensionMismatch {
                    expected: factor.variable_dim(idx),
                    actual: var.dim(),
                });
            }
        }
        self.factors.push((factor, var_names));
        Ok(())
    }

    /// Get the variables of the problem.
    pub fn get_variables(&self) -> &HashMap<String, Variable> {
        &self.variables
    }

    /// Get mutable access to the variables of the problem.
    pub fn get_variables_mut(&mut self) -> &mut HashMap<String, Variable> {
        &mut self.variables
    }

    /// Get the factors of the problem with their connected variable names.
    pub fn get_factors(&self) -> &[(Box<dyn Factor>, Vec<String>)] {
        &self.factors
    }

    /// Current values of a variable.
    pub fn values(&self, name: &str) -> Result<&[f64], ProblemError> {
        self.variables
            .get(name)
            .map(|v| v.values.as_slice())
            .ok_or_else(|| ProblemError::VariableNotFound {
                name: name.to_string(),
            })
    }

    /// Total cost: the sum of squared residuals of every factor.
    pub fn compute_total_cost(&self) -> Result<f64, ProblemError> {
        let mut total_cost = 0.0;

        for (factor, var_names) in &self.factors {
            let params = self.factor_params(var_names)?;
            let result = factor.linearize(&params, false)?;
            total_cost += result.residual.iter().map(|r| r * r).sum::<f64>();
        }

        Ok(total_cost)
    }

    pub(crate) fn factor_params(&self, var_names: &[String]) -> Result<Vec<&[f64]>, ProblemError> {
        var_names
            .iter()
            .map(|name| self.values(name))
            .collect()
    }
}
