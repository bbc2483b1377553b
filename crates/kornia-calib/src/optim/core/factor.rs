//! Factor trait for least squares problems.
//!
//! A factor computes a residual (error) from the values of the variables it is
//! connected to and, on request, the Jacobian of that residual.

use thiserror::Error;

/// Errors raised while evaluating a factor.
#[derive(Debug, Error)]
pub enum FactorError {
    /// Invalid dimension mismatch
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Expected dimension.
        expected: usize,
        /// Dimension found.
        actual: usize,
    },

    /// Jacobian computation failed
    #[error("Jacobian computation failed: {0}")]
    JacobianFailed(String),
}

/// Result type for factor operations
pub type FactorResult<T> = Result<T, FactorError>;

/// Output of factor linearization
#[derive(Debug, Clone)]
pub struct LinearizationResult {
    /// Residual vector (error)
    pub residual: Vec<f64>,
    /// Jacobian matrix (row-major, flattened)
    /// Shape: (residual_dim, jacobian_cols)
    pub jacobian: Option<Vec<f64>>,
    /// Number of Jacobian columns, the summed dimension of the connected variables
    pub jacobian_cols: usize,
}

impl LinearizationResult {
    /// Create a new linearization result
    pub fn new(residual: Vec<f64>, jacobian: Option<Vec<f64>>, jacobian_cols: usize) -> Self {
        Self {
            residual,
            jacobian,
            jacobian_cols,
        }
    }

    /// Get the residual dimension
    pub fn residual_dim(&self) -> usize {
        self.residual.len()
    }
}

/// A measurement or constraint connecting one or more variables.
///
/// Factors must be `Send + Sync` so a problem can be shared across threads.
pub trait Factor: Send + Sync {
    /// Compute the residual and optionally the Jacobian at the given parameter values.
    ///
    /// # Arguments
    ///
    /// * `params` - One slice of values per connected variable, in connection order
    /// * `compute_jacobian` - Whether to compute the Jacobian matrix
    fn linearize(
        &self,
        params: &[&[f64]],
        compute_jacobian: bool,
    ) -> FactorResult<LinearizationResult>;

    /// Number of elements in the residual vector.
    fn residual_dim(&self) -> usize;

    /// Number of variables this factor connects.
    fn num_variables(&self) -> usize;

    /// Dimension of the connected variable at `idx`.
    fn variable_dim(&self, idx: usize) -> usize;

    /// Summed dimension of all connected variables.
    fn total_dim(&self) -> usize {
        (0..self.num_variables()).map(|i| self.variable_dim(i)).sum()
    }
}

/// Central-difference Jacobian of `residual_fn` with respect to a set of
/// parameter blocks.
///
/// The returned matrix is row-major with shape `(residual_dim, sum(block dims))`,
/// columns following the block order.
pub fn numerical_jacobian<F>(
    params: &[&[f64]],
    residual_dim: usize,
    step: f64,
    mut residual_fn: F,
) -> FactorResult<Vec<f64>>
where
    F: FnMut(&[Vec<f64>]) -> FactorResult<Vec<f64>>,
{
    let cols: usize = params.iter().map(|p| p.len()).sum();
    let mut jacobian = vec![0.0; residual_dim * cols];
    let mut work: Vec<Vec<f64>> = params.iter().map(|p| p.to_vec()).collect();

    let mut col = 0;
    for block in 0..work.len() {
        for i in 0..work[block].len() {
            let original = work[block][i];
            // step scales with the parameter magnitude
            let h = step * original.abs().max(1.0);

            work[block][i] = original + h;
            let plus = residual_fn(&work)?;
            work[block][i] = original - h;
            let minus = residual_fn(&work)?;
            work[block][i] = original;

            if plus.len() != residual_dim || minus.len() != residual_dim {
                return Err(FactorError::DimensionMismatch {
                    expected: residual_dim,
                    actual: plus.len(),
                });
            }

            let inv_2h = 1.0 / (2.0 * h);
            for r in 0..residual_dim {
                jacobian[r * cols + col] = (plus[r] - minus[r]) * inv_2h;
            }
            col += 1;
        }
    }

    Ok(jacobian)
}

/// A prior factor that penalizes deviation from a target value.
///
/// Residual: r = x - target
#[cfg(test)]
#[derive(Debug, Clone)]
pub(crate) struct PriorFactor {
    target: Vec<f64>,
}

#[cfg(test)]
impl PriorFactor {
    pub(crate) fn new(target: Vec<f64>) -> Self {
        Self { target }
    }
}

#[cfg(test)]
impl Factor for PriorFactor {
    fn linearize(
        &self,
        params: &[&[f64]],
        compute_jacobian: bool,
    ) -> FactorResult<LinearizationResult> {
        if params.len() != 1 {
            return Err(FactorError::DimensionMismatch {
                expected: 1,
                actual: params.len(),
            });
        }

        let x = params[0];
        if x.len() != self.target.len() {
            return Err(FactorError::DimensionMismatch {
                expected: self.target.len(),
                actual: x.len(),
            });
        }

        let residual: Vec<f64> = x.iter().zip(&self.target).map(|(xi, ti)| xi - ti).collect();

        let jacobian = compute_jacobian.then(|| {
            let n = x.len();
            let mut jac = vec![0.0; n * n];
            for i in 0..n {
                jac[i * n + i] = 1.0;
            }
            jac
        });

        Ok(LinearizationResult::new(residual, jacobian, x.len()))
    }

    fn residual_dim(&self) -> usize {
        self.target.len()
    }

    fn num_variables(&self) -> usize {
        1
    }

    fn variable_dim(&self, _idx: usize) -> usize {
        self.target.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_prior_factor() -> FactorResult<()> {
        let factor = PriorFactor::new(vec![1.0, 2.0, 3.0]);
        let params = [1.5, 2.5, 3.5];

        let result = factor.linearize(&[&params], true)?;
        assert_eq!(result.residual, vec![0.5, 0.5, 0.5]);

        let jac = result
            .jacobian
            .ok_or(FactorError::JacobianFailed("missing jacobian".to_string()))?;
        assert_eq!(jac.len(), 9);
        assert_eq!((jac[0], jac[4], jac[8]), (1.0, 1.0, 1.0));
        assert_eq!(factor.total_dim(), 3);
        Ok(())
    }

    #[test]
    fn test_prior_factor_dimension_mismatch() {
        let factor = PriorFactor::new(vec![1.0, 2.0]);
        let params = [1.0];
        assert!(matches!(
            factor.linearize(&[&params], false),
            Err(FactorError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_numerical_jacobian_two_blocks() -> FactorResult<()> {
        // r = [a0 * b0, a1 + b0^2]
        let a = [2.0, -1.0];
        let b = [3.0];
        let jac = numerical_jacobian(&[&a, &b], 2, 1e-6, |p| {
            Ok(vec![p[0][0] * p[1][0], p[0][1] + p[1][0] * p[1][0]])
        })?;

        let expected = [3.0, 0.0, 2.0, 0.0, 1.0, 6.0];
        for (j, e) in jac.iter().zip(expected.iter()) {
            assert_relative_eq!(*j, *e, epsilon = 1e-6);
        }
        Ok(())
    }
}
