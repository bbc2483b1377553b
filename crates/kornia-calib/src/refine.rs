//! Levenberg-Marquardt refinement of a closed-form camera model.
//!
//! The residuals are the pixel differences `projected - observed` of every point
//! of every view. Intrinsics `[fx, fy, cx, cy]` and the distortion terms of the
//! selected model are always free; per-view poses `[rvec, t]` are free only in
//! [`Refinement::Joint`] mode and are otherwise baked into the factors. Skew is
//! held at its closed-form value.

use serde::{Deserialize, Serialize};

use crate::optim::{
    numerical_jacobian, Factor, FactorError, FactorResult, LevenbergMarquardt,
    LinearizationResult, OptimizerError, Problem, TerminationReason, Variable,
};
use crate::projection::{project_point, Distortion, DistortionModel};
use crate::types::{CameraIntrinsics, Pose, View};

const INTRINSICS_VAR: &str = "intrinsics";
const DISTORTION_VAR: &str = "distortion";
const POSE_DIM: usize = 6;
const JACOBIAN_STEP: f64 = 1e-7;

/// Which parameters the nonlinear stage is allowed to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Refinement {
    /// Skip refinement and report the closed-form model.
    ClosedFormOnly,
    /// Refine intrinsics and distortion with the poses held fixed.
    #[default]
    IntrinsicsOnly,
    /// Refine intrinsics, distortion and every view's pose together.
    Joint,
}

/// Parameters controlling the LM refinement.
#[derive(Debug, Clone)]
pub struct RefineParams {
    /// Which parameter blocks are free.
    pub refinement: Refinement,
    /// Distortion terms to estimate.
    pub distortion_model: DistortionModel,
    /// Maximum number of LM iterations.
    pub max_iterations: usize,
    /// Convergence threshold on the relative cost change.
    pub cost_tolerance: f64,
    /// Convergence threshold on gradient norm.
    pub gradient_tolerance: f64,
    /// Initial damping factor (lambda).
    pub initial_lambda: f64,
}

impl Default for RefineParams {
    fn default() -> Self {
        Self {
            refinement: Refinement::default(),
            distortion_model: DistortionModel::default(),
            max_iterations: 50,
            cost_tolerance: 1e-10,
            gradient_tolerance: 1e-10,
            initial_lambda: 1e-3,
        }
    }
}

/// How the refinement stage ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RefinementOutcome {
    /// Refinement was not requested.
    Skipped,
    /// The optimizer met a convergence criterion.
    Converged,
    /// The optimizer ran out of iterations or damping; the best model found is kept.
    Stopped,
    /// Refinement failed and the closed-form model was kept.
    FellBack(String),
}

/// Summary of the refinement stage of a calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementReport {
    /// The refinement mode that was requested.
    pub mode: Refinement,
    /// How the stage ended.
    pub outcome: RefinementOutcome,
    /// Sum of squared residuals of the closed-form model.
    pub initial_cost: f64,
    /// Sum of squared residuals of the returned model.
    pub final_cost: f64,
    /// Number of LM iterations performed.
    pub iterations: usize,
}

/// A camera model produced by [`refine_calibration`].
#[derive(Debug, Clone)]
pub struct RefinedModel {
    /// The refined intrinsics.
    pub intrinsics: CameraIntrinsics,
    /// The refined distortion.
    pub distortion: Distortion,
    /// The per-view poses, unchanged unless refined jointly.
    pub poses: Vec<Pose>,
    /// Optimizer summary.
    pub report: RefinementReport,
}

/// Reprojection residuals of all points of one view.
///
/// Connected variables: `intrinsics`, `distortion` and, when the pose is free,
/// the view's pose block.
struct ViewReprojectionFactor {
    object_points: Vec<[f64; 3]>,
    image_points: Vec<[f64; 2]>,
    skew: f64,
    model: DistortionModel,
    fixed_pose: Option<Pose>,
}

impl ViewReprojectionFactor {
    fn residuals(&self, params: &[&[f64]]) -> FactorResult<Vec<f64>> {
        if params.len() != self.num_variables() {
            return Err(FactorError::DimensionMismatch {
                expected: self.num_variables(),
                actual: params.len(),
            });
        }
        let (intr, dist) = (params[0], params[1]);
        if intr.len() != 4 {
            return Err(FactorError::DimensionMismatch {
                expected: 4,
                actual: intr.len(),
            });
        }

        let intrinsics = CameraIntrinsics {
            fx: intr[0],
            fy: intr[1],
            cx: intr[2],
            cy: intr[3],
            skew: self.skew,
        };
        let distortion = Distortion::from_params(self.model, dist);
        let pose = match &self.fixed_pose {
            Some(pose) => *pose,
            None => pose_from_params(params[2])?,
        };

        let mut residual = Vec::with_capacity(self.residual_dim());
        for (pw, pi) in self.object_points.iter().zip(&self.image_points) {
            let [u, v] = project_point(pw, &intrinsics, &pose, &distortion);
            residual.push(u - pi[0]);
            residual.push(v - pi[1]);
        }
        Ok(residual)
    }
}

impl Factor for ViewReprojectionFactor {
    fn linearize(
        &self,
        params: &[&[f64]],
        compute_jacobian: bool,
    ) -> FactorResult<LinearizationResult> {
        let residual = self.residuals(params)?;

        let jacobian = if compute_jacobian {
            let jac = numerical_jacobian(params, residual.len(), JACOBIAN_STEP, |p| {
                let views: Vec<&[f64]> = p.iter().map(Vec::as_slice).collect();
                self.residuals(&views)
            })?;
            Some(jac)
        } else {
            None
        };

        Ok(LinearizationResult::new(residual, jacobian, self.total_dim()))
    }

    fn residual_dim(&self) -> usize {
        2 * self.object_points.len()
    }

    fn num_variables(&self) -> usize {
        if self.fixed_pose.is_some() {
            2
        } else {
            3
        }
    }

    fn variable_dim(&self, idx: usize) -> usize {
        match idx {
            0 => 4,
            1 => self.model.num_params(),
            _ => POSE_DIM,
        }
    }
}

fn pose_var_name(view_idx: usize) -> String {
    format!("pose_{view_idx:04}")
}

fn pose_to_params(pose: &Pose) -> Vec<f64> {
    let r = pose.rvec();
    let t = pose.translation;
    vec![r[0], r[1], r[2], t[0], t[1], t[2]]
}

fn pose_from_params(params: &[f64]) -> FactorResult<Pose> {
    if params.len() != POSE_DIM {
        return Err(FactorError::DimensionMismatch {
            expected: POSE_DIM,
            actual: params.len(),
        });
    }
    Ok(Pose::from_rvec(
        &[params[0], params[1], params[2]],
        [params[3], params[4], params[5]],
    ))
}

/// Refine a closed-form camera model by minimizing the reprojection error.
///
/// With [`Refinement::ClosedFormOnly`] the inputs are returned untouched and the
/// report carries the closed-form cost.
///
/// # Arguments
///
/// * `views` - The observed correspondences, one entry per pose.
/// * `intrinsics` - The initial intrinsics.
/// * `distortion` - The initial distortion, usually zero.
/// * `poses` - The initial per-view poses.
/// * `params` - Refinement settings.
///
/// # Errors
///
/// Returns an [`OptimizerError`] if the problem cannot be built, the normal
/// equations are singular, a cost is not finite or the final cost exceeds the
/// initial cost. Callers are expected to fall back to the initial model.
pub fn refine_calibration(
    views: &[View],
    intrinsics: &CameraIntrinsics,
    distortion: &Distortion,
    poses: &[Pose],
    params: &RefineParams,
) -> Result<RefinedModel, OptimizerError> {
    if views.len() != poses.len() {
        return Err(FactorError::DimensionMismatch {
            expected: views.len(),
            actual: poses.len(),
        }
        .into());
    }

    let model = params.distortion_model;
    let refine_poses = params.refinement == Refinement::Joint;

    let mut problem = Problem::new();
    problem.add_variable(
        Variable::euclidean(INTRINSICS_VAR, 4),
        vec![intrinsics.fx, intrinsics.fy, intrinsics.cx, intrinsics.cy],
    )?;
    problem.add_variable(
        Variable::euclidean(DISTORTION_VAR, model.num_params()),
        distortion.to_params(model),
    )?;

    for (idx, (view, pose)) in views.iter().zip(poses).enumerate() {
        let mut var_names = vec![INTRINSICS_VAR.to_string(), DISTORTION_VAR.to_string()];
        let fixed_pose = if refine_poses {
            let name = pose_var_name(idx);
            problem.add_variable(
                Variable::euclidean(name.clone(), POSE_DIM),
                pose_to_params(pose),
            )?;
            var_names.push(name);
            None
        } else {
            Some(*pose)
        };

        let factor = ViewReprojectionFactor {
            object_points: view.object_points.clone(),
            image_points: view.image_points.clone(),
            skew: intrinsics.skew,
            model,
            fixed_pose,
        };
        problem.add_factor(Box::new(factor), var_names)?;
    }

    if params.refinement == Refinement::ClosedFormOnly {
        let cost = problem.compute_total_cost()?;
        return Ok(RefinedModel {
            intrinsics: *intrinsics,
            distortion: *distortion,
            poses: poses.to_vec(),
            report: RefinementReport {
                mode: params.refinement,
                outcome: RefinementOutcome::Skipped,
                initial_cost: cost,
                final_cost: cost,
                iterations: 0,
            },
        });
    }

    let optimizer = LevenbergMarquardt {
        lambda_init: params.initial_lambda,
        max_iterations: params.max_iterations,
        cost_tolerance: params.cost_tolerance,
        gradient_tolerance: params.gradient_tolerance,
        ..Default::default()
    };
    let result = optimizer.optimize(&mut problem)?;

    log::debug!(
        "refinement ({:?}): cost {:.6e} -> {:.6e} in {} iterations ({:?})",
        params.refinement,
        result.initial_cost,
        result.final_cost,
        result.iterations,
        result.termination_reason
    );

    if !result.final_cost.is_finite() || result.final_cost > result.initial_cost {
        return Err(OptimizerError::NumericalInstability(format!(
            "refined cost {:.6e} exceeds the initial cost {:.6e}",
            result.final_cost, result.initial_cost
        )));
    }

    let intr = problem.values(INTRINSICS_VAR)?;
    let refined_intrinsics = CameraIntrinsics {
        fx: intr[0],
        fy: intr[1],
        cx: intr[2],
        cy: intr[3],
        skew: intrinsics.skew,
    };
    let valid = refined_intrinsics.fx.is_finite()
        && refined_intrinsics.fy.is_finite()
        && refined_intrinsics.fx > 0.0
        && refined_intrinsics.fy > 0.0
        && refined_intrinsics.cx.is_finite()
        && refined_intrinsics.cy.is_finite();
    if !valid {
        return Err(OptimizerError::NumericalInstability(format!(
            "refined intrinsics are not physical: {refined_intrinsics:?}"
        )));
    }

    let refined_distortion = Distortion::from_params(model, problem.values(DISTORTION_VAR)?);

    let refined_poses = if refine_poses {
        (0..views.len())
            .map(|idx| {
                let values = problem.values(&pose_var_name(idx))?;
                Ok(pose_from_params(values)?)
            })
            .collect::<Result<Vec<_>, OptimizerError>>()?
    } else {
        poses.to_vec()
    };

    let outcome = match result.termination_reason {
        TerminationReason::CostConverged | TerminationReason::GradientConverged => {
            RefinementOutcome::Converged
        }
        TerminationReason::MaxIterations | TerminationReason::LambdaMaxExceeded => {
            RefinementOutcome::Stopped
        }
    };

    Ok(RefinedModel {
        intrinsics: refined_intrinsics,
        distortion: refined_distortion,
        poses: refined_poses,
        report: RefinementReport {
            mode: params.refinement,
            outcome,
            initial_cost: result.initial_cost,
            final_cost: result.final_cost,
            iterations: result.iterations,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::{project_points, reprojection_errors};
    use approx::assert_relative_eq;

    fn make_intrinsics() -> CameraIntrinsics {
        CameraIntrinsics {
            fx: 820.0,
            fy: 800.0,
            cx: 330.0,
            cy: 245.0,
            skew: 0.0,
        }
    }

    fn make_scene(
        distortion: &Distortion,
    ) -> Result<(Vec<View>, Vec<Pose>), crate::CalibrationError> {
        let grid: Vec<[f64; 3]> = (0..6)
            .flat_map(|r| (0..8).map(move |c| [c as f64 * 0.03, r as f64 * 0.03, 0.0]))
            .collect();
        let poses = vec![
            Pose::from_rvec(&[0.2, -0.1, 0.05], [-0.1, -0.08, 0.6]),
            Pose::from_rvec(&[-0.15, 0.25, -0.1], [-0.12, -0.05, 0.7]),
            Pose::from_rvec(&[0.05, 0.3, 0.2], [-0.08, -0.1, 0.55]),
            Pose::from_rvec(&[-0.3, -0.2, 0.0], [-0.1, -0.06, 0.65]),
        ];
        let views = poses
            .iter()
            .map(|pose| {
                let image = project_points(&grid, &make_intrinsics(), pose, distortion);
                View::new(image, grid.clone())
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((views, poses))
    }

    #[test]
    fn test_refine_recovers_perturbed_intrinsics() -> Result<(), Box<dyn std::error::Error>> {
        let truth = Distortion {
            k1: -0.2,
            k2: 0.05,
            ..Default::default()
        };
        let (views, poses) = make_scene(&truth)?;
        let start = CameraIntrinsics {
            fx: 810.0,
            fy: 806.0,
            cx: 325.0,
            cy: 250.0,
            skew: 0.0,
        };

        let refined = refine_calibration(
            &views,
            &start,
            &Distortion::default(),
            &poses,
            &RefineParams::default(),
        )?;

        let gt = make_intrinsics();
        assert_relative_eq!(refined.intrinsics.fx, gt.fx, max_relative = 1e-4);
        assert_relative_eq!(refined.intrinsics.fy, gt.fy, max_relative = 1e-4);
        assert_relative_eq!(refined.intrinsics.cx, gt.cx, epsilon = 0.05);
        assert_relative_eq!(refined.intrinsics.cy, gt.cy, epsilon = 0.05);
        assert_relative_eq!(refined.distortion.k1, truth.k1, epsilon = 1e-3);
        assert!(refined.report.final_cost < refined.report.initial_cost);
        assert_eq!(refined.poses, poses);

        let stats = reprojection_errors(
            &views,
            &refined.intrinsics,
            &refined.poses,
            &refined.distortion,
        );
        assert!(stats.rms < 1e-3);
        Ok(())
    }

    #[test]
    fn test_refine_closed_form_only_is_identity() -> Result<(), Box<dyn std::error::Error>> {
        let (views, poses) = make_scene(&Distortion::default())?;
        let start = CameraIntrinsics {
            fx: 900.0,
            ..make_intrinsics()
        };
        let params = RefineParams {
            refinement: Refinement::ClosedFormOnly,
            ..Default::default()
        };

        let refined = refine_calibration(&views, &start, &Distortion::default(), &poses, &params)?;
        assert_eq!(refined.intrinsics, start);
        assert_eq!(refined.report.outcome, RefinementOutcome::Skipped);
        assert_eq!(refined.report.iterations, 0);
        assert_eq!(refined.report.initial_cost, refined.report.final_cost);
        Ok(())
    }

    #[test]
    fn test_refine_joint_moves_poses() -> Result<(), Box<dyn std::error::Error>> {
        let (views, poses) = make_scene(&Distortion::default())?;
        let perturbed: Vec<Pose> = poses
            .iter()
            .map(|p| {
                let mut t = p.translation;
                t[0] += 0.005;
                Pose::from_rvec(&p.rvec(), t)
            })
            .collect();
        let params = RefineParams {
            refinement: Refinement::Joint,
            ..Default::default()
        };

        let refined = refine_calibration(
            &views,
            &make_intrinsics(),
            &Distortion::default(),
            &perturbed,
            &params,
        )?;
        for (est, gt) in refined.poses.iter().zip(&poses) {
            assert_relative_eq!(est.translation[0], gt.translation[0], epsilon = 1e-5);
        }
        assert!(refined.report.final_cost <= refined.report.initial_cost);
        Ok(())
    }

    #[test]
    fn test_refine_rejects_mismatched_poses() -> Result<(), Box<dyn std::error::Error>> {
        let (views, poses) = make_scene(&Distortion::default())?;
        let res = refine_calibration(
            &views,
            &make_intrinsics(),
            &Distortion::default(),
            &poses[..2],
            &RefineParams::default(),
        );
        assert!(res.is_err());
        Ok(())
    }
}
