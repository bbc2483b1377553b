//! The calibration engine: closed-form initialization followed by refinement.

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::CalibrationError;
use crate::extrinsics::recover_pose;
use crate::homography::{find_homography_dlt, MIN_HOMOGRAPHY_POINTS};
use crate::intrinsics::{apply_principal_point_hint, solve_intrinsics, MIN_VIEWS};
use crate::projection::{reprojection_errors, Distortion, DistortionModel};
use crate::optim::OptimizerError;
use crate::refine::{
    refine_calibration, RefineParams, RefinedModel, Refinement, RefinementOutcome,
    RefinementReport,
};
use crate::types::{CameraIntrinsics, ImageSize, Pose, View};

/// The `rms` reported when refinement failed and the closed-form model is returned.
pub const RMS_SENTINEL: f64 = -1.0;

/// Largest accepted `|Z|` of an object point, relative to the target extent.
const PLANE_TOLERANCE: f64 = 1e-9;

/// Parameters controlling a calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    /// Distortion terms to estimate.
    pub distortion_model: DistortionModel,
    /// Which parameters the nonlinear stage refines.
    pub refinement: Refinement,
    /// Maximum number of LM iterations.
    pub max_iterations: usize,
    /// Convergence threshold on the relative cost change.
    pub convergence_tolerance: f64,
    /// Convergence threshold on gradient norm.
    pub gradient_tolerance: f64,
    /// Initial damping factor (lambda).
    pub initial_lambda: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            distortion_model: DistortionModel::Radial2,
            refinement: Refinement::IntrinsicsOnly,
            max_iterations: 50,
            convergence_tolerance: 1e-10,
            gradient_tolerance: 1e-10,
            initial_lambda: 1e-3,
        }
    }
}

impl CalibrationConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the distortion model.
    pub fn with_distortion_model(mut self, model: DistortionModel) -> Self {
        self.distortion_model = model;
        self
    }

    /// Set the refinement mode.
    pub fn with_refinement(mut self, refinement: Refinement) -> Self {
        self.refinement = refinement;
        self
    }

    /// Choose between intrinsics-only (`true`) and joint (`false`) refinement.
    pub fn with_refine_intrinsics_only(mut self, intrinsics_only: bool) -> Self {
        self.refinement = if intrinsics_only {
            Refinement::IntrinsicsOnly
        } else {
            Refinement::Joint
        };
        self
    }

    /// Set maximum iterations.
    pub fn with_max_iterations(mut self, max_iters: usize) -> Self {
        self.max_iterations = max_iters;
        self
    }

    /// Set the relative cost change tolerance.
    pub fn with_convergence_tolerance(mut self, tol: f64) -> Self {
        self.convergence_tolerance = tol;
        self
    }

    /// Set gradient tolerance.
    pub fn with_gradient_tolerance(mut self, tol: f64) -> Self {
        self.gradient_tolerance = tol;
        self
    }

    /// Set initial lambda.
    pub fn with_initial_lambda(mut self, lambda: f64) -> Self {
        self.initial_lambda = lambda;
        self
    }

    fn refine_params(&self) -> RefineParams {
        RefineParams {
            refinement: self.refinement,
            distortion_model: self.distortion_model,
            max_iterations: self.max_iterations,
            cost_tolerance: self.convergence_tolerance,
            gradient_tolerance: self.gradient_tolerance,
            initial_lambda: self.initial_lambda,
        }
    }
}

/// The camera model estimated by [`calibrate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationResult {
    /// The shared camera intrinsics.
    pub intrinsics: CameraIntrinsics,
    /// The lens distortion.
    pub distortion: Distortion,
    /// One object to camera pose per input view, in input order.
    pub poses: Vec<Pose>,
    /// Overall RMS reprojection error in pixels, or [`RMS_SENTINEL`] on fallback.
    pub rms: f64,
    /// RMS reprojection error of each view in pixels.
    pub per_view_errors: Vec<f64>,
    /// Summary of the refinement stage.
    pub refinement: RefinementReport,
}

impl CalibrationResult {
    /// Whether the reported model went through a successful refinement.
    pub fn is_refined(&self) -> bool {
        matches!(
            self.refinement.outcome,
            RefinementOutcome::Converged | RefinementOutcome::Stopped
        )
    }

    /// Whether refinement failed and the closed-form model was returned.
    pub fn is_fallback(&self) -> bool {
        self.rms == RMS_SENTINEL
    }
}

// prefix input errors with the offending view
fn in_view(idx: usize, err: CalibrationError) -> CalibrationError {
    match err {
        CalibrationError::InvalidInput(msg) => {
            CalibrationError::invalid(format!("view {idx}: {msg}"))
        }
        other => other,
    }
}

fn validate_views(views: &[View]) -> Result<(), CalibrationError> {
    if views.is_empty() {
        return Err(CalibrationError::invalid("no views supplied"));
    }
    for (idx, view) in views.iter().enumerate() {
        view.validate().map_err(|e| in_view(idx, e))?;

        let extent = view
            .object_points
            .iter()
            .fold(1.0_f64, |m, p| m.max(p[0].abs()).max(p[1].abs()));
        if let Some(p) = view
            .object_points
            .iter()
            .find(|p| p[2].abs() > PLANE_TOLERANCE * extent)
        {
            return Err(CalibrationError::invalid(format!(
                "view {idx}: object point {p:?} does not lie on the Z = 0 plane"
            )));
        }

        if view.len() < MIN_HOMOGRAPHY_POINTS {
            return Err(CalibrationError::invalid(format!(
                "view {idx}: at least {MIN_HOMOGRAPHY_POINTS} correspondences required, got {}",
                view.len()
            )));
        }
    }
    if views.len() < MIN_VIEWS {
        return Err(CalibrationError::InsufficientViews {
            required: MIN_VIEWS,
            actual: views.len(),
        });
    }
    Ok(())
}

/// Calibrate a camera from several views of a planar target.
///
/// Per view a homography is estimated, the shared intrinsics are solved in
/// closed form from all homographies, every pose is recovered by decomposition
/// and the model is then refined according to `config.refinement`.
///
/// If refinement fails (singular system, non-finite cost or a cost increase)
/// the closed-form model with zero distortion is returned with `rms` set to
/// [`RMS_SENTINEL`]; the per-view errors still describe that model.
///
/// # Arguments
///
/// * `views` - The correspondences of each view, at least three. Object points
///   must lie on the `Z = 0` plane.
/// * `image_size` - The frame size, used to sanity check the principal point.
/// * `config` - Refinement settings.
///
/// # Errors
///
/// Returns [`CalibrationError::InvalidInput`] for empty, mismatched, non-finite
/// or non-planar input and degenerate point sets, and
/// [`CalibrationError::InsufficientViews`] for fewer than three views or views
/// that do not span enough orientations.
///
/// # Example
///
/// ```
/// use kornia_calib::{calibrate, synthetic, CalibrationConfig, CameraIntrinsics};
///
/// let intrinsics = CameraIntrinsics { fx: 800.0, fy: 800.0, cx: 320.0, cy: 240.0, skew: 0.0 };
/// let scene = synthetic::SyntheticScene::new(intrinsics, Default::default(), 5);
/// let config = CalibrationConfig::default();
/// let result = calibrate(&scene.views, scene.image_size, &config).unwrap();
/// assert!((result.intrinsics.fx - 800.0).abs() < 8.0);
/// ```
pub fn calibrate(
    views: &[View],
    image_size: ImageSize,
    config: &CalibrationConfig,
) -> Result<CalibrationResult, CalibrationError> {
    calibrate_with(views, image_size, config, refine_calibration)
}

// the pipeline with `refine` as its nonlinear stage
fn calibrate_with<F>(
    views: &[View],
    image_size: ImageSize,
    config: &CalibrationConfig,
    refine: F,
) -> Result<CalibrationResult, CalibrationError>
where
    F: FnOnce(
        &[View],
        &CameraIntrinsics,
        &Distortion,
        &[Pose],
        &RefineParams,
    ) -> Result<RefinedModel, OptimizerError>,
{
    validate_views(views)?;

    let homographies = views
        .iter()
        .enumerate()
        .map(|(idx, view)| {
            find_homography_dlt(&view.object_points_xy(), &view.image_points)
                .map_err(|e| in_view(idx, e))
        })
        .collect::<Result<Vec<_>, _>>()?;
    debug!("estimated {} homographies", homographies.len());

    let intrinsics = apply_principal_point_hint(solve_intrinsics(&homographies)?, &image_size);

    let poses = homographies
        .iter()
        .map(|homo| recover_pose(homo, &intrinsics))
        .collect::<Result<Vec<_>, _>>()?;

    let closed_form_distortion = Distortion::default();

    match refine(
        views,
        &intrinsics,
        &closed_form_distortion,
        &poses,
        &config.refine_params(),
    ) {
        Ok(refined) => {
            let stats = reprojection_errors(
                views,
                &refined.intrinsics,
                &refined.poses,
                &refined.distortion,
            );
            debug!(
                "calibrated {} views: rms {:.4} px, {:?}",
                views.len(),
                stats.rms,
                refined.intrinsics
            );
            Ok(CalibrationResult {
                intrinsics: refined.intrinsics,
                distortion: refined.distortion,
                poses: refined.poses,
                rms: stats.rms,
                per_view_errors: stats.per_view_errors,
                refinement: refined.report,
            })
        }
        Err(err) => {
            warn!("refinement failed, keeping the closed-form model: {err}");
            let stats = reprojection_errors(views, &intrinsics, &poses, &closed_form_distortion);
            Ok(CalibrationResult {
                intrinsics,
                distortion: closed_form_distortion,
                poses,
                rms: RMS_SENTINEL,
                per_view_errors: stats.per_view_errors,
                refinement: RefinementReport {
                    mode: config.refinement,
                    outcome: RefinementOutcome::FellBack(err.to_string()),
                    initial_cost: stats.total_squared_error,
                    final_cost: stats.total_squared_error,
                    iterations: 0,
                },
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthetic::SyntheticScene;

    fn square_view(offset: f64) -> Result<View, CalibrationError> {
        View::new(
            vec![
                [offset, offset],
                [offset + 10.0, offset],
                [offset + 10.0, offset + 10.0],
                [offset, offset + 10.0],
            ],
            vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [1.0, 1.0, 0.0],
                [0.0, 1.0, 0.0],
            ],
        )
    }

    #[test]
    fn test_config_builders() {
        let config = CalibrationConfig::new()
            .with_distortion_model(DistortionModel::Radial3)
            .with_refine_intrinsics_only(false)
            .with_max_iterations(10)
            .with_convergence_tolerance(1e-6)
            .with_gradient_tolerance(1e-7)
            .with_initial_lambda(1e-2);
        assert_eq!(config.distortion_model, DistortionModel::Radial3);
        assert_eq!(config.refinement, Refinement::Joint);
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.convergence_tolerance, 1e-6);
        assert_eq!(config.gradient_tolerance, 1e-7);
        assert_eq!(config.initial_lambda, 1e-2);
        assert_eq!(
            CalibrationConfig::default().refinement,
            Refinement::IntrinsicsOnly
        );
    }

    #[test]
    fn test_calibrate_empty() {
        let size = ImageSize {
            width: 640,
            height: 480,
        };
        assert!(matches!(
            calibrate(&[], size, &CalibrationConfig::default()),
            Err(CalibrationError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_calibrate_two_views() -> Result<(), CalibrationError> {
        let views = vec![square_view(0.0)?, square_view(5.0)?];
        let size = ImageSize {
            width: 640,
            height: 480,
        };
        assert_eq!(
            calibrate(&views, size, &CalibrationConfig::default()),
            Err(CalibrationError::InsufficientViews {
                required: 3,
                actual: 2
            })
        );
        Ok(())
    }

    #[test]
    fn test_calibrate_too_few_points() -> Result<(), CalibrationError> {
        let mut views = vec![square_view(0.0)?, square_view(5.0)?, square_view(9.0)?];
        views[1].image_points.pop();
        views[1].object_points.pop();
        let size = ImageSize {
            width: 640,
            height: 480,
        };
        assert!(matches!(
            calibrate(&views, size, &CalibrationConfig::default()),
            Err(CalibrationError::InvalidInput(_))
        ));
        Ok(())
    }

    #[test]
    fn test_calibrate_mismatched_view() -> Result<(), CalibrationError> {
        let mut views = vec![square_view(0.0)?, square_view(5.0)?, square_view(9.0)?];
        views[2].object_points.push([2.0, 2.0, 0.0]);
        let size = ImageSize {
            width: 640,
            height: 480,
        };
        assert!(matches!(
            calibrate(&views, size, &CalibrationConfig::default()),
            Err(CalibrationError::InvalidInput(_))
        ));
        Ok(())
    }

    #[test]
    fn test_calibrate_rejects_non_planar_points() -> Result<(), CalibrationError> {
        let mut views = vec![square_view(0.0)?, square_view(5.0)?, square_view(9.0)?];
        views[1].object_points[2][2] = 0.05;
        let size = ImageSize {
            width: 640,
            height: 480,
        };
        match calibrate(&views, size, &CalibrationConfig::default()) {
            Err(CalibrationError::InvalidInput(message)) => {
                assert!(message.starts_with("view 1"), "{message}");
                assert!(message.contains("Z = 0"), "{message}");
            }
            other => panic!("unexpected result: {other:?}"),
        }

        // signed zeros and rounding noise are still planar
        views[1].object_points[2][2] = -0.0;
        views[2].object_points[0][2] = 1e-12;
        assert!(validate_views(&views).is_ok());
        Ok(())
    }

    #[test]
    fn test_calibrate_falls_back_to_closed_form() -> Result<(), CalibrationError> {
        let intrinsics = CameraIntrinsics {
            fx: 800.0,
            fy: 790.0,
            cx: 320.0,
            cy: 240.0,
            skew: 0.0,
        };
        let distortion = Distortion {
            k1: -0.1,
            ..Default::default()
        };
        let scene = SyntheticScene::new(intrinsics, distortion, 5).with_noise(0.3, 7);
        let config = CalibrationConfig::default().with_refinement(Refinement::Joint);

        let result = calibrate_with(&scene.views, scene.image_size, &config, |_, _, _, _, _| {
            Err(OptimizerError::SolveFailed("singular normal equations".to_string()))
        })?;

        assert_eq!(result.rms, RMS_SENTINEL);
        assert!(result.is_fallback());
        assert!(!result.is_refined());
        match &result.refinement.outcome {
            RefinementOutcome::FellBack(reason) => assert!(reason.contains("singular")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(result.refinement.mode, Refinement::Joint);
        assert_eq!(result.refinement.iterations, 0);
        assert_eq!(result.distortion, Distortion::default());

        // the reported model is exactly the closed-form one
        let closed = calibrate(
            &scene.views,
            scene.image_size,
            &config.clone().with_refinement(Refinement::ClosedFormOnly),
        )?;
        assert_eq!(result.intrinsics, closed.intrinsics);
        assert_eq!(result.poses, closed.poses);

        let stats = reprojection_errors(
            &scene.views,
            &closed.intrinsics,
            &closed.poses,
            &Distortion::default(),
        );
        assert_eq!(result.per_view_errors, stats.per_view_errors);
        assert_eq!(result.refinement.initial_cost, stats.total_squared_error);
        assert_eq!(result.refinement.final_cost, stats.total_squared_error);
        assert!(stats.rms > 0.0);
        Ok(())
    }

    #[test]
    fn test_calibrate_translated_views_are_degenerate() -> Result<(), CalibrationError> {
        // pure image translations give fronto-parallel views with a shared orientation
        let views = vec![square_view(0.0)?, square_view(5.0)?, square_view(9.0)?];
        let size = ImageSize {
            width: 640,
            height: 480,
        };
        assert!(matches!(
            calibrate(&views, size, &CalibrationConfig::default()),
            Err(CalibrationError::InsufficientViews { .. })
        ));
        Ok(())
    }
}
