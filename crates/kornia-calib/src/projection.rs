//! Pinhole projection with Brown-Conrady distortion and reprojection error metrics.

use serde::{Deserialize, Serialize};

use crate::types::{CameraIntrinsics, Pose, View};

/// Depths below this magnitude are treated as lying on the camera plane.
pub const MIN_DEPTH: f64 = 1e-10;

/// Which distortion terms are estimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DistortionModel {
    /// Radial terms `k1, k2`.
    #[default]
    Radial2,
    /// Radial terms `k1, k2, k3`.
    Radial3,
    /// Radial terms `k1, k2, k3` and tangential terms `p1, p2`.
    RadialTangential,
}

impl DistortionModel {
    /// Number of free coefficients of the model.
    pub fn num_params(&self) -> usize {
        match self {
            DistortionModel::Radial2 => 2,
            DistortionModel::Radial3 => 3,
            DistortionModel::RadialTangential => 5,
        }
    }
}

/// Brown-Conrady lens distortion coefficients.
///
/// Terms outside the active [`DistortionModel`] stay at zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Distortion {
    /// The first radial distortion coefficient
    pub k1: f64,
    /// The second radial distortion coefficient
    pub k2: f64,
    /// The first tangential distortion coefficient
    pub p1: f64,
    /// The second tangential distortion coefficient
    pub p2: f64,
    /// The third radial distortion coefficient
    pub k3: f64,
}

impl Distortion {
    /// Coefficients in the conventional order `[k1, k2, p1, p2, k3]`.
    pub fn coefficients(&self) -> [f64; 5] {
        [self.k1, self.k2, self.p1, self.p2, self.k3]
    }

    /// Build from a `[k1, k2, p1, p2, k3, ...]` list; missing terms default to zero.
    pub fn from_coefficients(coeffs: &[f64]) -> Self {
        let get = |i: usize| coeffs.get(i).copied().unwrap_or(0.0);
        Self {
            k1: get(0),
            k2: get(1),
            p1: get(2),
            p2: get(3),
            k3: get(4),
        }
    }

    /// The free parameters of `model`, in optimizer order.
    pub fn to_params(&self, model: DistortionModel) -> Vec<f64> {
        match model {
            DistortionModel::Radial2 => vec![self.k1, self.k2],
            DistortionModel::Radial3 => vec![self.k1, self.k2, self.k3],
            DistortionModel::RadialTangential => vec![self.k1, self.k2, self.p1, self.p2, self.k3],
        }
    }

    /// Inverse of [`Distortion::to_params`].
    pub fn from_params(model: DistortionModel, params: &[f64]) -> Self {
        let get = |i: usize| params.get(i).copied().unwrap_or(0.0);
        match model {
            DistortionModel::Radial2 => Self {
                k1: get(0),
                k2: get(1),
                ..Default::default()
            },
            DistortionModel::Radial3 => Self {
                k1: get(0),
                k2: get(1),
                k3: get(2),
                ..Default::default()
            },
            DistortionModel::RadialTangential => Self {
                k1: get(0),
                k2: get(1),
                p1: get(2),
                p2: get(3),
                k3: get(4),
            },
        }
    }

    /// Distort a point on the normalized image plane.
    pub fn distort(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let radial = 1.0 + r2 * (self.k1 + r2 * (self.k2 + r2 * self.k3));
        let xd = x * radial + 2.0 * self.p1 * x * y + self.p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + self.p1 * (r2 + 2.0 * y * y) + 2.0 * self.p2 * x * y;
        (xd, yd)
    }
}

/// Project a 3d object point to pixel coordinates.
///
/// The point is moved into the camera frame with `pose`, divided by its depth,
/// distorted and mapped through `K`. Points on the camera plane
/// (`|z| < MIN_DEPTH`) project to the sentinel `[0.0, 0.0]`.
///
/// # Arguments
///
/// * `point` - The object point.
/// * `intrinsics` - The camera intrinsics.
/// * `pose` - The object to camera transform.
/// * `distortion` - The lens distortion.
pub fn project_point(
    point: &[f64; 3],
    intrinsics: &CameraIntrinsics,
    pose: &Pose,
    distortion: &Distortion,
) -> [f64; 2] {
    let pc = pose.transform_point(point);
    if pc[2].abs() < MIN_DEPTH {
        return [0.0, 0.0];
    }

    let inv_z = 1.0 / pc[2];
    let (xd, yd) = distortion.distort(pc[0] * inv_z, pc[1] * inv_z);

    [
        intrinsics.fx * xd + intrinsics.skew * yd + intrinsics.cx,
        intrinsics.fy * yd + intrinsics.cy,
    ]
}

/// Project every object point of a view.
pub fn project_points(
    points: &[[f64; 3]],
    intrinsics: &CameraIntrinsics,
    pose: &Pose,
    distortion: &Distortion,
) -> Vec<[f64; 2]> {
    points
        .iter()
        .map(|p| project_point(p, intrinsics, pose, distortion))
        .collect()
}

/// Sum of squared pixel distances between the observations of a view and
/// the projection of its template.
pub fn view_squared_error(
    view: &View,
    intrinsics: &CameraIntrinsics,
    pose: &Pose,
    distortion: &Distortion,
) -> f64 {
    view.object_points
        .iter()
        .zip(view.image_points.iter())
        .map(|(pw, pi)| {
            let [u, v] = project_point(pw, intrinsics, pose, distortion);
            let (du, dv) = (u - pi[0], v - pi[1]);
            du.mul_add(du, dv * dv)
        })
        .sum()
}

/// Reprojection error summary of a camera model over a set of views.
#[derive(Debug, Clone, PartialEq)]
pub struct ReprojectionStats {
    /// Root-mean-square pixel distance over every point of every view.
    pub rms: f64,
    /// Root-mean-square pixel distance of each view.
    pub per_view_errors: Vec<f64>,
    /// Sum of squared residuals, i.e. the least squares cost.
    pub total_squared_error: f64,
}

/// Compute the reprojection error of a camera model.
///
/// Each view's error is `sqrt(sum |proj - obs|^2 / N_view)`; the overall `rms`
/// aggregates every point of every view the same way.
pub fn reprojection_errors(
    views: &[View],
    intrinsics: &CameraIntrinsics,
    poses: &[Pose],
    distortion: &Distortion,
) -> ReprojectionStats {
    let mut total = 0.0;
    let mut num_points = 0usize;
    let per_view_errors = views
        .iter()
        .zip(poses.iter())
        .map(|(view, pose)| {
            let sq = view_squared_error(view, intrinsics, pose, distortion);
            total += sq;
            num_points += view.len();
            if view.is_empty() {
                0.0
            } else {
                (sq / view.len() as f64).sqrt()
            }
        })
        .collect();

    let rms = if num_points == 0 {
        0.0
    } else {
        (total / num_points as f64).sqrt()
    };

    ReprojectionStats {
        rms,
        per_view_errors,
        total_squared_error: total,
    }
}
