//! Closed-form intrinsics from plane homographies (Zhang's method).
//!
//! Every homography `H = [h1 h2 h3]` of a plane seen by the camera constrains
//! the image of the absolute conic `B = K^-T K^-1` through
//!
//! - `h1^T B h2 = 0`
//! - `h1^T B h1 = h2^T B h2`
//!
//! Stacking both rows for every view gives a homogeneous `2V x 6` system in the
//! six independent entries of `B`, solved via SVD.

use log::debug;

use crate::error::CalibrationError;
use crate::types::{CameraIntrinsics, ImageSize};

/// Minimum number of views with distinct orientations.
pub const MIN_VIEWS: usize = 3;

/// Singular values of the equilibrated conic system below this fraction of the
/// largest one are treated as zero.
///
/// With three or more distinct orientations the fifth singular value stays
/// around `0.1 * s_max` or above. Views sharing orientations only lift it to
/// the pixel noise level, a few `1e-3` at most.
const CONDITION_TOLERANCE: f64 = 1e-2;

/// Largest accepted `|skew| / max(fx, fy)`.
const MAX_SKEW_RATIO: f64 = 0.25;

/// Largest accepted `max(fx, fy) / min(fx, fy)`.
const MAX_ASPECT_RATIO: f64 = 4.0;

/// The 6-vector `v_ij` such that `h_i^T B h_j = v_ij^T b`, with
/// `b = [B11, B12, B22, B13, B23, B33]`.
fn v_ij(homo: &[[f64; 3]; 3], i: usize, j: usize) -> [f64; 6] {
    let hi = [homo[0][i], homo[1][i], homo[2][i]];
    let hj = [homo[0][j], homo[1][j], homo[2][j]];
    [
        hi[0] * hj[0],
        hi[0] * hj[1] + hi[1] * hj[0],
        hi[1] * hj[1],
        hi[2] * hj[0] + hi[0] * hj[2],
        hi[2] * hj[1] + hi[1] * hj[2],
        hi[2] * hj[2],
    ]
}

/// Estimate the shared camera intrinsics from per-view homographies.
///
/// # Arguments
///
/// * `homographies` - One object-plane to image homography per view.
///
/// # Errors
///
/// Returns [`CalibrationError::InsufficientViews`] if fewer than three views are
/// given, if the views do not span enough distinct orientations, or if the
/// recovered conic does not yield finite positive focal lengths with a
/// plausible skew and aspect ratio.
pub fn solve_intrinsics(
    homographies: &[[[f64; 3]; 3]],
) -> Result<CameraIntrinsics, CalibrationError> {
    let num_views = homographies.len();
    if num_views < MIN_VIEWS {
        return Err(CalibrationError::InsufficientViews {
            required: MIN_VIEWS,
            actual: num_views,
        });
    }

    let mut mat_v = faer::Mat::<f64>::zeros(2 * num_views, 6);
    for (k, homo) in homographies.iter().enumerate() {
        let v12 = v_ij(homo, 0, 1);
        let v11 = v_ij(homo, 0, 0);
        let v22 = v_ij(homo, 1, 1);
        for c in 0..6 {
            mat_v.write(2 * k, c, v12[c]);
            mat_v.write(2 * k + 1, c, v11[c] - v22[c]);
        }
    }

    // equilibrate the columns: the entries of b live on very different scales
    let mut col_scale = [1.0; 6];
    for (c, scale) in col_scale.iter_mut().enumerate() {
        let max_abs = (0..mat_v.nrows())
            .map(|r| mat_v.read(r, c).abs())
            .fold(0.0, f64::max);
        if max_abs > 0.0 {
            *scale = 1.0 / max_abs;
            for r in 0..mat_v.nrows() {
                mat_v.write(r, c, mat_v.read(r, c) * *scale);
            }
        }
    }

    let svd = mat_v.svd();
    let s = svd.s_diagonal();
    let s_max = s.read(0);
    let num_singular = s.nrows().min(6);
    let rank = (0..num_singular)
        .filter(|&i| s.read(i) > CONDITION_TOLERANCE * s_max)
        .count();
    debug!(
        "conic system: {} views, numerical rank {}, s4/s0 {:.3e}",
        num_views,
        rank,
        s.read(4) / s_max
    );

    // three distinct orientations leave exactly one null direction
    if rank < 5 {
        return Err(CalibrationError::InsufficientViews {
            required: MIN_VIEWS,
            actual: rank.div_ceil(2),
        });
    }

    let null = svd.v().col(5);
    let b: Vec<f64> = (0..6).map(|c| null.read(c) * col_scale[c]).collect();
    let (b11, b12, b22, b13, b23, b33) = (b[0], b[1], b[2], b[3], b[4], b[5]);

    let degenerate = || CalibrationError::InsufficientViews {
        required: MIN_VIEWS,
        actual: rank.div_ceil(2),
    };

    let denom = b11 * b22 - b12 * b12;
    if b11.abs() < f64::MIN_POSITIVE || denom.abs() < f64::MIN_POSITIVE {
        return Err(degenerate());
    }

    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    if lambda.abs() < f64::MIN_POSITIVE {
        return Err(degenerate());
    }

    // absolute values absorb sign flips of the null vector and numerical noise
    let fx = (lambda / b11).abs().sqrt();
    let fy = (lambda * b11 / denom).abs().sqrt();
    let skew = -b12 * fx * fx * fy / lambda;
    let cx = skew * v0 / fy - b13 * fx * fx / lambda;

    let intrinsics = CameraIntrinsics {
        fx,
        fy,
        cx,
        cy: v0,
        skew,
    };

    let valid = [fx, fy, cx, v0, skew].iter().all(|v| v.is_finite()) && fx > 0.0 && fy > 0.0;
    if !valid {
        return Err(degenerate());
    }

    if !is_plausible(&intrinsics) {
        debug!("rejecting implausible closed-form intrinsics: {:?}", intrinsics);
        return Err(degenerate());
    }

    debug!("closed-form intrinsics: {:?}", intrinsics);
    Ok(intrinsics)
}

// near-degenerate conics that pass the conditioning test still show up as
// extreme skew or aspect ratio
fn is_plausible(intrinsics: &CameraIntrinsics) -> bool {
    let f_min = intrinsics.fx.min(intrinsics.fy);
    let f_max = intrinsics.fx.max(intrinsics.fy);
    f_max <= MAX_ASPECT_RATIO * f_min && intrinsics.skew.abs() <= MAX_SKEW_RATIO * f_max
}

/// Replace an implausible principal point by the image center.
///
/// The closed-form principal point is kept whenever it lies inside the frame.
pub fn apply_principal_point_hint(
    intrinsics: CameraIntrinsics,
    image_size: &ImageSize,
) -> CameraIntrinsics {
    if image_size.width == 0 || image_size.height == 0 {
        return intrinsics;
    }
    if image_size.contains(intrinsics.cx, intrinsics.cy) {
        return intrinsics;
    }
    let [cx, cy] = image_size.center();
    log::warn!(
        "closed-form principal point ({:.1}, {:.1}) is outside the {}x{} frame, \
         using the image center",
        intrinsics.cx,
        intrinsics.cy,
        image_size.width,
        image_size.height
    );
    CameraIntrinsics {
        cx,
        cy,
        ..intrinsics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg;
    use approx::assert_relative_eq;

    fn make_intrinsics() -> CameraIntrinsics {
        CameraIntrinsics {
            fx: 900.0,
            fy: 880.0,
            cx: 640.0,
            cy: 360.0,
            skew: 0.0,
        }
    }

    // For a Z=0 plane, H = K [r1 r2 t]
    fn synthetic_homography(k: &[[f64; 3]; 3], rvec: [f64; 3], t: [f64; 3]) -> [[f64; 3]; 3] {
        let r = linalg::rotation_from_rvec(&rvec);
        let rt = [
            [r[0][0], r[0][1], t[0]],
            [r[1][0], r[1][1], t[1]],
            [r[2][0], r[2][1], t[2]],
        ];
        linalg::mat33_mul(k, &rt)
    }

    #[test]
    fn test_solve_intrinsics_recovers_k() -> Result<(), CalibrationError> {
        let intr = make_intrinsics();
        let k = intr.k_matrix();
        let homographies = [
            synthetic_homography(&k, [0.1, 0.0, 0.05], [0.1, -0.05, 1.0]),
            synthetic_homography(&k, [-0.05, 0.15, -0.1], [-0.05, 0.1, 1.2]),
            synthetic_homography(&k, [0.2, -0.1, 0.0], [0.0, 0.0, 0.9]),
            synthetic_homography(&k, [-0.25, -0.2, 0.3], [0.1, 0.05, 1.1]),
        ];

        let est = solve_intrinsics(&homographies)?;
        assert_relative_eq!(est.fx, intr.fx, max_relative = 1e-6);
        assert_relative_eq!(est.fy, intr.fy, max_relative = 1e-6);
        assert_relative_eq!(est.cx, intr.cx, max_relative = 1e-6);
        assert_relative_eq!(est.cy, intr.cy, max_relative = 1e-6);
        assert_relative_eq!(est.skew, 0.0, epsilon = 1e-4);
        Ok(())
    }

    #[test]
    fn test_solve_intrinsics_scale_of_homographies() -> Result<(), CalibrationError> {
        let k = make_intrinsics().k_matrix();
        let mut homographies = [
            synthetic_homography(&k, [0.1, 0.0, 0.05], [0.1, -0.05, 1.0]),
            synthetic_homography(&k, [-0.05, 0.15, -0.1], [-0.05, 0.1, 1.2]),
            synthetic_homography(&k, [0.2, -0.1, 0.0], [0.0, 0.0, 0.9]),
        ];
        let reference = solve_intrinsics(&homographies)?;
        linalg::scale_mat33_inplace(&mut homographies[1], -4.0);
        let scaled = solve_intrinsics(&homographies)?;
        assert_relative_eq!(scaled.fx, reference.fx, max_relative = 1e-8);
        assert_relative_eq!(scaled.cy, reference.cy, max_relative = 1e-8);
        Ok(())
    }

    #[test]
    fn test_solve_intrinsics_two_views() {
        let k = make_intrinsics().k_matrix();
        let homographies = [
            synthetic_homography(&k, [0.1, 0.0, 0.05], [0.1, -0.05, 1.0]),
            synthetic_homography(&k, [-0.05, 0.15, -0.1], [-0.05, 0.1, 1.2]),
        ];
        assert_eq!(
            solve_intrinsics(&homographies),
            Err(CalibrationError::InsufficientViews {
                required: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn test_solve_intrinsics_parallel_views() {
        let k = make_intrinsics().k_matrix();
        let rvec = [0.1, -0.2, 0.05];
        let homographies = [
            synthetic_homography(&k, rvec, [0.1, -0.05, 1.0]),
            synthetic_homography(&k, rvec, [-0.05, 0.1, 1.2]),
            synthetic_homography(&k, rvec, [0.0, 0.0, 0.9]),
        ];
        assert!(matches!(
            solve_intrinsics(&homographies),
            Err(CalibrationError::InsufficientViews { .. })
        ));
    }

    // deterministic relative jitter of about 1e-4 per entry, a few tenths of a pixel
    fn jitter(mut homo: [[f64; 3]; 3], seed: usize) -> [[f64; 3]; 3] {
        for (i, row) in homo.iter_mut().enumerate() {
            for (j, h) in row.iter_mut().enumerate() {
                *h *= 1.0 + 1e-4 * ((seed * 9 + i * 3 + j) as f64 * 1.7).sin();
            }
        }
        homo
    }

    #[test]
    fn test_solve_intrinsics_noisy_parallel_views() {
        let k = make_intrinsics().k_matrix();
        let rvec = [0.2, -0.15, 0.05];
        let homographies = [
            jitter(synthetic_homography(&k, rvec, [-0.1, -0.05, 0.5]), 0),
            jitter(synthetic_homography(&k, rvec, [0.0, 0.05, 0.6]), 1),
            jitter(synthetic_homography(&k, rvec, [0.1, 0.0, 0.55]), 2),
        ];
        assert!(matches!(
            solve_intrinsics(&homographies),
            Err(CalibrationError::InsufficientViews { required: 3, .. })
        ));
    }

    #[test]
    fn test_solve_intrinsics_two_orientations() {
        let k = make_intrinsics().k_matrix();
        let homographies = [
            jitter(synthetic_homography(&k, [0.1, 0.0, 0.05], [0.1, -0.05, 1.0]), 0),
            jitter(synthetic_homography(&k, [-0.05, 0.15, -0.1], [-0.05, 0.1, 1.2]), 1),
            jitter(synthetic_homography(&k, [0.1, 0.0, 0.05], [0.0, 0.0, 0.9]), 2),
        ];
        assert!(matches!(
            solve_intrinsics(&homographies),
            Err(CalibrationError::InsufficientViews { required: 3, .. })
        ));
    }

    #[test]
    fn test_is_plausible() {
        let intr = make_intrinsics();
        assert!(is_plausible(&intr));
        assert!(is_plausible(&CameraIntrinsics { skew: 2.0, ..intr }));
        assert!(!is_plausible(&CameraIntrinsics {
            skew: -2454.5,
            ..intr
        }));
        assert!(!is_plausible(&CameraIntrinsics { fy: 150.0, ..intr }));
    }

    #[test]
    fn test_apply_principal_point_hint() {
        let size = ImageSize {
            width: 1280,
            height: 720,
        };
        let inside = make_intrinsics();
        assert_eq!(apply_principal_point_hint(inside, &size), inside);

        let outside = CameraIntrinsics {
            cx: -500.0,
            ..inside
        };
        let fixed = apply_principal_point_hint(outside, &size);
        assert_eq!((fixed.cx, fixed.cy), (640.0, 360.0));
        assert_eq!(fixed.fx, inside.fx);
    }
}
