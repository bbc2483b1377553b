use crate::error::CalibrationError;
use crate::linalg;
use crate::types::{CameraIntrinsics, Pose};

/// Decompose a plane homography into the pose of the plane in the camera frame.
///
/// With `K^-1 H = [a1 a2 a3]` and `lambda = 1 / |a1|`, the raw rotation columns are
/// `r1 = lambda a1`, `r2 = lambda a2`, `r3 = r1 x r2` and the translation is
/// `t = lambda a3`. The raw rotation is projected onto SO(3).
///
/// The sign of `lambda` is not determined by the homography. It is chosen so that
/// the plane lies in front of the camera (`t.z > 0`); when the first attempt puts
/// it behind, `r1`, `r2` and `t` are negated and the rotation is rebuilt.
///
/// # Arguments
///
/// * `homo` - The object plane (`Z = 0`) to image homography.
/// * `intrinsics` - The camera intrinsics.
///
/// # Errors
///
/// Returns [`CalibrationError::InvalidInput`] if `K` is singular or the homography
/// has a vanishing first column.
pub fn recover_pose(
    homo: &[[f64; 3]; 3],
    intrinsics: &CameraIntrinsics,
) -> Result<Pose, CalibrationError> {
    let k_inv = linalg::inverse_mat33(&intrinsics.k_matrix())
        .ok_or_else(|| CalibrationError::invalid("camera matrix is singular"))?;

    let column = |j: usize| {
        let h = [homo[0][j], homo[1][j], homo[2][j]];
        let mut out = [0.0; 3];
        linalg::mat33_mul_vec3(&k_inv, &h, &mut out);
        out
    };
    let (a1, a2, a3) = (column(0), column(1), column(2));

    let norm_a1 = linalg::norm3(&a1);
    if !norm_a1.is_finite() || norm_a1 < f64::MIN_POSITIVE {
        return Err(CalibrationError::invalid(
            "homography has a vanishing first column",
        ));
    }

    let lambda = 1.0 / norm_a1;
    let pose = build_pose(&a1, &a2, &a3, lambda);
    if pose.translation[2] >= 0.0 {
        return Ok(pose);
    }

    // plane behind the camera: take the other sign of the scale
    Ok(build_pose(&a1, &a2, &a3, -lambda))
}

fn build_pose(a1: &[f64; 3], a2: &[f64; 3], a3: &[f64; 3], lambda: f64) -> Pose {
    let r1 = a1.map(|v| v * lambda);
    let r2 = a2.map(|v| v * lambda);
    let mut r3 = [0.0; 3];
    linalg::cross_vec3(&r1, &r2, &mut r3);

    let raw = [
        [r1[0], r2[0], r3[0]],
        [r1[1], r2[1], r3[1]],
        [r1[2], r2[2], r3[2]],
    ];

    Pose {
        rotation: linalg::project_to_so3(&raw),
        translation: a3.map(|v| v * lambda),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn make_intrinsics() -> CameraIntrinsics {
        CameraIntrinsics {
            fx: 800.0,
            fy: 780.0,
            cx: 640.0,
            cy: 360.0,
            skew: 0.0,
        }
    }

    fn homography_from_pose(k: &[[f64; 3]; 3], pose: &Pose) -> [[f64; 3]; 3] {
        let r = pose.rotation;
        let t = pose.translation;
        let rt = [
            [r[0][0], r[0][1], t[0]],
            [r[1][0], r[1][1], t[1]],
            [r[2][0], r[2][1], t[2]],
        ];
        linalg::mat33_mul(k, &rt)
    }

    fn assert_pose_eq(a: &Pose, b: &Pose) {
        for i in 0..3 {
            assert_relative_eq!(a.translation[i], b.translation[i], epsilon = 1e-8);
            for j in 0..3 {
                assert_relative_eq!(a.rotation[i][j], b.rotation[i][j], epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn test_recover_pose_from_exact_homography() -> Result<(), CalibrationError> {
        let intr = make_intrinsics();
        let pose_gt = Pose::from_rvec(&[0.1, -0.05, 0.2], [0.1, -0.05, 1.0]);
        let homo = homography_from_pose(&intr.k_matrix(), &pose_gt);

        let pose = recover_pose(&homo, &intr)?;
        assert_pose_eq(&pose, &pose_gt);
        Ok(())
    }

    #[test]
    fn test_recover_pose_resolves_sign() -> Result<(), CalibrationError> {
        let intr = make_intrinsics();
        let pose_gt = Pose::from_rvec(&[-0.3, 0.2, 0.1], [-0.2, 0.1, 2.5]);
        let mut homo = homography_from_pose(&intr.k_matrix(), &pose_gt);
        linalg::scale_mat33_inplace(&mut homo, -0.01);

        let pose = recover_pose(&homo, &intr)?;
        assert!(pose.translation[2] > 0.0);
        assert_pose_eq(&pose, &pose_gt);
        Ok(())
    }

    #[test]
    fn test_recover_pose_is_rotation() -> Result<(), CalibrationError> {
        let intr = make_intrinsics();
        let pose_gt = Pose::from_rvec(&[0.4, 0.3, -0.2], [0.0, 0.2, 1.5]);
        let mut homo = homography_from_pose(&intr.k_matrix(), &pose_gt);
        homo[0][1] += 0.5;
        homo[2][0] -= 1e-4;

        let pose = recover_pose(&homo, &intr)?;
        let rtr = linalg::mat33_mul(&linalg::transpose_mat33(&pose.rotation), &pose.rotation);
        for i in 0..3 {
            for j in 0..3 {
                assert_relative_eq!(rtr[i][j], linalg::IDENTITY_MAT33[i][j], epsilon = 1e-10);
            }
        }
        assert_relative_eq!(linalg::det_mat33(&pose.rotation), 1.0, epsilon = 1e-10);
        Ok(())
    }

    #[test]
    fn test_recover_pose_singular_k() {
        let intr = CameraIntrinsics {
            fx: 0.0,
            ..make_intrinsics()
        };
        assert!(recover_pose(&linalg::IDENTITY_MAT33, &intr).is_err());
    }
}
