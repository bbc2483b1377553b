use crate::error::CalibrationError;
use crate::linalg;
use crate::normalize::normalize_points_2d;

/// Minimum number of correspondences needed to fit a homography.
pub const MIN_HOMOGRAPHY_POINTS: usize = 4;

/// Rescale a homography so that its bottom-right element is 1.
///
/// The result does not depend on the scale of the input: `s * H` and `H`
/// normalize to the same matrix for any nonzero `s`.
///
/// # Errors
///
/// Returns [`CalibrationError::InvalidInput`] if `H[2][2]` is zero or not finite.
pub fn normalize_homography(homo: &[[f64; 3]; 3]) -> Result<[[f64; 3]; 3], CalibrationError> {
    let h22 = homo[2][2];
    if !h22.is_finite() || h22.abs() < 1e-15 {
        return Err(CalibrationError::invalid(
            "homography has a vanishing (2, 2) element",
        ));
    }
    let mut out = *homo;
    linalg::scale_mat33_inplace(&mut out, 1.0 / h22);
    Ok(out)
}

/// Estimate the homography mapping object plane points to image points.
///
/// Implements the normalized Direct Linear Transformation: both point sets are
/// conditioned with [`normalize_points_2d`], each correspondence contributes two
/// rows of the `2N x 9` system `x' x (H x) = 0`, and the right singular vector
/// of the smallest singular value is taken as the flattened homography. The
/// result is denormalized with `H = T_image^-1 * H_n * T_object` and rescaled
/// so that `H[2][2] = 1`.
///
/// # Arguments
///
/// * `object` - The object plane points `(X, Y)` with shape (N, 2).
/// * `image` - The corresponding pixel coordinates with shape (N, 2).
///
/// # Errors
///
/// Returns [`CalibrationError::InvalidInput`] for mismatched lengths, fewer than
/// four correspondences, or a degenerate point set.
pub fn find_homography_dlt(
    object: &[[f64; 2]],
    image: &[[f64; 2]],
) -> Result<[[f64; 3]; 3], CalibrationError> {
    if object.len() != image.len() {
        return Err(CalibrationError::invalid(format!(
            "mismatched correspondences: {} object points, {} image points",
            object.len(),
            image.len()
        )));
    }
    if object.len() < MIN_HOMOGRAPHY_POINTS {
        return Err(CalibrationError::invalid(format!(
            "a homography needs at least {MIN_HOMOGRAPHY_POINTS} correspondences, got {}",
            object.len()
        )));
    }

    let src = normalize_points_2d(object)?;
    let dst = normalize_points_2d(image)?;

    // construct matrix A
    let n = object.len();
    let mut mat_a = faer::Mat::<f64>::zeros(2 * n, 9);
    for (i, (x1_i, x2_i)) in src.points.iter().zip(dst.points.iter()).enumerate() {
        mat_a.write(2 * i, 0, x1_i[0]);
        mat_a.write(2 * i, 1, x1_i[1]);
        mat_a.write(2 * i, 2, 1.0);
        mat_a.write(2 * i, 6, -x2_i[0] * x1_i[0]);
        mat_a.write(2 * i, 7, -x2_i[0] * x1_i[1]);
        mat_a.write(2 * i, 8, -x2_i[0]);

        mat_a.write(2 * i + 1, 3, x1_i[0]);
        mat_a.write(2 * i + 1, 4, x1_i[1]);
        mat_a.write(2 * i + 1, 5, 1.0);
        mat_a.write(2 * i + 1, 6, -x2_i[1] * x1_i[0]);
        mat_a.write(2 * i + 1, 7, -x2_i[1] * x1_i[1]);
        mat_a.write(2 * i + 1, 8, -x2_i[1]);
    }

    // null vector: the right singular vector of the smallest singular value
    let svd = mat_a.svd();
    let h = svd.v().col(8);
    let homo_n = [
        [h.read(0), h.read(1), h.read(2)],
        [h.read(3), h.read(4), h.read(5)],
        [h.read(6), h.read(7), h.read(8)],
    ];

    let t_image_inv = linalg::inverse_mat33(&dst.transform)
        .ok_or_else(|| CalibrationError::invalid("image normalization is not invertible"))?;
    let homo = linalg::mat33_mul(
        &linalg::mat33_mul(&t_image_inv, &homo_n),
        &src.transform,
    );

    normalize_homography(&homo)
}

/// Map a 2d point through a homography, returning its inhomogeneous coordinates.
pub fn apply_homography(homo: &[[f64; 3]; 3], point: &[f64; 2]) -> [f64; 2] {
    let mut out = [0.0; 3];
    linalg::mat33_mul_vec3(homo, &[point[0], point[1], 1.0], &mut out);
    [out[0] / out[2], out[1] / out[2]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn grid(nx: usize, ny: usize, spacing: f64) -> Vec<[f64; 2]> {
        let mut pts = Vec::with_capacity(nx * ny);
        for j in 0..ny {
            for i in 0..nx {
                pts.push([i as f64 * spacing, j as f64 * spacing]);
            }
        }
        pts
    }

    #[test]
    fn test_find_homography_dlt_identity() -> Result<(), CalibrationError> {
        let x1 = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        let homo = find_homography_dlt(&x1, &x1)?;
        for i in 0..3 {
            for j in 0..3 {
                assert_relative_eq!(homo[i][j], linalg::IDENTITY_MAT33[i][j], epsilon = 1e-9);
            }
        }
        Ok(())
    }

    #[test]
    fn test_find_homography_dlt_perspective() -> Result<(), CalibrationError> {
        let expected = [
            [820.0, 35.0, 310.0],
            [-12.0, 790.0, 255.0],
            [0.0004, -0.0002, 1.0],
        ];
        let object = grid(7, 5, 25.0);
        let image: Vec<[f64; 2]> = object
            .iter()
            .map(|p| apply_homography(&expected, p))
            .collect();

        let homo = find_homography_dlt(&object, &image)?;
        for i in 0..3 {
            for j in 0..3 {
                assert_relative_eq!(
                    homo[i][j],
                    expected[i][j],
                    epsilon = 1e-8,
                    max_relative = 1e-6
                );
            }
        }
        Ok(())
    }

    #[test]
    fn test_normalize_homography_scale_invariant() -> Result<(), CalibrationError> {
        let homo = [[2.0, 0.1, 30.0], [-0.3, 1.8, 12.0], [0.001, 0.002, 0.5]];
        let reference = normalize_homography(&homo)?;
        assert_relative_eq!(reference[2][2], 1.0);

        for scale in [-3.0, 1e-6, 0.25, 7.0, 1e5] {
            let mut scaled = homo;
            linalg::scale_mat33_inplace(&mut scaled, scale);
            let normalized = normalize_homography(&scaled)?;
            for i in 0..3 {
                for j in 0..3 {
                    assert_relative_eq!(
                        normalized[i][j],
                        reference[i][j],
                        max_relative = 1e-12
                    );
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_normalize_homography_vanishing_element() {
        let homo = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 0.0]];
        assert!(normalize_homography(&homo).is_err());
    }

    #[test]
    fn test_find_homography_dlt_too_few_points() {
        let pts = [[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]];
        assert!(matches!(
            find_homography_dlt(&pts, &pts),
            Err(CalibrationError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_find_homography_dlt_mismatched() {
        let object = grid(3, 3, 1.0);
        let image = grid(4, 2, 1.0);
        assert!(matches!(
            find_homography_dlt(&object, &image[..5]),
            Err(CalibrationError::InvalidInput(_))
        ));
    }
}
