//! Fixed-size 3x3 helpers shared by the calibration stages.
//!
//! Small matrices are kept as row-major `[[f64; 3]; 3]` arrays; anything that
//! needs a decomposition is converted to a [`faer::Mat`].

/// The 3x3 identity matrix.
pub const IDENTITY_MAT33: [[f64; 3]; 3] = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

/// Angles below this are treated as zero by the Rodrigues conversions.
const SMALL_ANGLE_EPSILON: f64 = 1e-12;

/// Compute the dot product of two 3d vectors.
pub fn dot_product3(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Compute the euclidean norm of a 3d vector.
pub fn norm3(a: &[f64; 3]) -> f64 {
    dot_product3(a, a).sqrt()
}

/// Compute the cross product of two 3d vectors.
///
/// # Arguments
///
/// * `a` - The first vector.
/// * `b` - The second vector.
/// * `out` - The output vector `a x b`.
pub fn cross_vec3(a: &[f64; 3], b: &[f64; 3], out: &mut [f64; 3]) {
    out[0] = a[1] * b[2] - a[2] * b[1];
    out[1] = a[2] * b[0] - a[0] * b[2];
    out[2] = a[0] * b[1] - a[1] * b[0];
}

/// Multiply a 3x3 matrix by a 3d vector.
pub fn mat33_mul_vec3(m: &[[f64; 3]; 3], v: &[f64; 3], out: &mut [f64; 3]) {
    for (out_i, row) in out.iter_mut().zip(m.iter()) {
        *out_i = dot_product3(row, v);
    }
}

/// Multiply two 3x3 matrices.
pub fn mat33_mul(a: &[[f64; 3]; 3], b: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, val) in row.iter_mut().enumerate() {
            *val = a[i][0] * b[0][j] + a[i][1] * b[1][j] + a[i][2] * b[2][j];
        }
    }
    out
}

/// Transpose a 3x3 matrix.
pub fn transpose_mat33(m: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    [
        [m[0][0], m[1][0], m[2][0]],
        [m[0][1], m[1][1], m[2][1]],
        [m[0][2], m[1][2], m[2][2]],
    ]
}

/// Compute the determinant of a 3x3 matrix.
pub fn det_mat33(m: &[[f64; 3]; 3]) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}

/// Invert a 3x3 matrix using the adjugate.
///
/// Returns `None` if the determinant is too small to invert safely.
pub fn inverse_mat33(m: &[[f64; 3]; 3]) -> Option<[[f64; 3]; 3]> {
    let det = det_mat33(m);
    if !det.is_finite() || det.abs() < 1e-12 {
        return None;
    }
    let inv_det = 1.0 / det;
    Some([
        [
            (m[1][1] * m[2][2] - m[1][2] * m[2][1]) * inv_det,
            (m[0][2] * m[2][1] - m[0][1] * m[2][2]) * inv_det,
            (m[0][1] * m[1][2] - m[0][2] * m[1][1]) * inv_det,
        ],
        [
            (m[1][2] * m[2][0] - m[1][0] * m[2][2]) * inv_det,
            (m[0][0] * m[2][2] - m[0][2] * m[2][0]) * inv_det,
            (m[0][2] * m[1][0] - m[0][0] * m[1][2]) * inv_det,
        ],
        [
            (m[1][0] * m[2][1] - m[1][1] * m[2][0]) * inv_det,
            (m[0][1] * m[2][0] - m[0][0] * m[2][1]) * inv_det,
            (m[0][0] * m[1][1] - m[0][1] * m[1][0]) * inv_det,
        ],
    ])
}

/// Multiply every element of a 3x3 matrix by `scale`.
pub fn scale_mat33_inplace(m: &mut [[f64; 3]; 3], scale: f64) {
    m.iter_mut()
        .flat_map(|row| row.iter_mut())
        .for_each(|v| *v *= scale);
}

/// Copy a 3x3 array into an owned faer matrix.
pub fn mat33_to_faer(m: &[[f64; 3]; 3]) -> faer::Mat<f64> {
    faer::Mat::<f64>::from_fn(3, 3, |i, j| m[i][j])
}

/// Copy the top-left 3x3 block of a faer matrix into an array.
pub fn faer_to_mat33(m: faer::MatRef<'_, f64>) -> [[f64; 3]; 3] {
    let mut out = [[0.0; 3]; 3];
    for (i, row) in out.iter_mut().enumerate() {
        for (j, val) in row.iter_mut().enumerate() {
            *val = m.read(i, j);
        }
    }
    out
}

/// Project an arbitrary 3x3 matrix onto the closest rotation matrix.
///
/// Uses the polar decomposition `R = U * V^T` from the SVD of `m`. When the
/// product is a reflection the last column of `U` is flipped so that
/// `det(R) = +1`.
pub fn project_to_so3(m: &[[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let svd = mat33_to_faer(m).svd();
    let u = svd.u();
    let v = svd.v();

    let r = faer_to_mat33((u * v.transpose()).as_ref());
    if det_mat33(&r) >= 0.0 {
        return r;
    }

    let mut u_flipped = u.to_owned();
    for i in 0..3 {
        u_flipped.write(i, 2, -u_flipped.read(i, 2));
    }
    faer_to_mat33((u_flipped.as_ref() * v.transpose()).as_ref())
}

/// Convert an axis-angle (Rodrigues) vector into a rotation matrix.
pub fn rotation_from_rvec(rvec: &[f64; 3]) -> [[f64; 3]; 3] {
    let theta = norm3(rvec);
    if theta < SMALL_ANGLE_EPSILON {
        // first order expansion: I + hat(w)
        return [
            [1.0, -rvec[2], rvec[1]],
            [rvec[2], 1.0, -rvec[0]],
            [-rvec[1], rvec[0], 1.0],
        ];
    }

    let k = [rvec[0] / theta, rvec[1] / theta, rvec[2] / theta];
    let (s, c) = theta.sin_cos();
    let v = 1.0 - c;

    [
        [
            c + k[0] * k[0] * v,
            k[0] * k[1] * v - k[2] * s,
            k[0] * k[2] * v + k[1] * s,
        ],
        [
            k[1] * k[0] * v + k[2] * s,
            c + k[1] * k[1] * v,
            k[1] * k[2] * v - k[0] * s,
        ],
        [
            k[2] * k[0] * v - k[1] * s,
            k[2] * k[1] * v + k[0] * s,
            c + k[2] * k[2] * v,
        ],
    ]
}

/// Convert a rotation matrix into its axis-angle (Rodrigues) vector.
pub fn rvec_from_rotation(r: &[[f64; 3]; 3]) -> [f64; 3] {
    let trace = r[0][0] + r[1][1] + r[2][2];
    let cos_theta = ((trace - 1.0) * 0.5).clamp(-1.0, 1.0);
    let theta = cos_theta.acos();

    // vee of the skew-symmetric part
    let w = [
        0.5 * (r[2][1] - r[1][2]),
        0.5 * (r[0][2] - r[2][0]),
        0.5 * (r[1][0] - r[0][1]),
    ];

    if theta < SMALL_ANGLE_EPSILON {
        return w;
    }

    let sin_theta = theta.sin();
    if sin_theta > 1e-6 {
        let scale = theta / sin_theta;
        return [w[0] * scale, w[1] * scale, w[2] * scale];
    }

    // theta close to pi: recover the axis from the symmetric part R = 2kk^T - I
    let i = (0..3)
        .max_by(|&a, &b| r[a][a].total_cmp(&r[b][b]))
        .unwrap_or(0);
    let ki = ((r[i][i] + 1.0) * 0.5).max(0.0).sqrt();
    let mut k = [0.0; 3];
    for (j, kj) in k.iter_mut().enumerate() {
        *kj = if j == i {
            ki
        } else {
            (r[i][j] + r[j][i]) / (4.0 * ki)
        };
    }
    let norm = norm3(&k);
    [
        k[0] / norm * theta,
        k[1] / norm * theta,
        k[2] / norm * theta,
    ]
}
