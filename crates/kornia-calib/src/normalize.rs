use crate::error::CalibrationError;

/// A conditioned point set and the similarity transform that produced it.
#[derive(Debug, Clone)]
pub struct NormalizedPoints {
    /// The transformed points, centered at the origin with mean norm sqrt(2).
    pub points: Vec<[f64; 2]>,
    /// The similarity transform `T = [[s, 0, -s*mx], [0, s, -s*my], [0, 0, 1]]`.
    pub transform: [[f64; 3]; 3],
}

/// Normalize a set of 2d points for the DLT.
///
/// The points are translated so that their centroid is at the origin and
/// scaled isotropically so that their mean distance to the origin is `sqrt(2)`.
///
/// # Arguments
///
/// * `points` - The points to normalize.
///
/// # Errors
///
/// Returns [`CalibrationError::InvalidInput`] if the set is empty, contains
/// non-finite values or all points coincide.
pub fn normalize_points_2d(points: &[[f64; 2]]) -> Result<NormalizedPoints, CalibrationError> {
    if points.is_empty() {
        return Err(CalibrationError::invalid("cannot normalize an empty point set"));
    }
    if points.iter().flatten().any(|v| !v.is_finite()) {
        return Err(CalibrationError::invalid("point set contains non-finite values"));
    }

    let n = points.len() as f64;
    let (mut mx, mut my) = (0.0, 0.0);
    for p in points {
        mx += p[0];
        my += p[1];
    }
    mx /= n;
    my /= n;

    let mean_dist = points
        .iter()
        .map(|p| ((p[0] - mx).powi(2) + (p[1] - my).powi(2)).sqrt())
        .sum::<f64>()
        / n;

    if mean_dist <= f64::EPSILON * (1.0 + mx.abs().max(my.abs())) {
        return Err(CalibrationError::invalid(
            "all points coincide, normalization is undefined",
        ));
    }

    let scale = std::f64::consts::SQRT_2 / mean_dist;
    let normalized = points
        .iter()
        .map(|p| [(p[0] - mx) * scale, (p[1] - my) * scale])
        .collect();

    Ok(NormalizedPoints {
        points: normalized,
        transform: [
            [scale, 0.0, -scale * mx],
            [0.0, scale, -scale * my],
            [0.0, 0.0, 1.0],
        ],
    })
}
