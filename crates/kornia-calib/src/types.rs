use serde::{Deserialize, Serialize};

use crate::error::CalibrationError;
use crate::linalg;

/// The pixel dimensions shared by every view.
///
/// Only used as a hint for the initial principal point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    /// The width of the image in pixels.
    pub width: usize,
    /// The height of the image in pixels.
    pub height: usize,
}

impl ImageSize {
    /// The geometric center of the frame.
    pub fn center(&self) -> [f64; 2] {
        [self.width as f64 / 2.0, self.height as f64 / 2.0]
    }

    /// Whether a pixel coordinate lies inside the frame.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= 0.0 && y >= 0.0 && x <= self.width as f64 && y <= self.height as f64
    }
}

/// The correspondences observed in one calibration image.
///
/// `image_points[i]` is the detection of the template point `object_points[i]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct View {
    /// Detected pixel coordinates.
    pub image_points: Vec<[f64; 2]>,
    /// Template points in object space, `z = 0` for planar targets.
    pub object_points: Vec<[f64; 3]>,
}

impl View {
    /// Create a view, checking that both sequences pair up.
    pub fn new(
        image_points: Vec<[f64; 2]>,
        object_points: Vec<[f64; 3]>,
    ) -> Result<Self, CalibrationError> {
        let view = Self {
            image_points,
            object_points,
        };
        view.validate()?;
        Ok(view)
    }

    /// Number of correspondences in the view.
    pub fn len(&self) -> usize {
        self.image_points.len()
    }

    /// Whether the view holds no correspondences.
    pub fn is_empty(&self) -> bool {
        self.image_points.is_empty()
    }

    /// The object points with the plane coordinate dropped.
    pub fn object_points_xy(&self) -> Vec<[f64; 2]> {
        self.object_points.iter().map(|p| [p[0], p[1]]).collect()
    }

    pub(crate) fn validate(&self) -> Result<(), CalibrationError> {
        if self.image_points.len() != self.object_points.len() {
            return Err(CalibrationError::invalid(format!(
                "mismatched correspondences: {} image points, {} object points",
                self.image_points.len(),
                self.object_points.len()
            )));
        }
        let finite = self.image_points.iter().flatten().all(|v| v.is_finite())
            && self.object_points.iter().flatten().all(|v| v.is_finite());
        if !finite {
            return Err(CalibrationError::invalid("view contains non-finite coordinates"));
        }
        Ok(())
    }
}

/// How the object-space template is supplied for a set of views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ObjectTemplate {
    /// One template reused identically by every view.
    Shared(Vec<[f64; 3]>),
    /// One template per view, in view order.
    PerView(Vec<Vec<[f64; 3]>>),
}

impl ObjectTemplate {
    /// Pair the template with per-view detections.
    ///
    /// # Errors
    ///
    /// Returns [`CalibrationError::InvalidInput`] if a per-view template does not
    /// match the number of views, or if any view's point counts differ.
    pub fn into_views(
        self,
        image_points: Vec<Vec<[f64; 2]>>,
    ) -> Result<Vec<View>, CalibrationError> {
        match self {
            ObjectTemplate::Shared(template) => image_points
                .into_iter()
                .map(|image| View::new(image, template.clone()))
                .collect(),
            ObjectTemplate::PerView(templates) => {
                if templates.len() != image_points.len() {
                    return Err(CalibrationError::invalid(format!(
                        "{} per-view templates supplied for {} views",
                        templates.len(),
                        image_points.len()
                    )));
                }
                image_points
                    .into_iter()
                    .zip(templates)
                    .map(|(image, object)| View::new(image, object))
                    .collect()
            }
        }
    }
}

/// The intrinsic parameters of a pinhole camera with skew.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraIntrinsics {
    /// The focal length in the x direction.
    pub fx: f64,
    /// The focal length in the y direction.
    pub fy: f64,
    /// The x coordinate of the principal point.
    pub cx: f64,
    /// The y coordinate of the principal point.
    pub cy: f64,
    /// The skew between the image axes.
    pub skew: f64,
}

impl CameraIntrinsics {
    /// The camera matrix `[[fx, skew, cx], [0, fy, cy], [0, 0, 1]]`.
    pub fn k_matrix(&self) -> [[f64; 3]; 3] {
        [
            [self.fx, self.skew, self.cx],
            [0.0, self.fy, self.cy],
            [0.0, 0.0, 1.0],
        ]
    }

    /// Build intrinsics from an upper-triangular camera matrix.
    pub fn from_k_matrix(k: &[[f64; 3]; 3]) -> Self {
        Self {
            fx: k[0][0],
            fy: k[1][1],
            cx: k[0][2],
            cy: k[1][2],
            skew: k[0][1],
        }
    }
}

/// The rigid transform taking object points into the camera frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// Rotation matrix, orthonormal with `det = +1`.
    pub rotation: [[f64; 3]; 3],
    /// Translation vector.
    pub translation: [f64; 3],
}

impl Pose {
    /// Build a pose from a Rodrigues vector and a translation.
    pub fn from_rvec(rvec: &[f64; 3], translation: [f64; 3]) -> Self {
        Self {
            rotation: linalg::rotation_from_rvec(rvec),
            translation,
        }
    }

    /// The Rodrigues (axis-angle) representation of the rotation.
    pub fn rvec(&self) -> [f64; 3] {
        linalg::rvec_from_rotation(&self.rotation)
    }

    /// Map an object point into the camera frame: `R * p + t`.
    pub fn transform_point(&self, point: &[f64; 3]) -> [f64; 3] {
        let mut out = [0.0; 3];
        linalg::mat33_mul_vec3(&self.rotation, point, &mut out);
        [
            out[0] + self.translation[0],
            out[1] + self.translation[1],
            out[2] + self.translation[2],
        ]
    }
}
