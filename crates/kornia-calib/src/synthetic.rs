//! Synthetic planar calibration scenes with a known ground truth.

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::linalg;
use crate::projection::{project_points, Distortion};
use crate::types::{CameraIntrinsics, ImageSize, Pose, View};

/// Generate a planar `rows x cols` grid of points on `Z = 0`, row-major.
pub fn grid_points(rows: usize, cols: usize, square_size: f64) -> Vec<[f64; 3]> {
    (0..rows)
        .flat_map(|r| {
            (0..cols).map(move |c| [c as f64 * square_size, r as f64 * square_size, 0.0])
        })
        .collect()
}

/// Poses looking at a target centered at `center`, tilted in evenly spread
/// directions so every view has a distinct orientation.
pub fn orbit_poses(num_views: usize, center: [f64; 3], tilt: f64, depth: f64) -> Vec<Pose> {
    (0..num_views)
        .map(|i| {
            let phase = 2.0 * std::f64::consts::PI * i as f64 / num_views.max(1) as f64;
            let roll = 0.1 * ((i % 3) as f64 - 1.0);
            let rvec = [tilt * phase.cos(), tilt * phase.sin(), roll];
            let rotation = linalg::rotation_from_rvec(&rvec);

            // place the target center on the optical axis
            let mut rc = [0.0; 3];
            linalg::mat33_mul_vec3(&rotation, &center, &mut rc);
            let z = depth * (1.0 + 0.1 * (i % 3) as f64);

            Pose {
                rotation,
                translation: [-rc[0], -rc[1], z - rc[2]],
            }
        })
        .collect()
}

/// A camera observing a checkerboard-like grid from several poses.
#[derive(Debug, Clone)]
pub struct SyntheticScene {
    /// Ground truth intrinsics.
    pub intrinsics: CameraIntrinsics,
    /// Ground truth distortion.
    pub distortion: Distortion,
    /// Ground truth pose of each view.
    pub poses: Vec<Pose>,
    /// The template shared by every view.
    pub object_points: Vec<[f64; 3]>,
    /// The projected correspondences, one entry per pose.
    pub views: Vec<View>,
    /// Frame size centered on the principal point.
    pub image_size: ImageSize,
}

impl SyntheticScene {
    /// Rows of the default grid.
    pub const GRID_ROWS: usize = 6;
    /// Columns of the default grid.
    pub const GRID_COLS: usize = 9;
    /// Spacing of the default grid in object units.
    pub const SQUARE_SIZE: f64 = 0.025;

    /// Render a 9x6 grid seen from `num_views` distinct orientations.
    pub fn new(intrinsics: CameraIntrinsics, distortion: Distortion, num_views: usize) -> Self {
        let object_points = grid_points(Self::GRID_ROWS, Self::GRID_COLS, Self::SQUARE_SIZE);
        let center = [
            (Self::GRID_COLS - 1) as f64 * Self::SQUARE_SIZE / 2.0,
            (Self::GRID_ROWS - 1) as f64 * Self::SQUARE_SIZE / 2.0,
            0.0,
        ];
        let poses = orbit_poses(num_views, center, 0.35, 0.5);
        Self::from_poses(intrinsics, distortion, object_points, poses)
    }

    /// Render an arbitrary template from the given poses.
    pub fn from_poses(
        intrinsics: CameraIntrinsics,
        distortion: Distortion,
        object_points: Vec<[f64; 3]>,
        poses: Vec<Pose>,
    ) -> Self {
        let views = poses
            .iter()
            .map(|pose| View {
                image_points: project_points(&object_points, &intrinsics, pose, &distortion),
                object_points: object_points.clone(),
            })
            .collect();

        let image_size = ImageSize {
            width: (2.0 * intrinsics.cx).round().max(1.0) as usize,
            height: (2.0 * intrinsics.cy).round().max(1.0) as usize,
        };

        Self {
            intrinsics,
            distortion,
            poses,
            object_points,
            views,
            image_size,
        }
    }

    /// Perturb every image point with uniform noise in `[-noise_px, noise_px]`.
    pub fn with_noise(mut self, noise_px: f64, seed: u64) -> Self {
        if noise_px <= 0.0 {
            return self;
        }
        let mut rng = StdRng::seed_from_u64(seed);
        for view in &mut self.views {
            for p in &mut view.image_points {
                p[0] += rng.random_range(-noise_px..noise_px);
                p[1] += rng.random_range(-noise_px..noise_px);
            }
        }
        self
    }
}
