#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]

/// The calibration engine entry point and its configuration.
pub mod calibrate;

/// Error types of the calibration engine.
pub mod error;

/// Pose recovery from plane homographies.
pub mod extrinsics;

/// Homography estimation with the normalized DLT.
pub mod homography;

/// Closed-form intrinsics from homographies.
pub mod intrinsics;

/// Dataset loading from the plain text correspondence format.
pub mod io;

/// Linear algebra utilities.
pub mod linalg;

/// Isotropic point normalization.
pub mod normalize;

/// Non-linear least squares optimization.
pub mod optim;

/// Camera projection and reprojection error.
pub mod projection;

/// Levenberg-Marquardt refinement of the camera model.
pub mod refine;

/// Synthetic calibration scenes.
pub mod synthetic;

/// Input and output data model.
pub mod types;

pub use calibrate::{calibrate, CalibrationConfig, CalibrationResult, RMS_SENTINEL};
pub use error::CalibrationError;
pub use projection::{Distortion, DistortionModel};
pub use refine::{Refinement, RefinementOutcome, RefinementReport};
pub use types::{CameraIntrinsics, ImageSize, ObjectTemplate, Pose, View};
