use thiserror::Error;

/// Errors that abort a calibration run before any result is produced.
///
/// Numerical trouble inside the refinement stage is never reported here; it is
/// signalled through [`crate::RMS_SENTINEL`] on the returned result instead.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CalibrationError {
    /// The input violates the engine contract or is numerically degenerate.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Not enough views, or not enough views with distinct orientations.
    #[error(
        "Calibration requires at least {required} views with distinct orientations, got {actual}"
    )]
    InsufficientViews {
        /// Minimum number of usable views.
        required: usize,
        /// Number of usable views found.
        actual: usize,
    },
}

impl CalibrationError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }
}
