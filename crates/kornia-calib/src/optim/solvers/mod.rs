mod levenberg_marquardt;
mod linear_system;

pub use levenberg_marquardt::{
    LevenbergMarquardt, OptimizerError, OptimizerResult, TerminationReason,
};
pub use linear_system::{LinearSystemBuilder, VariableLayout};
