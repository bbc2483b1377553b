use argh::FromArgs;
use serde::Serialize;
use std::path::PathBuf;

use kornia_calib::synthetic::SyntheticScene;
use kornia_calib::{
    calibrate, io, CalibrationConfig, CalibrationResult, CameraIntrinsics, Distortion,
    DistortionModel, ImageSize, Refinement, View,
};

#[derive(FromArgs)]
/// Calibrate a camera from planar target correspondences and print the model as JSON
struct Args {
    /// path to a correspondence file: "width height N", then per view M, M image and M object
    /// points
    #[argh(option, short = 'd')]
    data: Option<PathBuf>,

    /// calibrate a generated scene instead of reading a file
    #[argh(switch)]
    synthetic: bool,

    /// number of views of the generated scene
    #[argh(option, default = "10")]
    views: usize,

    /// uniform pixel noise added to the generated scene
    #[argh(option, default = "0.2")]
    noise: f64,

    /// seed of the generated noise
    #[argh(option, default = "0")]
    seed: u64,

    /// distortion model: radial2, radial3 or radial-tangential
    #[argh(option, default = "DistortionModel::Radial2", from_str_fn(parse_model))]
    model: DistortionModel,

    /// refine the poses together with the intrinsics
    #[argh(switch)]
    joint: bool,

    /// skip the nonlinear refinement
    #[argh(switch)]
    closed_form: bool,

    /// maximum number of refinement iterations
    #[argh(option, default = "50")]
    max_iterations: usize,
}

fn parse_model(value: &str) -> Result<DistortionModel, String> {
    match value {
        "radial2" => Ok(DistortionModel::Radial2),
        "radial3" => Ok(DistortionModel::Radial3),
        "radial-tangential" => Ok(DistortionModel::RadialTangential),
        other => Err(format!("unknown distortion model '{other}'")),
    }
}

#[derive(Serialize)]
struct CalibrationOutput {
    success: bool,
    rms: f64,
    camera_matrix: [[f64; 3]; 3],
    dist_coeffs: [f64; 5],
    rvecs: Vec<[f64; 3]>,
    tvecs: Vec<[f64; 3]>,
    #[serde(rename = "perViewErrors")]
    per_view_errors: Vec<f64>,
}

impl From<&CalibrationResult> for CalibrationOutput {
    fn from(result: &CalibrationResult) -> Self {
        Self {
            success: true,
            rms: result.rms,
            camera_matrix: result.intrinsics.k_matrix(),
            dist_coeffs: result.distortion.coefficients(),
            rvecs: result.poses.iter().map(|p| p.rvec()).collect(),
            tvecs: result.poses.iter().map(|p| p.translation).collect(),
            per_view_errors: result.per_view_errors.clone(),
        }
    }
}

#[derive(Serialize)]
struct FailureOutput {
    success: bool,
    error: String,
}

fn load_views(args: &Args) -> Result<(Vec<View>, ImageSize), Box<dyn std::error::Error>> {
    if let Some(path) = &args.data {
        let dataset = io::read_dataset(path)?;
        log::info!(
            "loaded {} views from {}",
            dataset.views.len(),
            path.display()
        );
        return Ok((dataset.views, dataset.image_size));
    }

    if args.synthetic {
        let intrinsics = CameraIntrinsics {
            fx: 800.0,
            fy: 800.0,
            cx: 320.0,
            cy: 240.0,
            skew: 0.0,
        };
        let distortion = Distortion {
            k1: -0.1,
            k2: 0.01,
            ..Default::default()
        };
        let scene = SyntheticScene::new(intrinsics, distortion, args.views)
            .with_noise(args.noise, args.seed);
        log::info!(
            "generated {} synthetic views, ground truth {:?}",
            scene.views.len(),
            scene.intrinsics
        );
        return Ok((scene.views, scene.image_size));
    }

    Err("either --data or --synthetic is required".into())
}

fn run(args: &Args) -> Result<CalibrationResult, Box<dyn std::error::Error>> {
    let (views, image_size) = load_views(args)?;

    let refinement = if args.closed_form {
        Refinement::ClosedFormOnly
    } else if args.joint {
        Refinement::Joint
    } else {
        Refinement::IntrinsicsOnly
    };

    let config = CalibrationConfig::default()
        .with_distortion_model(args.model)
        .with_refinement(refinement)
        .with_max_iterations(args.max_iterations);

    Ok(calibrate(&views, image_size, &config)?)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Args = argh::from_env();

    match run(&args) {
        Ok(result) => {
            if result.is_fallback() {
                log::warn!("refinement did not succeed, reporting the closed-form model");
            }
            println!(
                "{}",
                serde_json::to_string_pretty(&CalibrationOutput::from(&result))?
            );
            Ok(())
        }
        Err(err) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&FailureOutput {
                    success: false,
                    error: err.to_string(),
                })?
            );
            std::process::exit(1);
        }
    }
}
