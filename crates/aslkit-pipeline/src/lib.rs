//! Correction and calibration pipeline for arterial spin labelling data.
//!
//! Motion, distortion and sensitivity corrections are estimated from the
//! input images, applied in a single resampling pass, and the fitted
//! perfusion is calibrated into physiological units. Registration, field
//! estimation, segmentation and model fitting are delegated to the
//! collaborators in [`external`].

pub mod asl;
pub mod calibration;
pub mod config;
pub mod context;
pub mod correction;
pub mod distortion;
pub mod error;
pub mod external;
pub mod log;
pub mod motion;
pub mod pipeline;
pub mod pvc;
pub mod report;
pub mod sensitivity;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use asl::AslOrder;
pub use calibration::{calibrate, CalibrationConfig, CalibrationMethod, Calibrated, TissueType, M0};
pub use config::PipelineConfig;
pub use context::{RunContext, RunInputs, Stage, StageDelta};
pub use correction::{CorrectedData, CorrectionSet, CorrectionSetBuilder};
pub use distortion::{DistortionConfig, PhaseEncodeDirection};
pub use error::{PipelineError, Result};
pub use external::Collaborators;
pub use log::RunLog;
pub use motion::{estimate_motion, MotionCorrection};
pub use pipeline::Pipeline;
pub use pvc::{FitStage, PartialVolumeMaps, PvSource, PvcConfig};
pub use report::Report;
pub use sensitivity::SensitivityConfig;
