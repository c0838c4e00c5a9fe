//! Pipeline configuration.

use aslkit_core::ResampleConfig;
use serde::{Deserialize, Serialize};

use crate::asl::AslOrder;
use crate::calibration::{CalibrationConfig, CalibrationMethod, TissueType};
use crate::distortion::DistortionConfig;
use crate::error::{PipelineError, Result};
use crate::pvc::PvcConfig;
use crate::sensitivity::SensitivityConfig;

/// Options for every stage of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub asl_order: AslOrder,
    /// Estimate and correct motion of the ASL series.
    pub motion_correction: bool,
    pub distortion: DistortionConfig,
    pub sensitivity: SensitivityConfig,
    pub resample: ResampleConfig,
    pub calibration: CalibrationConfig,
    pub pvc: PvcConfig,
}

impl PipelineConfig {
    /// Parse from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    /// [`PipelineError::InvalidMethod`] or [`PipelineError::InvalidTissueType`]
    /// for an unknown calibration method or tissue string, and
    /// [`PipelineError::InvalidConfiguration`] for anything else that does
    /// not parse.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| PipelineError::invalid_configuration(e.to_string()))?;
        if let Some(calibration) = value.get("calibration") {
            if let Some(method) = calibration.get("method").and_then(|v| v.as_str()) {
                method.parse::<CalibrationMethod>()?;
            }
            if let Some(tissue) = calibration.get("tissue").and_then(|v| v.as_str()) {
                tissue.parse::<TissueType>()?;
            }
        }
        serde_json::from_value(value).map_err(|e| PipelineError::invalid_configuration(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| PipelineError::invalid_configuration(e.to_string()))
    }

    pub fn with_asl_order(mut self, order: AslOrder) -> Self {
        self.asl_order = order;
        self
    }

    pub fn with_motion_correction(mut self, enabled: bool) -> Self {
        self.motion_correction = enabled;
        self
    }

    pub fn with_distortion(mut self, distortion: DistortionConfig) -> Self {
        self.distortion = distortion;
        self
    }

    pub fn with_sensitivity(mut self, sensitivity: SensitivityConfig) -> Self {
        self.sensitivity = sensitivity;
        self
    }

    pub fn with_resample(mut self, resample: ResampleConfig) -> Self {
        self.resample = resample;
        self
    }

    pub fn with_calibration(mut self, calibration: CalibrationConfig) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn with_pvc(mut self, pvc: PvcConfig) -> Self {
        self.pvc = pvc;
        self
    }
}
