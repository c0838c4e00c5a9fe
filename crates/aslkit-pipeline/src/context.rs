//! Per-run inputs and the append-only record of stage results.
//!
//! Stages never mutate the context directly. Each returns a [`StageDelta`]
//! that the pipeline merges; a stage can be merged only once, and a failed
//! stage produces no delta, so the context never holds partial results.

use std::collections::BTreeSet;
use std::fmt;

use aslkit_core::{Grid, RigidTransform, Series, Volume, WarpField};
use burn::tensor::backend::Backend;
use tracing::debug;

use crate::correction::{CorrectedData, CorrectionSet};
use crate::distortion::FieldmapCorrection;
use crate::error::{PipelineError, Result};
use crate::external::{FieldmapImages, Segmentation};
use crate::motion::MotionCorrection;
use crate::pvc::{FitResultSet, FitStage, PartialVolumeMaps};
use crate::sensitivity::SensitivityEstimate;

/// Structural image with and without skull.
#[derive(Debug, Clone)]
pub struct StructuralImages<B: Backend> {
    pub head: Volume<B>,
    pub brain: Volume<B>,
}

/// Images supplied for a run.
#[derive(Debug, Clone)]
pub struct RunInputs<B: Backend> {
    pub asl: Series<B>,
    pub calib: Option<Volume<B>>,
    /// Calibration reference image, acquired with the body coil.
    pub cref: Option<Volume<B>>,
    /// Calibration image with reversed phase encoding.
    pub cblip: Option<Volume<B>>,
    pub structural: Option<StructuralImages<B>>,
    pub fieldmap: Option<FieldmapImages<B>>,
    /// Gradient nonlinearity warp in ASL space.
    pub gradient_warp: Option<WarpField<B>>,
    pub sensitivity: Option<Volume<B>>,
    pub pv_maps: Option<PartialVolumeMaps<B>>,
    /// Analysis mask in ASL space.
    pub mask: Option<Volume<B>>,
    /// Reference tissue mask in ASL space, for reference region calibration.
    pub reference_mask: Option<Volume<B>>,
}

impl<B: Backend> RunInputs<B> {
    pub fn new(asl: Series<B>) -> Self {
        Self {
            asl,
            calib: None,
            cref: None,
            cblip: None,
            structural: None,
            fieldmap: None,
            gradient_warp: None,
            sensitivity: None,
            pv_maps: None,
            mask: None,
            reference_mask: None,
        }
    }

    pub fn with_calib(mut self, calib: Volume<B>) -> Self {
        self.calib = Some(calib);
        self
    }

    pub fn with_cref(mut self, cref: Volume<B>) -> Self {
        self.cref = Some(cref);
        self
    }

    pub fn with_cblip(mut self, cblip: Volume<B>) -> Self {
        self.cblip = Some(cblip);
        self
    }

    pub fn with_structural(mut self, head: Volume<B>, brain: Volume<B>) -> Self {
        self.structural = Some(StructuralImages { head, brain });
        self
    }

    pub fn with_fieldmap(mut self, fieldmap: FieldmapImages<B>) -> Self {
        self.fieldmap = Some(fieldmap);
        self
    }

    pub fn with_gradient_warp(mut self, warp: WarpField<B>) -> Self {
        self.gradient_warp = Some(warp);
        self
    }

    pub fn with_sensitivity(mut self, field: Volume<B>) -> Self {
        self.sensitivity = Some(field);
        self
    }

    pub fn with_pv_maps(mut self, maps: PartialVolumeMaps<B>) -> Self {
        self.pv_maps = Some(maps);
        self
    }

    pub fn with_mask(mut self, mask: Volume<B>) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn with_reference_mask(mut self, mask: Volume<B>) -> Self {
        self.reference_mask = Some(mask);
        self
    }

    /// Grid of the ASL series, the reference grid for every correction.
    pub fn asl_grid(&self) -> Grid {
        self.asl.grid()
    }
}

/// Stages whose results are recorded in the context.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Segmentation,
    Motion,
    Distortion,
    Sensitivity,
    Corrections,
    Registration,
    Fit(FitStage),
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Segmentation => f.write_str("segmentation"),
            Stage::Motion => f.write_str("motion"),
            Stage::Distortion => f.write_str("distortion"),
            Stage::Sensitivity => f.write_str("sensitivity"),
            Stage::Corrections => f.write_str("corrections"),
            Stage::Registration => f.write_str("registration"),
            Stage::Fit(stage) => write!(f, "fit {stage}"),
        }
    }
}

/// Result of one stage, merged into the context by the pipeline.
#[derive(Debug, Clone)]
pub enum StageDelta<B: Backend> {
    Segmentation(Segmentation<B>),
    /// `None` when motion correction was not requested.
    Motion(Option<MotionCorrection>),
    Distortion(Option<FieldmapCorrection<B>>),
    Sensitivity(SensitivityEstimate<B>),
    Corrections {
        set: CorrectionSet<B>,
        data: CorrectedData<B>,
    },
    /// ASL to structural transform from re-registration.
    Registration(RigidTransform),
    Fit(FitResultSet<B>),
}

impl<B: Backend> StageDelta<B> {
    pub fn stage(&self) -> Stage {
        match self {
            StageDelta::Segmentation(_) => Stage::Segmentation,
            StageDelta::Motion(_) => Stage::Motion,
            StageDelta::Distortion(_) => Stage::Distortion,
            StageDelta::Sensitivity(_) => Stage::Sensitivity,
            StageDelta::Corrections { .. } => Stage::Corrections,
            StageDelta::Registration(_) => Stage::Registration,
            StageDelta::Fit(result) => Stage::Fit(result.stage.clone()),
        }
    }
}

/// Everything known about a run so far.
#[derive(Debug, Clone)]
pub struct RunContext<B: Backend> {
    inputs: RunInputs<B>,
    segmentation: Option<Segmentation<B>>,
    motion: Option<MotionCorrection>,
    fieldmap: Option<FieldmapCorrection<B>>,
    sensitivity: Option<SensitivityEstimate<B>>,
    corrections: Option<CorrectionSet<B>>,
    corrected: Option<CorrectedData<B>>,
    registration: Option<RigidTransform>,
    fits: Vec<FitResultSet<B>>,
    completed: BTreeSet<Stage>,
}

impl<B: Backend> RunContext<B> {
    pub fn new(inputs: RunInputs<B>) -> Self {
        Self {
            inputs,
            segmentation: None,
            motion: None,
            fieldmap: None,
            sensitivity: None,
            corrections: None,
            corrected: None,
            registration: None,
            fits: Vec::new(),
            completed: BTreeSet::new(),
        }
    }

    /// Record a stage result.
    ///
    /// # Errors
    /// [`PipelineError::StageAlreadyCompleted`] when the stage was merged
    /// before; the context is left unchanged.
    pub fn merge(&mut self, delta: StageDelta<B>) -> Result<()> {
        let stage = delta.stage();
        if self.completed.contains(&stage) {
            return Err(PipelineError::StageAlreadyCompleted(stage.to_string()));
        }
        debug!(%stage, "Merging stage result");
        match delta {
            StageDelta::Segmentation(segmentation) => self.segmentation = Some(segmentation),
            StageDelta::Motion(motion) => self.motion = motion,
            StageDelta::Distortion(fieldmap) => self.fieldmap = fieldmap,
            StageDelta::Sensitivity(estimate) => self.sensitivity = Some(estimate),
            StageDelta::Corrections { set, data } => {
                self.corrections = Some(set);
                self.corrected = Some(data);
            }
            StageDelta::Registration(transform) => self.registration = Some(transform),
            StageDelta::Fit(result) => self.fits.push(result),
        }
        self.completed.insert(stage);
        Ok(())
    }

    pub fn is_completed(&self, stage: &Stage) -> bool {
        self.completed.contains(stage)
    }

    pub fn completed(&self) -> &BTreeSet<Stage> {
        &self.completed
    }

    pub fn inputs(&self) -> &RunInputs<B> {
        &self.inputs
    }

    pub fn segmentation(&self) -> Option<&Segmentation<B>> {
        self.segmentation.as_ref()
    }

    pub fn motion(&self) -> Option<&MotionCorrection> {
        self.motion.as_ref()
    }

    pub fn fieldmap(&self) -> Option<&FieldmapCorrection<B>> {
        self.fieldmap.as_ref()
    }

    pub fn sensitivity(&self) -> Option<&SensitivityEstimate<B>> {
        self.sensitivity.as_ref()
    }

    pub fn corrections(&self) -> Option<&CorrectionSet<B>> {
        self.corrections.as_ref()
    }

    pub fn corrected(&self) -> Option<&CorrectedData<B>> {
        self.corrected.as_ref()
    }

    /// Latest ASL to structural transform: re-registration, else the one
    /// found during fieldmap correction.
    pub fn asl_to_structural(&self) -> Option<&RigidTransform> {
        self.registration
            .as_ref()
            .or_else(|| self.fieldmap.as_ref().map(|f| &f.asl_to_structural))
    }

    /// Fit results in the order they ran.
    pub fn fits(&self) -> &[FitResultSet<B>] {
        &self.fits
    }

    pub fn fit(&self, stage: &FitStage) -> Option<&FitResultSet<B>> {
        self.fits.iter().find(|f| &f.stage == stage)
    }

    /// ASL series to fit: corrected when corrections have run.
    pub fn asl(&self) -> &Series<B> {
        self.corrected.as_ref().map(|c| &c.asl).unwrap_or(&self.inputs.asl)
    }

    /// Calibration image to use: corrected when corrections have run.
    pub fn calib(&self) -> Option<&Volume<B>> {
        match &self.corrected {
            Some(corrected) => corrected.calib.as_ref(),
            None => self.inputs.calib.as_ref(),
        }
    }
}
