//! Sequence of model fits with and without partial volume correction.
//!
//! A run always performs the plain fit. Further fits follow in a fixed
//! order: one per requested alternate output space, a fit using PV maps
//! from segmentation or the user, and a fit using surface-derived PV maps
//! with the analysis mask restricted to tissue.

use std::collections::BTreeMap;
use std::fmt;

use aslkit_core::{RigidTransform, Space, Volume};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};

use crate::calibration::Calibrated;
use crate::error::{PipelineError, Result};
use crate::external::{FitOptions, FitOutput, Segmentation, SpaceTransformer};
use crate::log::RunLog;

/// Minimum PV fraction for a voxel to stay in the surface PVC mask.
pub const SURFACE_MIN_PV: f64 = 0.01;

/// Partial volume correction options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PvcConfig {
    /// Fit with PV maps from the structural segmentation.
    pub pv_correction: bool,
    /// Fit with surface-derived PV maps.
    pub surface_pv_correction: bool,
    /// Worker count handed to the surface PV estimator.
    pub cores: Option<usize>,
    /// Extra output spaces, each fitted separately.
    pub output_spaces: Vec<Space>,
    /// Re-register to the structural image using the plain fit's perfusion.
    pub reregister: bool,
}

impl Default for PvcConfig {
    fn default() -> Self {
        Self {
            pv_correction: false,
            surface_pv_correction: false,
            cores: None,
            output_spaces: Vec::new(),
            reregister: true,
        }
    }
}

impl PvcConfig {
    pub fn with_pv_correction(mut self, enabled: bool) -> Self {
        self.pv_correction = enabled;
        self
    }

    pub fn with_surface_pv_correction(mut self, enabled: bool) -> Self {
        self.surface_pv_correction = enabled;
        self
    }

    pub fn with_cores(mut self, cores: usize) -> Self {
        self.cores = Some(cores);
        self
    }

    pub fn with_output_space(mut self, space: Space) -> Self {
        self.output_spaces.push(space);
        self
    }

    pub fn with_reregister(mut self, reregister: bool) -> Self {
        self.reregister = reregister;
        self
    }
}

/// One model fit of the sequence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FitStage {
    Plain,
    Structural,
    Standard,
    Custom(String),
    PvCorrected,
    SurfacePvCorrected,
}

impl FitStage {
    /// Identifier under which the stage's results are recorded.
    pub fn identifier(&self) -> &'static str {
        match self {
            FitStage::Plain => "basil",
            FitStage::Structural => "basil_struc",
            FitStage::Standard => "basil_std",
            FitStage::Custom(_) => "basil_custom",
            FitStage::PvCorrected => "basil_pvcorr",
            FitStage::SurfacePvCorrected => "basil_surf_pvcorr",
        }
    }

    /// Space the fit's outputs are produced in.
    pub fn output_space(&self) -> Space {
        match self {
            FitStage::Structural => Space::Structural,
            FitStage::Standard => Space::Standard,
            FitStage::Custom(name) => Space::Custom(name.clone()),
            FitStage::Plain | FitStage::PvCorrected | FitStage::SurfacePvCorrected => Space::NativeAsl,
        }
    }

    /// PV fits are initialised without a non-PV prefit.
    pub fn prefit(&self) -> bool {
        !matches!(self, FitStage::PvCorrected | FitStage::SurfacePvCorrected)
    }

    fn for_output_space(space: &Space) -> Result<Self> {
        match space {
            Space::Structural => Ok(FitStage::Structural),
            Space::Standard => Ok(FitStage::Standard),
            Space::Custom(name) => Ok(FitStage::Custom(name.clone())),
            other => Err(PipelineError::invalid_configuration(format!(
                "'{other}' is not an alternate output space"
            ))),
        }
    }
}

impl fmt::Display for FitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitStage::Custom(name) => write!(f, "{} ({name})", self.identifier()),
            _ => f.write_str(self.identifier()),
        }
    }
}

/// Where a pair of PV maps came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PvSource {
    Segmentation,
    Surface,
    UserSupplied,
}

/// Grey and white matter fractions in ASL space.
#[derive(Debug, Clone)]
pub struct PartialVolumeMaps<B: Backend> {
    pub grey_matter: Volume<B>,
    pub white_matter: Volume<B>,
    pub source: PvSource,
}

impl<B: Backend> PartialVolumeMaps<B> {
    /// Pair two maps on the same grid.
    pub fn new(grey_matter: Volume<B>, white_matter: Volume<B>, source: PvSource) -> Result<Self> {
        if grey_matter.spatial_shape() != white_matter.spatial_shape() {
            return Err(
                aslkit_core::CoreError::shape_mismatch(&grey_matter.spatial_shape(), &white_matter.spatial_shape())
                    .into(),
            );
        }
        Ok(Self {
            grey_matter,
            white_matter,
            source,
        })
    }

    /// Voxels where either fraction exceeds [`SURFACE_MIN_PV`], as a 0/1 volume.
    pub fn tissue_mask(&self) -> Result<Volume<B>> {
        let gm = self.grey_matter.data().clone().greater_elem(SURFACE_MIN_PV).float();
        let wm = self.white_matter.data().clone().greater_elem(SURFACE_MIN_PV).float();
        let mask = (gm + wm).clamp_max(1.0);
        Ok(self.grey_matter.with_data(mask)?.renamed("mask_surf_pvcorr"))
    }
}

/// Results of one fit, with the calibrated perfusion when a calibration
/// image was available.
#[derive(Debug, Clone)]
pub struct FitResultSet<B: Backend> {
    pub stage: FitStage,
    pub output: FitOutput<B>,
    pub calibrated: Option<Calibrated<B>>,
    pub calibrated_variance: Option<Calibrated<B>>,
}

/// Ordered fit stages for a run.
///
/// # Errors
/// [`PipelineError::DependencyMissing`] when surface PVC is requested but
/// no surface PV estimator is available, and
/// [`PipelineError::InvalidConfiguration`] for an output space that is not
/// structural, standard or custom, or for two output spaces sharing a
/// stage identifier (at most one custom space).
pub fn plan_fit_stages(
    config: &PvcConfig,
    has_user_pv_maps: bool,
    surface_available: bool,
    log: &mut RunLog,
) -> Result<Vec<FitStage>> {
    if config.surface_pv_correction && !surface_available {
        return Err(PipelineError::dependency_missing(
            "surface-based PVC requested but no surface PV estimator is available",
        ));
    }
    let mut stages = vec![FitStage::Plain];
    for space in &config.output_spaces {
        let stage = FitStage::for_output_space(space)?;
        if stages.iter().any(|s| s.identifier() == stage.identifier()) {
            return Err(PipelineError::invalid_configuration(format!(
                "output space '{space}' would be fitted twice as '{}'",
                stage.identifier()
            )));
        }
        stages.push(stage);
    }
    if config.pv_correction || has_user_pv_maps {
        if has_user_pv_maps && !config.pv_correction {
            log.info("User-supplied PV maps found: partial volume correction enabled");
        }
        stages.push(FitStage::PvCorrected);
    }
    if config.surface_pv_correction {
        if has_user_pv_maps {
            log.warn("Performing surface based PVC ignores user-specified PV maps");
        }
        stages.push(FitStage::SurfacePvCorrected);
    }
    Ok(stages)
}

/// PV maps for the segmentation-based PV fit: the user's maps when given,
/// otherwise the segmentation's maps moved from structural into ASL space.
pub fn segmentation_pv_maps<B: Backend>(
    user: Option<&PartialVolumeMaps<B>>,
    segmentation: Option<&Segmentation<B>>,
    spaces: &dyn SpaceTransformer<B>,
    asl_to_structural: Option<&RigidTransform>,
    log: &mut RunLog,
) -> Result<PartialVolumeMaps<B>> {
    if let Some(user) = user {
        log.info("Using user-supplied PV estimates");
        return Ok(user.clone());
    }
    let segmentation = segmentation
        .ok_or_else(|| PipelineError::missing_input("partial volume correction requires a structural image"))?;
    log.info("Using PV estimates from structural segmentation");
    let to_asl = |image: &Volume<B>| {
        spaces.transform_to_space(image, &Space::Structural, &Space::NativeAsl, asl_to_structural)
    };
    let grey_matter = to_asl(&segmentation.grey_matter_pv)?;
    let white_matter = to_asl(&segmentation.white_matter_pv)?;
    PartialVolumeMaps::new(
        grey_matter.renamed("gm_pv_asl"),
        white_matter.renamed("wm_pv_asl"),
        PvSource::Segmentation,
    )
}

/// Options for one fit. PV maps are only passed to PV stages.
pub fn fit_options<B: Backend>(
    stage: &FitStage,
    pv_maps: Option<PartialVolumeMaps<B>>,
    mask: Option<Volume<B>>,
) -> FitOptions<B> {
    let mut extra = BTreeMap::new();
    if let Some(maps) = &pv_maps {
        extra.insert("pgm".to_string(), maps.grey_matter.name().to_string());
        extra.insert("pwm".to_string(), maps.white_matter.name().to_string());
    }
    FitOptions {
        stage: stage.identifier().to_string(),
        prefit: stage.prefit(),
        output_space: stage.output_space(),
        pv_maps,
        mask,
        extra,
    }
}
