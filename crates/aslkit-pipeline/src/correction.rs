//! Single-pass application of motion and distortion corrections.
//!
//! All corrections that can be expressed as a rigid pre-transform followed
//! by a warp are collected in a [`CorrectionSet`] and applied in one
//! resampling, so the data is interpolated only once. The blip-reversed
//! susceptibility correction is applied afterwards as a separate pass
//! without Jacobian intensity correction.

use aslkit_core::{
    CombinedWarp, Grid, Image, LinearInterpolator, ResampleConfig, ResampleImageFilter, RigidTransform, Series, Space,
    Volume, WarpField,
};
use burn::tensor::backend::Backend;
use tracing::debug;

use crate::distortion::{
    combine_distortion_warps, estimate_blip_correction, BlipCorrection, PhaseEncodeDirection,
};
use crate::error::{PipelineError, Result};
use crate::external::SusceptibilityEstimation;
use crate::log::RunLog;
use crate::motion::MotionCorrection;

/// Collects corrections before they are frozen into a [`CorrectionSet`].
pub struct CorrectionSetBuilder<B: Backend> {
    reference: Grid,
    motion: Option<MotionCorrection>,
    fieldmap_warp: Option<WarpField<B>>,
    gradient_warp: Option<WarpField<B>>,
    blip: Option<BlipCorrection<B>>,
    blip_encoding: Option<(PhaseEncodeDirection, f64)>,
    sensitivity: Option<Volume<B>>,
    sensitivity_disabled: bool,
    resample: ResampleConfig,
}

impl<B: Backend> CorrectionSetBuilder<B> {
    /// Start a set resampling onto the ASL grid `reference`.
    pub fn new(reference: Grid) -> Self {
        Self {
            reference,
            motion: None,
            fieldmap_warp: None,
            gradient_warp: None,
            blip: None,
            blip_encoding: None,
            sensitivity: None,
            sensitivity_disabled: false,
            resample: ResampleConfig::default(),
        }
    }

    pub fn with_motion(mut self, motion: Option<MotionCorrection>) -> Self {
        self.motion = motion;
        self
    }

    /// Fieldmap warp already in ASL space.
    pub fn with_fieldmap_warp(mut self, warp: Option<WarpField<B>>) -> Self {
        self.fieldmap_warp = warp;
        self
    }

    /// User-supplied gradient nonlinearity warp in ASL space.
    pub fn with_gradient_warp(mut self, warp: Option<WarpField<B>>) -> Self {
        self.gradient_warp = warp;
        self
    }

    /// A blip correction estimated beforehand.
    pub fn with_blip(mut self, blip: Option<BlipCorrection<B>>) -> Self {
        self.blip = blip;
        self
    }

    /// Estimate the blip correction from the corrected calibration pair
    /// during [`CorrectionSet::apply_corrections`].
    pub fn with_blip_encoding(mut self, encoding: Option<(PhaseEncodeDirection, f64)>) -> Self {
        self.blip_encoding = encoding;
        self
    }

    pub fn with_sensitivity(mut self, field: Option<Volume<B>>, disabled: bool) -> Self {
        self.sensitivity = field;
        self.sensitivity_disabled = disabled;
        self
    }

    pub fn with_resample_config(mut self, config: ResampleConfig) -> Self {
        self.resample = config;
        self
    }

    /// Combine the distortion warps and freeze the set.
    pub fn build(self, log: &mut RunLog) -> Result<CorrectionSet<B>> {
        for warp in [&self.fieldmap_warp, &self.gradient_warp].into_iter().flatten() {
            if warp.destination() != &Space::NativeAsl {
                return Err(aslkit_core::CoreError::space_mismatch(&Space::NativeAsl, warp.destination()).into());
            }
        }
        if let Some(field) = &self.sensitivity {
            if field.spatial_shape() != self.reference.shape() {
                return Err(aslkit_core::CoreError::shape_mismatch(&self.reference.shape(), &field.spatial_shape()).into());
            }
        }
        let combined = combine_distortion_warps(
            self.fieldmap_warp.as_ref(),
            self.gradient_warp.as_ref(),
            &self.reference,
            log,
        )?;
        Ok(CorrectionSet {
            reference: self.reference,
            motion: self.motion,
            fieldmap_warp: self.fieldmap_warp,
            gradient_warp: self.gradient_warp,
            combined,
            blip: self.blip,
            blip_encoding: self.blip_encoding,
            sensitivity: self.sensitivity,
            sensitivity_disabled: self.sensitivity_disabled,
            resample: self.resample,
        })
    }
}

/// Immutable snapshot of every correction to apply.
#[derive(Debug, Clone)]
pub struct CorrectionSet<B: Backend> {
    reference: Grid,
    motion: Option<MotionCorrection>,
    fieldmap_warp: Option<WarpField<B>>,
    gradient_warp: Option<WarpField<B>>,
    combined: Option<CombinedWarp<B>>,
    blip: Option<BlipCorrection<B>>,
    blip_encoding: Option<(PhaseEncodeDirection, f64)>,
    sensitivity: Option<Volume<B>>,
    sensitivity_disabled: bool,
    resample: ResampleConfig,
}

/// Uncorrected images, borrowed from the run inputs.
pub struct UncorrectedData<'a, B: Backend> {
    pub asl: &'a Series<B>,
    pub calib: Option<&'a Volume<B>>,
    pub cref: Option<&'a Volume<B>>,
    pub cblip: Option<&'a Volume<B>>,
}

/// Corrected images in ASL space.
#[derive(Debug, Clone)]
pub struct CorrectedData<B: Backend> {
    pub asl: Series<B>,
    pub calib: Option<Volume<B>>,
    pub cref: Option<Volume<B>>,
    pub cblip: Option<Volume<B>>,
    /// Copies taken before the blip pass (`*_pretopup`).
    pub asl_pre_blip: Option<Series<B>>,
    pub calib_pre_blip: Option<Volume<B>>,
    pub cblip_pre_blip: Option<Volume<B>>,
    /// Blip correction used, whether supplied or estimated here.
    pub blip: Option<BlipCorrection<B>>,
    /// False when there was nothing to apply and the inputs were passed through.
    pub resampled: bool,
}

impl<B: Backend> CorrectionSet<B> {
    pub fn reference(&self) -> &Grid {
        &self.reference
    }

    pub fn motion(&self) -> Option<&MotionCorrection> {
        self.motion.as_ref()
    }

    pub fn fieldmap_warp(&self) -> Option<&WarpField<B>> {
        self.fieldmap_warp.as_ref()
    }

    pub fn gradient_warp(&self) -> Option<&WarpField<B>> {
        self.gradient_warp.as_ref()
    }

    pub fn combined_warp(&self) -> Option<&WarpField<B>> {
        self.combined.as_ref().map(|c| &c.warp)
    }

    pub fn jacobian(&self) -> Option<&Volume<B>> {
        self.combined.as_ref().map(|c| &c.jacobian)
    }

    pub fn blip(&self) -> Option<&BlipCorrection<B>> {
        self.blip.as_ref()
    }

    pub fn sensitivity(&self) -> Option<&Volume<B>> {
        self.sensitivity.as_ref()
    }

    /// Resample a volume onto the reference grid through `premat` and the
    /// combined warp, then scale by the Jacobian.
    pub fn correct_img(&self, target: &Volume<B>, premat: Option<&RigidTransform>) -> Result<Volume<B>> {
        if let Some(premat) = premat {
            if premat.destination() != &Space::NativeAsl {
                return Err(aslkit_core::CoreError::space_mismatch(&Space::NativeAsl, premat.destination()).into());
            }
        }
        let corrected = ResampleImageFilter::new(self.reference.clone(), LinearInterpolator::new())
            .with_warp(self.combined_warp())
            .with_premat(premat.cloned())
            .with_config(self.resample)
            .apply(target)?;
        match self.jacobian() {
            Some(jacobian) => Ok(corrected.mul_field(jacobian)?),
            None => Ok(corrected),
        }
    }

    /// Correct every volume of a series with its own pre-transform.
    pub fn correct_series(&self, target: &Series<B>, premats: Option<&[RigidTransform]>) -> Result<Series<B>> {
        let n = target.num_volumes();
        if let Some(premats) = premats {
            if premats.len() != n {
                return Err(aslkit_core::CoreError::shape_mismatch(&[n], &[premats.len()]).into());
            }
        }
        let volumes = (0..n)
            .map(|t| {
                let premat = premats.map(|p| &p[t]);
                self.correct_img(&target.volume(t)?, premat)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Series::from_volumes(target.name(), &volumes)?)
    }

    /// Divide each image by the sensitivity field. Images pass through
    /// unchanged when there is no field or correction is disabled.
    pub fn apply_sensitivity_correction<const D: usize>(
        &self,
        images: &[Image<B, D>],
        log: &mut RunLog,
    ) -> Result<Vec<Image<B, D>>> {
        match (&self.sensitivity, self.sensitivity_disabled) {
            (Some(field), false) => {
                log.info("Applying sensitivity correction");
                images
                    .iter()
                    .map(|image| image.div_field(field).map_err(PipelineError::from))
                    .collect()
            }
            _ => Ok(images.to_vec()),
        }
    }

    /// Apply every correction to the ASL series and calibration images.
    ///
    /// The ASL series uses the per-volume motion transforms; calibration
    /// images use the calibration-to-ASL transform from motion correction.
    /// When there is neither motion nor a combined warp the inputs are
    /// returned unchanged and the blip pass is skipped.
    pub fn apply_corrections(
        &self,
        data: &UncorrectedData<'_, B>,
        susceptibility: &dyn SusceptibilityEstimation<B>,
        log: &mut RunLog,
    ) -> Result<CorrectedData<B>> {
        log.info("Applying corrections to data");
        if self.motion.is_some() {
            log.info(" - Using motion correction");
        }
        if self.fieldmap_warp.is_some() {
            log.info(" - Using fieldmap distortion correction");
        }
        if self.gradient_warp.is_some() {
            log.info(" - Using user-supplied GDC warp");
        }

        if self.motion.is_none() && self.combined.is_none() {
            log.info(" - No corrections to apply");
            return Ok(CorrectedData {
                asl: data.asl.clone(),
                calib: data.calib.cloned(),
                cref: data.cref.cloned(),
                cblip: data.cblip.cloned(),
                asl_pre_blip: None,
                calib_pre_blip: None,
                cblip_pre_blip: None,
                blip: None,
                resampled: false,
            });
        }

        log.info(" - Applying corrections to ASL data");
        let motion_transforms = self.motion.as_ref().map(|m| m.transforms.as_slice());
        let mut asl = self.correct_series(data.asl, motion_transforms)?;

        let calib_premat = self.motion.as_ref().and_then(|m| m.reference_to_series.as_ref());
        let (mut calib, mut cref, mut cblip) = (None, None, None);
        if let Some(image) = data.calib {
            log.info(" - Applying corrections to calibration data");
            calib = Some(self.correct_img(image, calib_premat)?);
            cref = data.cref.map(|img| self.correct_img(img, calib_premat)).transpose()?;
            cblip = data.cblip.map(|img| self.correct_img(img, calib_premat)).transpose()?;
        }

        let blip = match (&self.blip, self.blip_encoding, &calib, &cblip) {
            (Some(blip), _, _, _) => Some(blip.clone()),
            (None, Some(encoding), Some(calib), Some(cblip)) => {
                let [_, z, y, x] = asl.shape();
                Some(estimate_blip_correction(calib, cblip, [x, y, z], encoding, susceptibility, log)?)
            }
            (None, Some(_), _, _) => {
                log.warn("Blip correction requested but the calibration image or its reversed-PE pair is missing");
                None
            }
            _ => None,
        };

        let (mut asl_pre_blip, mut calib_pre_blip, mut cblip_pre_blip) = (None, None, None);
        if let Some(blip) = &blip {
            log.info(" - Adding TOPUP distortion correction");
            let unwarp_volume = |image: &Volume<B>, index: usize| -> Result<Volume<B>> {
                let single = Series::from_volumes(image.name(), std::slice::from_ref(image))?;
                let corrected = susceptibility.apply_field_correction(&single, &blip.result, &blip.params, index)?;
                Ok(corrected.volume(0)?.renamed(image.name()))
            };
            if let Some(image) = calib.take() {
                calib = Some(unwarp_volume(&image, 1)?);
                calib_pre_blip = Some(image.renamed(format!("{}_pretopup", image.name())));
            }
            if let Some(image) = cblip.take() {
                cblip = Some(unwarp_volume(&image, 2)?);
                cblip_pre_blip = Some(image.renamed(format!("{}_pretopup", image.name())));
            }
            if let Some(image) = cref.take() {
                cref = Some(unwarp_volume(&image, 1)?);
            }
            let corrected = susceptibility.apply_field_correction(&asl, &blip.result, &blip.params, 1)?;
            let pre = std::mem::replace(&mut asl, corrected.renamed(data.asl.name()));
            asl_pre_blip = Some(pre.renamed(format!("{}_pretopup", data.asl.name())));
        }
        debug!(blip = blip.is_some(), "Corrections applied");

        Ok(CorrectedData {
            asl,
            calib,
            cref,
            cblip,
            asl_pre_blip,
            calib_pre_blip,
            cblip_pre_blip,
            blip,
            resampled: true,
        })
    }
}
