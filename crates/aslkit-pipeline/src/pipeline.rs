//! Orchestration of a complete run.
//!
//! Stages run in a fixed order: motion, distortion, sensitivity, the
//! single-pass correction, then the model fits. Each stage reads the
//! [`RunContext`], returns a [`StageDelta`] and the pipeline merges it. A
//! stage that has already completed is skipped.

use aslkit_core::{LinearInterpolator, ResampleImageFilter, RigidTransform, Space, Supersampling, Volume};
use burn::tensor::backend::Backend;
use tracing::info;

use crate::asl::perfusion_weighted;
use crate::calibration::{calibrate, CalibrationMethod};
use crate::config::PipelineConfig;
use crate::context::{RunContext, RunInputs, Stage, StageDelta};
use crate::correction::{CorrectionSetBuilder, UncorrectedData};
use crate::distortion::{blip_encoding, estimate_fieldmap_correction, fieldmap_report, FieldmapInputs};
use crate::error::{PipelineError, Result};
use crate::external::{BoundaryRegistrationRequest, Collaborators, SurfacePvCapability};
use crate::log::RunLog;
use crate::motion::estimate_motion;
use crate::pvc::{fit_options, plan_fit_stages, segmentation_pv_maps, FitResultSet, FitStage};
use crate::report::{Report, ReportPage};
use crate::sensitivity::{estimate_sensitivity, SensitivityInputs, SensitivitySource};

/// A configured run over one set of inputs.
pub struct Pipeline<B: Backend> {
    config: PipelineConfig,
    collaborators: Collaborators<B>,
    context: RunContext<B>,
    fit_stages: Vec<FitStage>,
    log: RunLog,
    report: Report,
}

impl<B: Backend> Pipeline<B> {
    /// Validate the configuration against the inputs and plan the fits.
    ///
    /// # Errors
    /// Validation errors are raised here, before any stage runs:
    /// [`PipelineError::DependencyMissing`] for surface PVC without an
    /// estimator, [`PipelineError::MissingInput`] for reference region
    /// calibration without a reference mask.
    pub fn new(inputs: RunInputs<B>, config: PipelineConfig, collaborators: Collaborators<B>) -> Result<Self> {
        let mut log = RunLog::new();
        if config.calibration.method == CalibrationMethod::ReferenceRegion
            && inputs.calib.is_some()
            && inputs.reference_mask.is_none()
        {
            return Err(PipelineError::missing_input(
                "reference region calibration requires a reference mask",
            ));
        }
        let asl_shape = inputs.asl.spatial_shape();
        if let Some(maps) = &inputs.pv_maps {
            if maps.grey_matter.spatial_shape() != asl_shape {
                return Err(
                    aslkit_core::CoreError::shape_mismatch(&asl_shape, &maps.grey_matter.spatial_shape()).into(),
                );
            }
        }
        let fit_stages = plan_fit_stages(
            &config.pvc,
            inputs.pv_maps.is_some(),
            collaborators.surface_pv.is_available(),
            &mut log,
        )?;
        Ok(Self {
            config,
            collaborators,
            context: RunContext::new(inputs),
            fit_stages,
            log,
            report: Report::new(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn context(&self) -> &RunContext<B> {
        &self.context
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    pub fn report(&self) -> &Report {
        &self.report
    }

    /// Fits the run will perform, in order.
    pub fn fit_stages(&self) -> &[FitStage] {
        &self.fit_stages
    }

    pub fn into_parts(self) -> (RunContext<B>, RunLog, Report) {
        (self.context, self.log, self.report)
    }

    /// Run every stage.
    pub fn run(&mut self) -> Result<()> {
        info!(fits = self.fit_stages.len(), "Starting run");
        self.run_motion()?;
        self.run_distortion()?;
        self.run_sensitivity()?;
        self.run_corrections()?;

        let stages = self.fit_stages.clone();
        for stage in &stages {
            self.run_fit(stage)?;
            if *stage == FitStage::Plain && self.config.pvc.reregister {
                self.run_reregistration()?;
            }
        }
        self.report.add("summary", self.summary_page());
        Ok(())
    }

    /// Segment the structural image once per run. Without a structural
    /// image there is nothing to segment.
    pub fn ensure_segmentation(&mut self) -> Result<()> {
        if self.context.is_completed(&Stage::Segmentation) {
            return Ok(());
        }
        let Some(structural) = &self.context.inputs().structural else {
            return Ok(());
        };
        self.log.info("Segmenting structural image");
        let segmentation = self.collaborators.segmentation.segment_structural(&structural.brain)?;
        self.context.merge(StageDelta::Segmentation(segmentation))
    }

    pub fn run_motion(&mut self) -> Result<()> {
        if self.context.is_completed(&Stage::Motion) {
            return Ok(());
        }
        let motion = if self.config.motion_correction {
            let inputs = self.context.inputs();
            let motion = estimate_motion(
                &inputs.asl,
                inputs.calib.as_ref(),
                self.collaborators.motion.as_ref(),
                &mut self.log,
            )?;
            self.report.add("moco", motion.report_page());
            Some(motion)
        } else {
            None
        };
        self.context.merge(StageDelta::Motion(motion))
    }

    pub fn run_distortion(&mut self) -> Result<()> {
        if self.context.is_completed(&Stage::Distortion) {
            return Ok(());
        }
        if self.context.inputs().fieldmap.is_some() {
            self.ensure_segmentation()?;
        }
        let inputs = self.context.inputs();
        let pwi = match inputs.fieldmap {
            Some(_) => Some(perfusion_weighted(&inputs.asl, self.config.asl_order)?),
            None => None,
        };
        let asl_grid = inputs.asl_grid();
        let fieldmap_inputs = FieldmapInputs {
            fieldmap: inputs.fieldmap.as_ref(),
            perfusion_weighted: pwi.as_ref(),
            structural_head: inputs.structural.as_ref().map(|s| &s.head),
            structural_brain: inputs.structural.as_ref().map(|s| &s.brain),
            segmentation: self.context.segmentation(),
            asl_grid: &asl_grid,
        };
        let fieldmap = estimate_fieldmap_correction(
            &fieldmap_inputs,
            &self.config.distortion,
            self.collaborators.boundary.as_ref(),
            &mut self.log,
        )?;
        if fieldmap.is_some() {
            self.report.add("fmap", fieldmap_report(&self.config.distortion));
        }
        self.context.merge(StageDelta::Distortion(fieldmap))
    }

    /// Estimate the sensitivity field and bring it onto the ASL grid.
    pub fn run_sensitivity(&mut self) -> Result<()> {
        if self.context.is_completed(&Stage::Sensitivity) {
            return Ok(());
        }
        if self.config.sensitivity.auto && !self.config.sensitivity.disabled {
            self.ensure_segmentation()?;
        }
        let inputs = self.context.inputs();
        let sensitivity_inputs = SensitivityInputs {
            user_field: inputs.sensitivity.as_ref(),
            calib: inputs.calib.as_ref(),
            cref: inputs.cref.as_ref(),
            bias_field: self.context.segmentation().and_then(|s| s.bias_field.as_ref()),
            asl_to_structural: self.context.asl_to_structural(),
        };
        let mut estimate = estimate_sensitivity(
            &sensitivity_inputs,
            &self.config.sensitivity,
            self.collaborators.spaces.as_ref(),
            &mut self.log,
        )?;

        // calib / cref lives on the calibration grid
        let asl_grid = inputs.asl_grid();
        let premat = self.context.motion().and_then(|m| m.reference_to_series.clone());
        let needs_resampling = match (&estimate.source, &estimate.field) {
            (SensitivitySource::CalibrationReference, Some(field)) => {
                premat.is_some() || !field.grid().approx_eq(&asl_grid, 1e-4)
            }
            _ => false,
        };
        if needs_resampling {
            if let Some(field) = &estimate.field {
                let resampled = ResampleImageFilter::new(asl_grid, LinearInterpolator::new())
                    .with_premat(premat)
                    .with_config(self.config.resample.with_supersampling(Supersampling::Off))
                    .apply(field)?;
                estimate.field = Some(resampled);
            }
        }
        self.context.merge(StageDelta::Sensitivity(estimate))
    }

    /// Build the correction set and apply it to the ASL and calibration
    /// images, then divide both by the sensitivity field.
    pub fn run_corrections(&mut self) -> Result<()> {
        if self.context.is_completed(&Stage::Corrections) {
            return Ok(());
        }
        let inputs = self.context.inputs();
        let encoding = blip_encoding(inputs.cblip.is_some(), &self.config.distortion, &mut self.log);
        let set = CorrectionSetBuilder::new(inputs.asl_grid())
            .with_motion(self.context.motion().cloned())
            .with_fieldmap_warp(self.context.fieldmap().map(|f| f.warp.clone()))
            .with_gradient_warp(inputs.gradient_warp.clone())
            .with_blip_encoding(encoding)
            .with_sensitivity(
                self.context.sensitivity().and_then(|s| s.field.clone()),
                self.config.sensitivity.disabled,
            )
            .with_resample_config(self.config.resample)
            .build(&mut self.log)?;

        let uncorrected = UncorrectedData {
            asl: &inputs.asl,
            calib: inputs.calib.as_ref(),
            cref: inputs.cref.as_ref(),
            cblip: inputs.cblip.as_ref(),
        };
        let mut data = set.apply_corrections(&uncorrected, self.collaborators.susceptibility.as_ref(), &mut self.log)?;
        if let Some(blip) = &data.blip {
            self.report.add("topup", blip.report_page());
        }

        let mut asl = set.apply_sensitivity_correction(std::slice::from_ref(&data.asl), &mut self.log)?;
        if let Some(corrected) = asl.pop() {
            data.asl = corrected;
        }
        if let Some(calib) = data.calib.take() {
            data.calib = set.apply_sensitivity_correction(&[calib], &mut self.log)?.pop();
        }
        self.context.merge(StageDelta::Corrections { set, data })
    }

    /// Register the plain fit's perfusion image to the structural image.
    /// Skipped, with a log line, without a structural image or plain fit.
    pub fn run_reregistration(&mut self) -> Result<()> {
        if self.context.is_completed(&Stage::Registration) {
            return Ok(());
        }
        if self.context.inputs().structural.is_none() {
            self.log.info("No structural image - skipping re-registration");
            return Ok(());
        }
        self.ensure_segmentation()?;
        let (Some(structural), Some(segmentation), Some(fit)) = (
            self.context.inputs().structural.as_ref(),
            self.context.segmentation(),
            self.context.fit(&FitStage::Plain),
        ) else {
            self.log.info("No perfusion image - skipping re-registration");
            return Ok(());
        };
        self.log.info("Re-registering to structural image using perfusion");
        let request = BoundaryRegistrationRequest {
            moving: &fit.output.perfusion,
            structural_head: &structural.head,
            structural_brain: &structural.brain,
            white_matter_seg: &segmentation.white_matter_seg,
            fieldmap: None,
            pedir: self.config.distortion.pedir,
            echo_spacing: self.config.distortion.echo_spacing,
            skip_fieldmap_registration: false,
        };
        let result = self.collaborators.boundary.estimate_boundary_registration(&request)?;
        let transform = RigidTransform::new(result.asl_to_structural, Space::NativeAsl, Space::Structural);
        let mut page = ReportPage::new();
        page.heading("Registration using perfusion", 0);
        page.text("ASL to structural transform");
        page.matrix(transform.rows());
        self.report.add("reg", page);
        self.context.merge(StageDelta::Registration(transform))
    }

    /// Run one fit and calibrate its perfusion when a calibration image is
    /// available.
    pub fn run_fit(&mut self, stage: &FitStage) -> Result<()> {
        if self.context.is_completed(&Stage::Fit(stage.clone())) {
            return Ok(());
        }
        self.log.info(format!("Model fitting: {stage}"));
        let (pv_maps, mask) = match stage {
            FitStage::PvCorrected => {
                if self.context.inputs().pv_maps.is_none() {
                    self.ensure_segmentation()?;
                }
                let maps = segmentation_pv_maps(
                    self.context.inputs().pv_maps.as_ref(),
                    self.context.segmentation(),
                    self.collaborators.spaces.as_ref(),
                    self.context.asl_to_structural(),
                    &mut self.log,
                )?;
                (Some(maps), self.context.inputs().mask.clone())
            }
            FitStage::SurfacePvCorrected => {
                let SurfacePvCapability::Available(estimator) = &self.collaborators.surface_pv else {
                    return Err(PipelineError::dependency_missing(
                        "surface-based PVC requested but no surface PV estimator is available",
                    ));
                };
                let maps = estimator.estimate_surface_pvs(&self.context, self.config.pvc.cores)?;
                let mask = maps.tissue_mask()?;
                self.log.info(" - Analysis mask restricted to voxels with surface PV fraction above 0.01");
                (Some(maps), Some(mask))
            }
            _ => (None, self.context.inputs().mask.clone()),
        };
        let options = fit_options(stage, pv_maps, mask);
        let output = self.collaborators.fitting.fit_model(&self.context, &options)?;

        let space = stage.output_space();
        let (calibrated, calibrated_variance) = match self.context.calib() {
            Some(calib) => {
                let calib = self.to_output_space(calib, &space)?;
                let reference_mask = match &self.context.inputs().reference_mask {
                    Some(mask) => Some(self.to_output_space(mask, &space)?),
                    None => None,
                };
                let calibrated = calibrate(
                    Some(&output.perfusion),
                    Some(&calib),
                    reference_mask.as_ref(),
                    &self.config.calibration,
                    false,
                    &mut self.log,
                )?;
                let variance = match &output.perfusion_variance {
                    Some(variance) => Some(calibrate(
                        Some(variance),
                        Some(&calib),
                        reference_mask.as_ref(),
                        &self.config.calibration,
                        true,
                        &mut self.log,
                    )?),
                    None => None,
                };
                (Some(calibrated), variance)
            }
            None => {
                self.log.info(" - No calibration data - perfusion not calibrated");
                (None, None)
            }
        };

        let mut page = ReportPage::new();
        page.heading(format!("Model fit: {stage}"), 0);
        page.text(format!("Output space: {space}"));
        page.text(format!("Prefit: {}", options.prefit));
        if let Some(maps) = &options.pv_maps {
            page.text(format!("PV maps: {:?}", maps.source));
        }
        if let Some(calibrated) = &calibrated {
            if let crate::calibration::M0::Scalar(m0) = calibrated.m0 {
                page.text(format!("M0: {m0:.6}"));
            }
        }
        self.report.add(stage.identifier(), page);

        self.context.merge(StageDelta::Fit(FitResultSet {
            stage: stage.clone(),
            output,
            calibrated,
            calibrated_variance,
        }))
    }

    fn to_output_space(&self, image: &Volume<B>, space: &Space) -> Result<Volume<B>> {
        match space {
            Space::NativeAsl => Ok(image.clone()),
            other => self.collaborators.spaces.transform_to_space(
                image,
                &Space::NativeAsl,
                other,
                self.context.asl_to_structural(),
            ),
        }
    }

    fn summary_page(&self) -> ReportPage {
        let mut page = ReportPage::new();
        page.heading("Run summary", 0);
        for stage in self.context.completed() {
            page.text(format!("Completed: {stage}"));
        }
        page.heading("Fits", 1);
        for fit in self.context.fits() {
            page.text(fit.stage.identifier());
        }
        page
    }
}
